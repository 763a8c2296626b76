//! IOCTL surface (spec C8): a narrow key/value sideband for runtime knobs.
//! Recognized keys: `release_free_memory` (trigger an allocator purge via
//! [`crate::alloc_hooks`]), a TCMalloc aggressive-decommit toggle, and
//! `trace.connection.<id>` for a per-connection tracing mask. Unknown keys
//! are `EINVAL`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::alloc_hooks;
use crate::status::Status;

const RELEASE_FREE_MEMORY: &str = "release_free_memory";
const TCMALLOC_AGGRESSIVE_DECOMMIT: &str = "tcmalloc.aggressive_memory_decommit";
const TRACE_CONNECTION_PREFIX: &str = "trace.connection.";

enum IoctlKey {
    ReleaseFreeMemory,
    TcmallocAggressiveDecommit,
    TraceConnection(u64),
}

fn parse_key(name: &str) -> Option<IoctlKey> {
    if name == RELEASE_FREE_MEMORY {
        return Some(IoctlKey::ReleaseFreeMemory);
    }
    if name == TCMALLOC_AGGRESSIVE_DECOMMIT {
        return Some(IoctlKey::TcmallocAggressiveDecommit);
    }
    if let Some(id_str) = name.strip_prefix(TRACE_CONNECTION_PREFIX) {
        return id_str.parse::<u64>().ok().map(IoctlKey::TraceConnection);
    }
    None
}

/// Process-wide IOCTL state. One instance shared across all connections.
pub struct IoctlState {
    aggressive_decommit: AtomicBool,
    trace_masks: Mutex<HashMap<u64, u32>>,
}

impl Default for IoctlState {
    fn default() -> Self {
        Self::new()
    }
}

impl IoctlState {
    pub fn new() -> Self {
        Self {
            aggressive_decommit: AtomicBool::new(false),
            trace_masks: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Result<Vec<u8>, Status> {
        match parse_key(name).ok_or(Status::Einval)? {
            IoctlKey::ReleaseFreeMemory => Ok(b"0".to_vec()),
            IoctlKey::TcmallocAggressiveDecommit => {
                let v = if self.aggressive_decommit.load(Ordering::Relaxed) {
                    b"1"
                } else {
                    b"0"
                };
                Ok(v.to_vec())
            }
            IoctlKey::TraceConnection(id) => {
                let masks = self.trace_masks.lock().unwrap();
                let mask = masks.get(&id).copied().unwrap_or(0);
                Ok(mask.to_be_bytes().to_vec())
            }
        }
    }

    pub fn set(&self, name: &str, value: &[u8]) -> Result<(), Status> {
        match parse_key(name).ok_or(Status::Einval)? {
            IoctlKey::ReleaseFreeMemory => {
                alloc_hooks::release_free_memory();
                Ok(())
            }
            IoctlKey::TcmallocAggressiveDecommit => {
                let on = matches!(value, b"1" | b"true" | b"on");
                self.aggressive_decommit.store(on, Ordering::Relaxed);
                Ok(())
            }
            IoctlKey::TraceConnection(id) => {
                if value.len() != 4 {
                    return Err(Status::Einval);
                }
                let mask = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                self.trace_masks.lock().unwrap().insert(id, mask);
                Ok(())
            }
        }
    }
}
