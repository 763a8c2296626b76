//! In-process reference `StorageEngine`. Volatile (no persistence — that's
//! a non-goal of the core, and doubly so for this throwaway collaborator),
//! but CAS-correct and safe to race multiple writers against, which is all
//! the sub-document executor's retry logic needs to be exercised honestly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;

use super::{BoxFuture, Datatype, EngineError, EngineResult, ItemHandle, ItemInfo, StorageEngine, StoreOp};

#[derive(Clone)]
struct StoredItem {
    cas: u64,
    flags: u32,
    expiry: u32,
    datatype: Datatype,
    payload: Bytes,
}

pub struct MemoryStore {
    items: Mutex<HashMap<(u16, Vec<u8>), StoredItem>>,
    next_cas: AtomicU64,
    max_value_size: usize,
    /// Test hook: when > 0, the next `get`/`allocate`/`store` call
    /// decrements it and returns `EngineError::WouldBlock` instead of
    /// proceeding, exercising the executor's suspend-and-resume path
    /// deterministically (spec §5 "Suspension points").
    inject_would_block: AtomicUsize,
}

impl MemoryStore {
    pub fn new(max_value_size: usize) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            next_cas: AtomicU64::new(1),
            max_value_size,
            inject_would_block: AtomicUsize::new(0),
        }
    }

    /// Test-only: force the next N suspension-eligible calls to return
    /// `WouldBlock`.
    pub fn set_inject_would_block(&self, n: usize) {
        self.inject_would_block.store(n, Ordering::SeqCst);
    }

    fn maybe_would_block(&self) -> bool {
        let mut cur = self.inject_would_block.load(Ordering::SeqCst);
        loop {
            if cur == 0 {
                return false;
            }
            match self.inject_would_block.compare_exchange(
                cur,
                cur - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn key_of(vbucket: u16, key: &[u8]) -> (u16, Vec<u8>) {
        (vbucket, key.to_vec())
    }

    fn handle_from(key: &[u8], vbucket: u16, item: &StoredItem) -> ItemHandle {
        ItemHandle {
            key: Bytes::copy_from_slice(key),
            vbucket,
            cas: item.cas,
            flags: item.flags,
            expiry: item.expiry,
            datatype: item.datatype,
            segments: vec![item.payload.clone()],
        }
    }
}

impl StorageEngine for MemoryStore {
    fn get<'a>(&'a self, vbucket: u16, key: &'a [u8]) -> BoxFuture<'a, EngineResult<ItemHandle>> {
        Box::pin(async move {
            if self.maybe_would_block() {
                return Err(EngineError::WouldBlock);
            }
            let items = self.items.lock().unwrap();
            let stored = items
                .get(&Self::key_of(vbucket, key))
                .ok_or(EngineError::KeyEnoent)?;
            Ok(Self::handle_from(key, vbucket, stored))
        })
    }

    fn allocate<'a>(
        &'a self,
        vbucket: u16,
        key: &'a [u8],
        payload: Bytes,
        datatype: Datatype,
        flags: u32,
        expiry: u32,
    ) -> BoxFuture<'a, EngineResult<ItemHandle>> {
        Box::pin(async move {
            if self.maybe_would_block() {
                return Err(EngineError::WouldBlock);
            }
            if payload.len() > self.max_value_size {
                return Err(EngineError::E2big);
            }
            Ok(ItemHandle {
                key: Bytes::copy_from_slice(key),
                vbucket,
                cas: 0,
                flags,
                expiry,
                datatype,
                segments: vec![payload],
            })
        })
    }

    fn store<'a>(
        &'a self,
        vbucket: u16,
        item: ItemHandle,
        operation: StoreOp,
        input_cas: u64,
    ) -> BoxFuture<'a, EngineResult<u64>> {
        Box::pin(async move {
            if self.maybe_would_block() {
                return Err(EngineError::WouldBlock);
            }
            let mut items = self.items.lock().unwrap();
            let map_key = Self::key_of(vbucket, &item.key);
            let existing = items.get(&map_key);

            match operation {
                StoreOp::Add => {
                    if existing.is_some() {
                        return Err(EngineError::KeyEexists);
                    }
                }
                StoreOp::Replace => {
                    let cur = existing.ok_or(EngineError::KeyEnoent)?;
                    if input_cas != 0 && cur.cas != input_cas {
                        return Err(EngineError::KeyEexists);
                    }
                }
                StoreOp::Set => {
                    if let Some(cur) = existing {
                        if input_cas != 0 && cur.cas != input_cas {
                            return Err(EngineError::KeyEexists);
                        }
                    }
                }
            }

            let new_cas = self.next_cas.fetch_add(1, Ordering::SeqCst);
            let payload = item
                .contiguous()
                .cloned()
                .unwrap_or_else(|| Bytes::copy_from_slice(&item.segments.concat()));
            items.insert(
                map_key,
                StoredItem {
                    cas: new_cas,
                    flags: item.flags,
                    expiry: item.expiry,
                    datatype: item.datatype,
                    payload,
                },
            );
            Ok(new_cas)
        })
    }

    fn remove<'a>(&'a self, vbucket: u16, key: &'a [u8]) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            if self.maybe_would_block() {
                return Err(EngineError::WouldBlock);
            }
            let mut items = self.items.lock().unwrap();
            items
                .remove(&Self::key_of(vbucket, key))
                .map(|_| ())
                .ok_or(EngineError::KeyEnoent)
        })
    }

    fn release(&self, _item: ItemHandle) {
        // In-process engine holds no external resources per item; release
        // is a no-op here but every exit path still calls it, which is the
        // property under test (spec §8 property 7), not this engine's
        // internal bookkeeping.
    }

    fn item_set_cas(&self, item: &mut ItemHandle, cas: u64) {
        item.cas = cas;
    }

    fn get_item_info(&self, item: &ItemHandle) -> ItemInfo {
        ItemInfo {
            cas: item.cas,
            flags: item.flags,
            datatype: item.datatype,
            payload_len: item.payload_len(),
        }
    }
}
