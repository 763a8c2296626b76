//! The pluggable storage engine (spec §1, §3, §5): `allocate`/`get`/`store`/
//! `release`/`item_set_cas`/`get_item_info`. Spec treats this as an external
//! collaborator with only its interface specified; this module is that
//! interface plus one concrete, in-process implementation
//! (`storage::memory::MemoryStore`) so the crate runs end-to-end.

pub mod memory;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

/// The only three calls permitted to suspend a command (spec §5).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Datatype {
    Raw = 0x00,
    Json = 0x01,
    Compressed = 0x02,
    CompressedJson = 0x03,
}

impl Datatype {
    pub fn from_wire(byte: u8) -> Option<Datatype> {
        match byte {
            0x00 => Some(Datatype::Raw),
            0x01 => Some(Datatype::Json),
            0x02 => Some(Datatype::Compressed),
            0x03 => Some(Datatype::CompressedJson),
            _ => None,
        }
    }

    pub fn is_json(self) -> bool {
        matches!(self, Datatype::Json | Datatype::CompressedJson)
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, Datatype::Compressed | Datatype::CompressedJson)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// Non-blocking I/O isn't ready yet; the executor must suspend and
    /// retry with the same command context (spec §5 "Suspension points").
    WouldBlock,
    Disconnect,
    KeyEnoent,
    KeyEexists,
    E2big,
    Enomem,
    NotStored,
    NotMyVbucket,
    Other(&'static str),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Set,
    Add,
    Replace,
}

/// An owned, checked-out handle to a stored item. The engine hands these
/// out from `get`/`allocate` and the caller must return every one exactly
/// once via `release`, on every exit path (spec §8 property 7, §9 "cyclic
/// references" note: the connection/executor owns the item and guarantees
/// release on teardown, not the other way around).
#[derive(Debug, Clone)]
pub struct ItemHandle {
    pub key: Bytes,
    pub vbucket: u16,
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
    pub datatype: Datatype,
    /// The item's payload, as a sequence of segments. A true zero-copy
    /// engine may hand back a multi-segment iovec; the materializer (C3)
    /// must fail `EINTERNAL` if it sees more than one segment for a
    /// document it needs contiguous.
    pub segments: Vec<Bytes>,
}

impl ItemHandle {
    pub fn is_single_segment(&self) -> bool {
        self.segments.len() <= 1
    }

    pub fn payload_len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// Contiguous view of the payload when it's a single segment.
    pub fn contiguous(&self) -> Option<&Bytes> {
        if self.segments.len() == 1 {
            self.segments.first()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ItemInfo {
    pub cas: u64,
    pub flags: u32,
    pub datatype: Datatype,
    pub payload_len: usize,
}

/// Spec §1's pluggable storage engine interface. Trait-object friendly via
/// manually-boxed futures (no extra async-trait dependency needed for a
/// surface this narrow).
pub trait StorageEngine: Send + Sync {
    fn get<'a>(&'a self, vbucket: u16, key: &'a [u8]) -> BoxFuture<'a, EngineResult<ItemHandle>>;

    fn allocate<'a>(
        &'a self,
        vbucket: u16,
        key: &'a [u8],
        payload: Bytes,
        datatype: Datatype,
        flags: u32,
        expiry: u32,
    ) -> BoxFuture<'a, EngineResult<ItemHandle>>;

    /// Store `item` under `operation`, honoring `input_cas` as the
    /// expected-current-CAS for a compare-and-swap (0 means "no check").
    /// Returns the newly assigned CAS on success.
    fn store<'a>(
        &'a self,
        vbucket: u16,
        item: ItemHandle,
        operation: StoreOp,
        input_cas: u64,
    ) -> BoxFuture<'a, EngineResult<u64>>;

    /// Remove a key outright (basic `DELETE`). Not used by the sub-document
    /// path, which only ever replaces.
    fn remove<'a>(&'a self, vbucket: u16, key: &'a [u8]) -> BoxFuture<'a, EngineResult<()>>;

    /// Return a checked-out item. Synchronous: release never blocks.
    fn release(&self, item: ItemHandle);

    fn item_set_cas(&self, item: &mut ItemHandle, cas: u64);

    fn get_item_info(&self, item: &ItemHandle) -> ItemInfo;
}
