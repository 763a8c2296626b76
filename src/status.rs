//! Protocol status codes.
//!
//! These are data, not `std::error::Error` — every request that reaches the
//! wire ends in exactly one status code written back to the client. Engine
//! and sub-document engine errors are mapped onto this enum in one place
//! (`from_engine_error` / `from_subdoc_error`) per spec §7's error table.

use crate::storage::EngineError;
use crate::subdoc::engine::SubdocEngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Success = 0x0000,
    KeyEnoent = 0x0001,
    KeyEexists = 0x0002,
    E2big = 0x0003,
    Einval = 0x0004,
    NotStored = 0x0005,
    DeltaBadval = 0x0006,
    NotMyVbucket = 0x0007,

    UnknownCommand = 0x0081,
    Enomem = 0x0082,
    NotSupported = 0x0083,
    Einternal = 0x0084,
    Ebusy = 0x0085,
    Tmpfail = 0x0086,

    // Sub-document specific statuses (couchbase binary protocol extension range).
    SubdocPathEnoent = 0x00c0,
    SubdocPathMismatch = 0x00c1,
    SubdocPathEinval = 0x00c2,
    SubdocPathE2big = 0x00c3,
    SubdocDocE2deep = 0x00c4,
    SubdocValueCantinsert = 0x00c5,
    SubdocDocNotjson = 0x00c6,
    SubdocNumErange = 0x00c7,
    SubdocDeltaErange = 0x00c8,
    SubdocPathEexists = 0x00c9,
    SubdocValueEtoodeep = 0x00ca,
    SubdocInvalidCombo = 0x00cb,
    SubdocMultiPathFailure = 0x00cc,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn from_engine_error(err: EngineError) -> Status {
        match err {
            EngineError::WouldBlock => {
                unreachable!("EWOULDBLOCK must be handled by the executor, never surfaced")
            }
            EngineError::Disconnect => Status::Einternal,
            EngineError::KeyEnoent => Status::KeyEnoent,
            EngineError::KeyEexists => Status::KeyEexists,
            EngineError::E2big => Status::E2big,
            EngineError::Enomem => Status::Enomem,
            EngineError::NotStored => Status::NotStored,
            EngineError::NotMyVbucket => Status::NotMyVbucket,
            EngineError::Other(_) => Status::Einternal,
        }
    }

    pub fn from_subdoc_error(err: SubdocEngineError) -> Status {
        match err {
            SubdocEngineError::PathEnoent => Status::SubdocPathEnoent,
            SubdocEngineError::PathMismatch => Status::SubdocPathMismatch,
            SubdocEngineError::DocEtoodeep => Status::SubdocDocE2deep,
            SubdocEngineError::PathEinval => Status::SubdocPathEinval,
            SubdocEngineError::DocEexists => Status::SubdocPathEexists,
            SubdocEngineError::PathE2big => Status::SubdocPathE2big,
            SubdocEngineError::NumE2big => Status::SubdocNumErange,
            SubdocEngineError::DeltaE2big => Status::SubdocDeltaErange,
            SubdocEngineError::ValueCantinsert => Status::SubdocValueCantinsert,
            SubdocEngineError::ValueEtoodeep => Status::SubdocValueEtoodeep,
        }
    }
}
