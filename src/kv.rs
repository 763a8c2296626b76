//! Basic (non-sub-document) key/value opcodes: GET/SET/ADD/REPLACE/DELETE/
//! INCREMENT/DECREMENT/APPEND/PREPEND/TOUCH, plus the IOCTL opcodes (spec
//! §A.2 "Full opcode surface for basic K/V"). These sit directly on the
//! storage engine — no sub-document path or JSON materialization involved.

use bytes::Bytes;

use crate::ioctl::IoctlState;
use crate::protocol::Request;
use crate::protocol::frame::Response;
use crate::protocol::opcode;
use crate::status::Status;
use crate::storage::{Datatype, EngineError, ItemHandle, StorageEngine, StoreOp};

async fn fetch<'a>(
    storage: &'a dyn StorageEngine,
    vbucket: u16,
    key: &'a [u8],
) -> Result<ItemHandle, EngineError> {
    loop {
        match storage.get(vbucket, key).await {
            Err(EngineError::WouldBlock) => continue,
            other => return other,
        }
    }
}

async fn alloc<'a>(
    storage: &'a dyn StorageEngine,
    vbucket: u16,
    key: &'a [u8],
    payload: Bytes,
    datatype: Datatype,
    flags: u32,
    expiry: u32,
) -> Result<ItemHandle, EngineError> {
    loop {
        match storage
            .allocate(vbucket, key, payload.clone(), datatype, flags, expiry)
            .await
        {
            Err(EngineError::WouldBlock) => continue,
            other => return other,
        }
    }
}

async fn put<'a>(
    storage: &'a dyn StorageEngine,
    vbucket: u16,
    item: ItemHandle,
    op: StoreOp,
    input_cas: u64,
) -> Result<u64, EngineError> {
    loop {
        match storage.store(vbucket, item.clone(), op, input_cas).await {
            Err(EngineError::WouldBlock) => continue,
            other => return other,
        }
    }
}

async fn remove<'a>(
    storage: &'a dyn StorageEngine,
    vbucket: u16,
    key: &'a [u8],
) -> Result<(), EngineError> {
    loop {
        match storage.remove(vbucket, key).await {
            Err(EngineError::WouldBlock) => continue,
            other => return other,
        }
    }
}

fn get_flags_extras(flags: u32) -> Bytes {
    Bytes::copy_from_slice(&flags.to_be_bytes())
}

async fn handle_get(
    req: &Request,
    vbucket: u16,
    storage: &dyn StorageEngine,
    with_key: bool,
) -> (Status, Response, u64) {
    match fetch(storage, vbucket, &req.key).await {
        Ok(item) => {
            let value = item
                .contiguous()
                .cloned()
                .unwrap_or_else(|| Bytes::copy_from_slice(&item.segments.concat()));
            let cas = item.cas;
            let flags = item.flags;
            storage.release(item);
            let resp = Response {
                extras: get_flags_extras(flags),
                key: if with_key {
                    req.key.clone()
                } else {
                    Bytes::new()
                },
                value,
            };
            (Status::Success, resp, cas)
        }
        Err(e) => (Status::from_engine_error(e), Response::empty(), 0),
    }
}

async fn handle_store(
    req: &Request,
    vbucket: u16,
    storage: &dyn StorageEngine,
    op: StoreOp,
) -> (Status, Response, u64) {
    let flags = u32::from_be_bytes([
        req.extras[0],
        req.extras[1],
        req.extras[2],
        req.extras[3],
    ]);
    let expiry = u32::from_be_bytes([
        req.extras[4],
        req.extras[5],
        req.extras[6],
        req.extras[7],
    ]);
    let datatype = Datatype::from_wire(req.header.datatype).unwrap_or(Datatype::Raw);

    let item = match alloc(
        storage,
        vbucket,
        &req.key,
        req.value.clone(),
        datatype,
        flags,
        expiry,
    )
    .await
    {
        Ok(it) => it,
        Err(e) => return (Status::from_engine_error(e), Response::empty(), 0),
    };

    match put(storage, vbucket, item, op, req.header.cas).await {
        Ok(cas) => (Status::Success, Response::empty(), cas),
        Err(e) => (Status::from_engine_error(e), Response::empty(), 0),
    }
}

async fn handle_delete(req: &Request, vbucket: u16, storage: &dyn StorageEngine) -> (Status, Response, u64) {
    match remove(storage, vbucket, &req.key).await {
        Ok(()) => (Status::Success, Response::empty(), 0),
        Err(e) => (Status::from_engine_error(e), Response::empty(), 0),
    }
}

async fn handle_arith(
    req: &Request,
    vbucket: u16,
    storage: &dyn StorageEngine,
    increment: bool,
) -> (Status, Response, u64) {
    let delta = u64::from_be_bytes(req.extras[0..8].try_into().unwrap());
    let initial = u64::from_be_bytes(req.extras[8..16].try_into().unwrap());
    let expiry = u32::from_be_bytes(req.extras[16..20].try_into().unwrap());

    let existing = fetch(storage, vbucket, &req.key).await;
    let (new_value, flags) = match existing {
        Ok(item) => {
            let raw = item
                .contiguous()
                .cloned()
                .unwrap_or_else(|| Bytes::copy_from_slice(&item.segments.concat()));
            let flags = item.flags;
            storage.release(item);
            let current: u64 = match std::str::from_utf8(&raw).ok().and_then(|s| s.trim().parse().ok()) {
                Some(v) => v,
                None => return (Status::DeltaBadval, Response::empty(), 0),
            };
            let updated = if increment {
                current.saturating_add(delta)
            } else {
                current.saturating_sub(delta)
            };
            (updated, flags)
        }
        Err(EngineError::KeyEnoent) => (initial, 0),
        Err(e) => return (Status::from_engine_error(e), Response::empty(), 0),
    };

    let payload = Bytes::from(new_value.to_string().into_bytes());
    let item = match alloc(storage, vbucket, &req.key, payload, Datatype::Raw, flags, expiry).await {
        Ok(it) => it,
        Err(e) => return (Status::from_engine_error(e), Response::empty(), 0),
    };
    match put(storage, vbucket, item, StoreOp::Set, 0).await {
        Ok(cas) => (
            Status::Success,
            Response::with_value(Bytes::copy_from_slice(&new_value.to_be_bytes())),
            cas,
        ),
        Err(e) => (Status::from_engine_error(e), Response::empty(), 0),
    }
}

async fn handle_append_prepend(
    req: &Request,
    vbucket: u16,
    storage: &dyn StorageEngine,
    append: bool,
) -> (Status, Response, u64) {
    let item = match fetch(storage, vbucket, &req.key).await {
        Ok(it) => it,
        Err(e) => return (Status::from_engine_error(e), Response::empty(), 0),
    };
    let existing = item
        .contiguous()
        .cloned()
        .unwrap_or_else(|| Bytes::copy_from_slice(&item.segments.concat()));
    let flags = item.flags;
    let datatype = item.datatype;
    storage.release(item);

    let mut combined = Vec::with_capacity(existing.len() + req.value.len());
    if append {
        combined.extend_from_slice(&existing);
        combined.extend_from_slice(&req.value);
    } else {
        combined.extend_from_slice(&req.value);
        combined.extend_from_slice(&existing);
    }

    let new_item = match alloc(
        storage,
        vbucket,
        &req.key,
        Bytes::from(combined),
        datatype,
        flags,
        0,
    )
    .await
    {
        Ok(it) => it,
        Err(e) => return (Status::from_engine_error(e), Response::empty(), 0),
    };
    match put(storage, vbucket, new_item, StoreOp::Replace, req.header.cas).await {
        Ok(cas) => (Status::Success, Response::empty(), cas),
        Err(e) => (Status::from_engine_error(e), Response::empty(), 0),
    }
}

async fn handle_touch(req: &Request, vbucket: u16, storage: &dyn StorageEngine) -> (Status, Response, u64) {
    let expiry = u32::from_be_bytes(req.extras[0..4].try_into().unwrap());
    let item = match fetch(storage, vbucket, &req.key).await {
        Ok(it) => it,
        Err(e) => return (Status::from_engine_error(e), Response::empty(), 0),
    };
    let payload = item
        .contiguous()
        .cloned()
        .unwrap_or_else(|| Bytes::copy_from_slice(&item.segments.concat()));
    let flags = item.flags;
    let datatype = item.datatype;
    storage.release(item);

    let new_item = match alloc(storage, vbucket, &req.key, payload, datatype, flags, expiry).await {
        Ok(it) => it,
        Err(e) => return (Status::from_engine_error(e), Response::empty(), 0),
    };
    match put(storage, vbucket, new_item, StoreOp::Replace, 0).await {
        Ok(cas) => (Status::Success, Response::empty(), cas),
        Err(e) => (Status::from_engine_error(e), Response::empty(), 0),
    }
}

fn handle_ioctl_get(req: &Request, ioctl: &IoctlState) -> (Status, Response, u64) {
    let name = match std::str::from_utf8(&req.key) {
        Ok(n) => n,
        Err(_) => return (Status::Einval, Response::empty(), 0),
    };
    match ioctl.get(name) {
        Ok(value) => (Status::Success, Response::with_value(value), 0),
        Err(status) => (status, Response::empty(), 0),
    }
}

fn handle_ioctl_set(req: &Request, ioctl: &IoctlState) -> (Status, Response, u64) {
    let name = match std::str::from_utf8(&req.key) {
        Ok(n) => n,
        Err(_) => return (Status::Einval, Response::empty(), 0),
    };
    match ioctl.set(name, &req.value) {
        Ok(()) => (Status::Success, Response::empty(), 0),
        Err(status) => (status, Response::empty(), 0),
    }
}

/// Dispatch a validated basic K/V request. `req` must already have passed
/// [`crate::validator::validate`].
pub async fn execute_basic_kv(
    req: &Request,
    vbucket: u16,
    storage: &dyn StorageEngine,
    ioctl: &IoctlState,
) -> (Status, Response, u64) {
    match req.opcode() {
        opcode::GET | opcode::GETQ => handle_get(req, vbucket, storage, false).await,
        opcode::GETK | opcode::GETKQ => handle_get(req, vbucket, storage, true).await,
        opcode::SET | opcode::SETQ => handle_store(req, vbucket, storage, StoreOp::Set).await,
        opcode::ADD | opcode::ADDQ => handle_store(req, vbucket, storage, StoreOp::Add).await,
        opcode::REPLACE | opcode::REPLACEQ => {
            handle_store(req, vbucket, storage, StoreOp::Replace).await
        }
        opcode::DELETE | opcode::DELETEQ => handle_delete(req, vbucket, storage).await,
        opcode::INCREMENT | opcode::INCREMENTQ => handle_arith(req, vbucket, storage, true).await,
        opcode::DECREMENT | opcode::DECREMENTQ => handle_arith(req, vbucket, storage, false).await,
        opcode::APPEND | opcode::APPENDQ => handle_append_prepend(req, vbucket, storage, true).await,
        opcode::PREPEND | opcode::PREPENDQ => {
            handle_append_prepend(req, vbucket, storage, false).await
        }
        opcode::TOUCH => handle_touch(req, vbucket, storage).await,
        opcode::NOOP | opcode::VERSION | opcode::QUIT => (Status::Success, Response::empty(), 0),
        opcode::IOCTL_GET => handle_ioctl_get(req, ioctl),
        opcode::IOCTL_SET => handle_ioctl_set(req, ioctl),
        _ => (Status::UnknownCommand, Response::empty(), 0),
    }
}
