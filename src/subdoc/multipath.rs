//! Multi-path coordinators (spec C6): `SUBDOC_MULTI_LOOKUP` attempts every
//! spec regardless of earlier failures and aggregates a per-spec status;
//! `SUBDOC_MULTI_MUTATION` applies specs sequentially against an in-memory
//! document, aborting at the first failing spec, and writes the result back
//! once under the client's CAS (retried the same bounded way as the
//! single-path executor).

use bytes::Bytes;

use crate::protocol::Request;
use crate::protocol::frame::Response;
use crate::protocol::opcode::{self, traits_for};
use crate::stats::Stats;
use crate::status::Status;
use crate::storage::{Datatype, EngineError, ItemHandle, StorageEngine, StoreOp};
use crate::materializer::{ConnBuffer, materialize};
use crate::validator::{self, RawSpec, parse_multi_lookup_specs, parse_multi_mutation_specs};

use super::engine::{MutateOutcome, SubdocEngine};
use super::path;

const MAX_CAS_RETRIES: u32 = 100;

/// One spec's outcome inside a multi-lookup response (spec §4.2: "all
/// specs are attempted regardless of earlier failures").
pub struct LookupResult {
    pub status: Status,
    pub value: Vec<u8>,
}

/// Encode a multi-lookup response body: each result as
/// `status(u16) | value_len(u32) | value`, in spec order.
fn encode_multi_lookup_body(results: &[LookupResult]) -> Vec<u8> {
    let mut out = Vec::new();
    for r in results {
        out.extend_from_slice(&(r.status as u16).to_be_bytes());
        out.extend_from_slice(&(r.value.len() as u32).to_be_bytes());
        out.extend_from_slice(&r.value);
    }
    out
}

async fn fetch_item<'a>(
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

async fn alloc_item<'a>(
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

async fn store_item<'a>(
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

/// Run a `SUBDOC_MULTI_LOOKUP`. `req` must already have passed `validate`.
pub async fn execute_multi_lookup(
    req: &Request,
    vbucket: u16,
    storage: &dyn StorageEngine,
    subdoc: &dyn SubdocEngine,
    stats: &Stats,
    scratch: &mut ConnBuffer,
) -> (Status, Response, u64) {
    let specs = parse_multi_lookup_specs(&req.value);
    let client_cas = req.header.cas;

    let item = match fetch_item(storage, vbucket, &req.key).await {
        Ok(item) => item,
        Err(e) => return (Status::from_engine_error(e), Response::empty(), 0),
    };

    let materialized = match materialize(&item, client_cas, scratch) {
        Ok(m) => m,
        Err(status) => {
            storage.release(item);
            return (status, Response::empty(), 0);
        }
    };

    stats.record_get(&req.key);
    let observed_cas = materialized.observed_cas;
    let doc = materialized.doc.as_bytes();

    let mut results = Vec::with_capacity(specs.len());
    let mut any_failed = false;

    for spec in &specs {
        match run_one_lookup(subdoc, doc, spec) {
            Ok(value) => results.push(LookupResult {
                status: Status::Success,
                value,
            }),
            Err(status) => {
                any_failed = true;
                results.push(LookupResult {
                    status,
                    value: Vec::new(),
                });
            }
        }
    }

    storage.release(item);

    let body = encode_multi_lookup_body(&results);
    let overall = if any_failed {
        Status::SubdocMultiPathFailure
    } else {
        Status::Success
    };
    (overall, Response::with_value(body), observed_cas)
}

fn run_one_lookup(subdoc: &dyn SubdocEngine, doc: &[u8], spec: &RawSpec<'_>) -> Result<Vec<u8>, Status> {
    let traits = traits_for(spec.opcode).ok_or(Status::Einval)?;
    let path_str = std::str::from_utf8(spec.path).map_err(|_| Status::SubdocPathEinval)?;
    let path = path::parse(path_str).ok_or(Status::SubdocPathEinval)?;
    subdoc
        .lookup(traits.subdoc_cmd, doc, &path)
        .map(|loc| loc.bytes)
        .map_err(Status::from_subdoc_error)
}

/// Run a `SUBDOC_MULTI_MUTATION`. Applies specs sequentially against an
/// in-memory document; the first failing spec aborts the whole command
/// (spec §4.3) and its index/status is reported. On success the final
/// document is written back once under `client_cas` (0 meaning "no
/// check"), with the same bounded auto-retry as the single-path executor
/// when the client didn't supply one.
pub async fn execute_multi_mutation(
    req: &Request,
    vbucket: u16,
    storage: &dyn StorageEngine,
    subdoc: &dyn SubdocEngine,
    stats: &Stats,
    scratch: &mut ConnBuffer,
) -> (Status, Response, u64) {
    let specs = parse_multi_mutation_specs(&req.value);
    let client_cas = req.header.cas;

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if attempts > MAX_CAS_RETRIES {
            tracing::warn!(
                key = %String::from_utf8_lossy(&req.key),
                "multi-mutation CAS retry budget exhausted"
            );
            return (Status::Tmpfail, Response::empty(), 0);
        }

        let item = match fetch_item(storage, vbucket, &req.key).await {
            Ok(item) => item,
            Err(e) => return (Status::from_engine_error(e), Response::empty(), 0),
        };

        let materialized = match materialize(&item, client_cas, scratch) {
            Ok(m) => m,
            Err(status) => {
                storage.release(item);
                return (status, Response::empty(), 0);
            }
        };

        stats.record_set(&req.key);
        let mut doc = materialized.doc.as_bytes().to_vec();
        let mut applied_any = false;
        let mut failure: Option<(usize, Status)> = None;
        let mut echoes: Vec<(usize, Vec<u8>)> = Vec::new();

        for (idx, spec) in specs.iter().enumerate() {
            match run_one_mutation(subdoc, &doc, spec) {
                Ok((new_doc, echo)) => {
                    doc = new_doc;
                    applied_any = true;
                    if let Some(echo) = echo {
                        echoes.push((idx, echo));
                    }
                }
                Err(status) => {
                    failure = Some((idx, status));
                    break;
                }
            }
        }

        if let Some((idx, status)) = failure {
            storage.release(item);
            let mut body = Vec::new();
            body.extend_from_slice(&(idx as u8).to_be_bytes());
            body.extend_from_slice(&(status as u16).to_be_bytes());
            return (status, Response::with_value(body), 0);
        }

        if !applied_any {
            storage.release(item);
            return (Status::Einval, Response::empty(), 0);
        }

        let flags = item.flags;
        let expiry = item.expiry;
        let new_item = match alloc_item(
            storage,
            vbucket,
            &req.key,
            Bytes::from(doc),
            Datatype::Json,
            flags,
            expiry,
        )
        .await
        {
            Ok(it) => it,
            Err(e) => {
                storage.release(item);
                return (Status::from_engine_error(e), Response::empty(), 0);
            }
        };

        storage.release(item);

        let expected_cas = if client_cas != 0 {
            client_cas
        } else {
            materialized.observed_cas
        };

        match store_item(storage, vbucket, new_item, StoreOp::Replace, expected_cas).await {
            Ok(new_cas) => {
                let body = encode_multi_mutation_echoes(&echoes);
                let resp = if body.is_empty() {
                    Response::empty()
                } else {
                    Response::with_value(body)
                };
                return (Status::Success, resp, new_cas);
            }
            Err(EngineError::KeyEexists) => {
                if client_cas != 0 {
                    return (Status::KeyEexists, Response::empty(), 0);
                }
                continue;
            }
            Err(e) => return (Status::from_engine_error(e), Response::empty(), 0),
        }
    }
}

fn run_one_mutation(
    subdoc: &dyn SubdocEngine,
    doc: &[u8],
    spec: &RawSpec<'_>,
) -> Result<(Vec<u8>, Option<Vec<u8>>), Status> {
    let traits = traits_for(spec.opcode).ok_or(Status::Einval)?;
    let path_str = std::str::from_utf8(spec.path).map_err(|_| Status::SubdocPathEinval)?;
    let path = path::parse(path_str).ok_or(Status::SubdocPathEinval)?;
    let mkdir = validator::mkdir_p(spec.flags);

    let counter_delta = if traits.subdoc_cmd == crate::subdoc::engine::SubdocCommand::Counter {
        std::str::from_utf8(spec.value)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
    } else {
        None
    };

    let outcome = subdoc
        .mutate(traits.subdoc_cmd, doc, &path, spec.value, mkdir, counter_delta)
        .map_err(Status::from_subdoc_error)?;

    match outcome {
        MutateOutcome::Applied { fragments, echo } => {
            let mut new_doc = Vec::with_capacity(fragments.iter().map(|f| f.len()).sum());
            for f in &fragments {
                new_doc.extend_from_slice(f.bytes());
            }
            Ok((new_doc, echo.map(|m| m.bytes)))
        }
    }
}

/// Encode the per-spec echoes a successful multi-mutation carries back
/// (e.g. a COUNTER spec's post-increment value): `index(u8) |
/// value_len(u32) | value`, repeated.
fn encode_multi_mutation_echoes(echoes: &[(usize, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (idx, value) in echoes {
        out.push(*idx as u8);
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }
    out
}
