//! Per-connection state (spec §3 "Command context", §5 "Scheduling model")
//! and the command dispatch loop that ties the wire codec (C1), validator
//! (C2), sub-document executor/coordinator (C5/C6), basic K/V opcodes, and
//! IOCTL surface (C8) together for one TCP (or TLS) connection.
//!
//! The command context itself — input document buffer, observed CAS,
//! per-op result records, owned output item — lives in the executor's
//! (`subdoc::executor`, `subdoc::multipath`) local async stack frames: once
//! a command suspends on `.await`, that frame *is* the saved context, and it
//! resumes on the same worker with everything intact (spec §5 "a single
//! command must not hop threads mid-execution"). What survives across
//! commands on one TCP connection — the bucket binding, the decompression
//! scratch buffer, the trace mask — lives here instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::bucket::{BucketHandle, BucketRegistry};
use crate::error::Result;
use crate::ioctl::IoctlState;
use crate::materializer::ConnBuffer;
use crate::protocol::frame::{Response, encode_response};
use crate::protocol::opcode;
use crate::protocol::{read_request, write_response};
use crate::stats::Stats;
use crate::status::Status;
use crate::storage::memory::MemoryStore;
use crate::subdoc::{self, JsonPathEngine};
use crate::validator;
use crate::{kv, subdoc as subdoc_mod};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide state shared by every connection (spec §5 "Shared
/// resources"): the bucket registry, the IOCTL sideband, and the top-keys
/// statistics shards. The sub-document operation engine is stateless
/// (`JsonPathEngine` carries no data) so a single shared instance stands in
/// for spec §5's "per-thread sub-document operation object" without
/// needing actual per-thread storage.
pub struct ServerState {
    pub buckets: BucketRegistry,
    pub ioctl: IoctlState,
    pub stats: Stats,
    pub subdoc_engine: JsonPathEngine,
    pub default_bucket: String,
    pub max_value_size: usize,
}

impl ServerState {
    pub fn new(cfg: &crate::config::Config) -> Self {
        let buckets = BucketRegistry::new(cfg.max_buckets);
        let default_store: Arc<dyn crate::storage::StorageEngine> =
            Arc::new(MemoryStore::new(cfg.max_value_size));
        buckets
            .create(&cfg.default_bucket, default_store)
            .expect("default bucket name from config must be valid and unique at startup");
        Self {
            buckets,
            ioctl: IoctlState::new(),
            stats: Stats::new(),
            subdoc_engine: JsonPathEngine,
            default_bucket: cfg.default_bucket.clone(),
            max_value_size: cfg.max_value_size,
        }
    }
}

/// State that outlives any single command on a connection.
pub struct ConnectionState {
    pub id: u64,
    pub bucket: Option<Arc<BucketHandle>>,
    pub scratch: ConnBuffer,
    pub trace_mask: u32,
}

impl ConnectionState {
    pub fn new(max_doc_size: usize) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            bucket: None,
            scratch: ConnBuffer::new(max_doc_size),
            trace_mask: 0,
        }
    }

    pub fn select_bucket(&mut self, bucket: Arc<BucketHandle>) {
        self.bucket = Some(bucket);
    }

    pub fn bucket(&self) -> Option<&Arc<BucketHandle>> {
        self.bucket.as_ref()
    }
}

/// Run the command loop for one connection until the client disconnects or
/// sends `QUIT`. `stream` is generic over plain TCP and TLS so the server's
/// accept loop can drive both the same way.
pub async fn run_connection<S>(mut stream: S, state: Arc<ServerState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = ConnectionState::new(state.max_value_size);
    if let Ok(bucket) = state.buckets.select(&state.default_bucket) {
        conn.select_bucket(bucket);
    }

    loop {
        let req = match read_request(&mut stream).await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %format!("{e:?}"), "connection read failed; closing");
                break;
            }
        };

        let opcode = req.opcode();
        let quiet = opcode::is_quiet(opcode);

        let (status, resp, cas): (Status, Response, u64) =
            if let Err(status) = validator::validate(&req) {
                (status, Response::empty(), 0)
            } else {
                match conn.bucket().cloned() {
                    None => (Status::Ebusy, Response::empty(), 0),
                    Some(bucket) => {
                        let _guard = bucket.begin_command();
                        let vbucket = req.header.vbucket_or_status;
                        let storage = bucket.storage.as_ref();
                        if opcode::is_subdoc_opcode(opcode) {
                            let traits = opcode::traits_for(opcode)
                                .expect("is_subdoc_opcode implies traits_for is Some");
                            subdoc::execute_single_path(
                                &req,
                                traits,
                                vbucket,
                                storage,
                                &state.subdoc_engine,
                                &state.stats,
                                &mut conn.scratch,
                            )
                            .await
                        } else if opcode == crate::protocol::opcode::SUBDOC_MULTI_LOOKUP {
                            subdoc_mod::execute_multi_lookup(
                                &req,
                                vbucket,
                                storage,
                                &state.subdoc_engine,
                                &state.stats,
                                &mut conn.scratch,
                            )
                            .await
                        } else if opcode == crate::protocol::opcode::SUBDOC_MULTI_MUTATION {
                            subdoc_mod::execute_multi_mutation(
                                &req,
                                vbucket,
                                storage,
                                &state.subdoc_engine,
                                &state.stats,
                                &mut conn.scratch,
                            )
                            .await
                        } else {
                            kv::execute_basic_kv(&req, vbucket, storage, &state.ioctl).await
                        }
                    }
                }
            };

        // Quiet suppression is directional: storage/delete/arithmetic *Q
        // opcodes stay silent on success and always report errors, while
        // GETQ/GETKQ invert that — memcached replies on a hit and stays
        // silent on a miss, which is what makes a GETQ...NOOP pipeline work.
        let should_respond = if !quiet {
            true
        } else if opcode::is_retrieval_quiet(opcode) {
            status != Status::KeyEnoent
        } else {
            !status.is_success()
        };
        if should_respond {
            let (header, body) =
                encode_response(opcode, req.header.opaque, status, cas, resp);
            if let Err(e) = write_response(&mut stream, &header, &body).await {
                tracing::debug!(error = %format!("{e:?}"), "connection write failed; closing");
                break;
            }
        }

        if opcode == opcode::QUIT {
            break;
        }
    }

    Ok(())
}
