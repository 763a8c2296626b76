//! Document materializer (spec C3): obtain a flat, uncompressed JSON buffer
//! from a fetched item, honoring its datatype flag.

use bytes::Bytes;

use crate::status::Status;
use crate::storage::{Datatype, ItemHandle};

/// Connection-scoped dynamic buffer used to decompress `COMPRESSED_JSON`
/// items into (spec §5 "Shared resources": exclusive to the owning
/// connection's worker). Bounded so a hostile/huge item can't grow it
/// without limit.
pub struct ConnBuffer {
    buf: Vec<u8>,
    max_len: usize,
}

impl ConnBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    fn grow_to(&mut self, len: usize) -> Result<(), Status> {
        if len > self.max_len {
            return Err(Status::E2big);
        }
        if self.buf.capacity() < len {
            self.buf.reserve(len - self.buf.capacity());
        }
        Ok(())
    }
}

/// The result of materialization: a contiguous JSON buffer plus the CAS
/// observed on the underlying item, which the executor records into the
/// command context (spec §4.4 "materialization records the observed CAS").
pub enum MaterializedDoc {
    /// Borrowed straight from the item's single contiguous segment — no
    /// copy (spec "Datatype JSON: return the engine's iovec").
    FromItem(Bytes),
    /// Decompressed into the connection's scratch buffer.
    Decompressed(Vec<u8>),
}

impl MaterializedDoc {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MaterializedDoc::FromItem(b) => b,
            MaterializedDoc::Decompressed(v) => v,
        }
    }
}

pub struct Materialized {
    pub doc: MaterializedDoc,
    pub observed_cas: u64,
}

/// Materialize `item`'s payload into a flat JSON buffer.
///
/// `client_cas`: if non-zero and it doesn't match the item's CAS, fails
/// `KEY_EEXISTS` *without* decompressing (spec §4.4).
pub fn materialize(
    item: &ItemHandle,
    client_cas: u64,
    scratch: &mut ConnBuffer,
) -> Result<Materialized, Status> {
    if client_cas != 0 && client_cas != item.cas {
        return Err(Status::KeyEexists);
    }

    match item.datatype {
        Datatype::Json => {
            let seg = item.contiguous().ok_or(Status::Einternal)?;
            Ok(Materialized {
                doc: MaterializedDoc::FromItem(seg.clone()),
                observed_cas: item.cas,
            })
        }
        Datatype::CompressedJson => {
            let seg = item.contiguous().ok_or(Status::Einternal)?;
            let decompressed = decompress_snappy(seg, scratch)?;
            Ok(Materialized {
                doc: MaterializedDoc::Decompressed(decompressed),
                observed_cas: item.cas,
            })
        }
        Datatype::Raw | Datatype::Compressed => Err(Status::SubdocDocNotjson),
    }
}

fn decompress_snappy(compressed: &Bytes, scratch: &mut ConnBuffer) -> Result<Vec<u8>, Status> {
    let uncompressed_len = snap::raw::decompress_len(compressed).map_err(|e| {
        tracing::warn!(error = %e, "could not read snappy uncompressed length");
        Status::Einternal
    })?;
    scratch.grow_to(uncompressed_len)?;

    let mut decoder = snap::raw::Decoder::new();
    match decoder.decompress_vec(compressed) {
        Ok(out) => Ok(out),
        Err(e) => {
            tracing::warn!(error = %e, "snappy decompression failed");
            Err(Status::Einternal)
        }
    }
}
