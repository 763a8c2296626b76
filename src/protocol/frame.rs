//! Frame assembly: pull a full header + body off the wire, and emit
//! responses as header + extras/key/value.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::status::Status;

use super::header::{HEADER_LEN, Header, MAGIC_REQUEST, MAGIC_RESPONSE};

/// A fully-framed inbound request: the header plus the three body slices it
/// describes (`extras || key || value`).
#[derive(Debug, Clone)]
pub struct Request {
    pub header: Header,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Request {
    pub fn opcode(&self) -> u8 {
        self.header.opcode
    }
}

/// Read one full frame (header + body) from an async stream. Returns `Ok(None)`
/// on a clean EOF at a frame boundary (connection closed between requests).
pub async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Option<Request>> {
    let mut header_buf = [0u8; HEADER_LEN];
    match read_exact_or_eof(stream, &mut header_buf).await? {
        false => return Ok(None),
        true => {}
    }

    let header = Header::parse(&header_buf);
    let body_len = header.body_len as usize;
    let mut body = BytesMut::zeroed(body_len);
    stream.read_exact(&mut body).await?;
    let body = body.freeze();

    let extras_len = header.extras_len as usize;
    let key_len = header.key_len as usize;
    if extras_len + key_len > body.len() {
        // Malformed framing; the validator would reject this opcode anyway,
        // but we must not panic while slicing. Surface empty slices and let
        // the validator's body-length accounting reject the packet.
        return Ok(Some(Request {
            header,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }));
    }

    let extras = body.slice(0..extras_len);
    let key = body.slice(extras_len..extras_len + key_len);
    let value = body.slice(extras_len + key_len..);

    Ok(Some(Request {
        header,
        extras,
        key,
        value,
    }))
}

/// Like `read_exact`, but returns `Ok(false)` instead of erroring when the
/// very first byte can't be read because the peer closed the connection.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-header",
            )));
        }
        filled += n;
    }
    Ok(true)
}

/// A response to be written back: header plus its three optional bodies.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Response {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_value(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }
}

/// Build a status-only response (no body) for the given opcode/opaque/cas.
pub fn status_response(opcode: u8, opaque: u32, status: Status, cas: u64) -> (Header, Response) {
    encode_response(opcode, opaque, status, cas, Response::empty())
}

/// Attach the current CAS and form a complete response header for `body`.
pub fn encode_response(
    opcode: u8,
    opaque: u32,
    status: Status,
    cas: u64,
    body: Response,
) -> (Header, Response) {
    let header = Header {
        magic: MAGIC_RESPONSE,
        opcode,
        key_len: body.key.len() as u16,
        extras_len: body.extras.len() as u8,
        datatype: 0,
        vbucket_or_status: status as u16,
        body_len: (body.extras.len() + body.key.len() + body.value.len()) as u32,
        opaque,
        cas,
    };
    (header, body)
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    header: &Header,
    body: &Response,
) -> Result<()> {
    stream.write_all(&header.encode()).await?;
    if !body.extras.is_empty() {
        stream.write_all(&body.extras).await?;
    }
    if !body.key.is_empty() {
        stream.write_all(&body.key).await?;
    }
    if !body.value.is_empty() {
        stream.write_all(&body.value).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// True if the header's magic byte marks it as a request.
pub fn is_request_magic(magic: u8) -> bool {
    magic == MAGIC_REQUEST
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::opcode::SUBDOC_GET;

    #[tokio::test]
    async fn reads_a_full_frame() {
        let header = Header {
            magic: MAGIC_REQUEST,
            opcode: SUBDOC_GET,
            key_len: 3,
            extras_len: 2,
            datatype: 0,
            vbucket_or_status: 0,
            body_len: 2 + 3 + 1,
            opaque: 1,
            cas: 0,
        };
        let mut wire = Vec::new();
        wire.extend_from_slice(&header.encode());
        wire.extend_from_slice(&[0u8, 1u8]); // extras: pathlen=1
        wire.extend_from_slice(b"key");
        wire.extend_from_slice(b"a");

        let mut cursor = std::io::Cursor::new(wire);
        let req = read_request(&mut cursor).await.unwrap().unwrap();
        assert_eq!(&req.extras[..], &[0u8, 1u8]);
        assert_eq!(&req.key[..], b"key");
        assert_eq!(&req.value[..], b"a");
    }

    #[tokio::test]
    async fn clean_eof_before_any_bytes_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let req = read_request(&mut cursor).await.unwrap();
        assert!(req.is_none());
    }

    #[test]
    fn status_response_has_no_body() {
        let (header, body) = status_response(SUBDOC_GET, 7, Status::KeyEnoent, 0);
        assert_eq!(header.vbucket_or_status, Status::KeyEnoent as u16);
        assert_eq!(header.body_len, 0);
        assert!(body.value.is_empty());
    }
}
