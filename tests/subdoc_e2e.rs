//! End-to-end scenarios against a real listener, driven over a TCP socket
//! exactly the way a memcached binary-protocol client would.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use subdocd::config::Config;
use subdocd::protocol::header::{HEADER_LEN, Header, MAGIC_REQUEST};
use subdocd::protocol::opcode;
use subdocd::server::spawn_with_shutdown;
use subdocd::status::Status;

struct Response {
    header: Header,
    body: Bytes,
}

async fn start_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<subdocd::error::Result<()>>) {
    let cfg = Config {
        listen_addr: "127.0.0.1:0".into(),
        ..Default::default()
    };
    spawn_with_shutdown(cfg).await.unwrap()
}

fn request(
    opcode: u8,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
    datatype: u8,
    cas: u64,
) -> Vec<u8> {
    let header = Header {
        magic: MAGIC_REQUEST,
        opcode,
        key_len: key.len() as u16,
        extras_len: extras.len() as u8,
        datatype,
        vbucket_or_status: 0,
        body_len: (extras.len() + key.len() + value.len()) as u32,
        opaque: 0,
        cas,
    };
    let mut wire = Vec::new();
    wire.extend_from_slice(&header.encode());
    wire.extend_from_slice(extras);
    wire.extend_from_slice(key);
    wire.extend_from_slice(value);
    wire
}

async fn roundtrip(stream: &mut TcpStream, wire: &[u8]) -> Response {
    stream.write_all(wire).await.unwrap();
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).await.unwrap();
    let header = Header::parse(&header_buf);
    let mut body = BytesMut::zeroed(header.body_len as usize);
    stream.read_exact(&mut body).await.unwrap();
    Response {
        header,
        body: body.freeze(),
    }
}

fn subdoc_single_extras(path: &str, flags: u8, expiry: Option<u32>) -> Vec<u8> {
    let mut extras = Vec::new();
    extras.extend_from_slice(&(path.len() as u16).to_be_bytes());
    extras.push(flags);
    if let Some(e) = expiry {
        extras.extend_from_slice(&e.to_be_bytes());
    }
    extras
}

/// Build a single-path sub-document request. The wire's "value" segment is
/// `path || mutate_value` (spec §6) — `parse_single` splits it back apart
/// using the path length carried in the extras.
fn subdoc_request(
    opcode: u8,
    key: &[u8],
    path: &str,
    flags: u8,
    expiry: Option<u32>,
    mutate_value: &[u8],
    cas: u64,
) -> Vec<u8> {
    let extras = subdoc_single_extras(path, flags, expiry);
    let mut body = path.as_bytes().to_vec();
    body.extend_from_slice(mutate_value);
    request(opcode, &extras, key, &body, 0, cas)
}

fn status_of(resp: &Response) -> Status {
    match resp.header.vbucket_or_status {
        0x0000 => Status::Success,
        0x0001 => Status::KeyEnoent,
        0x0002 => Status::KeyEexists,
        0x00c0 => Status::SubdocPathEnoent,
        0x00cc => Status::SubdocMultiPathFailure,
        other => panic!("unexpected status 0x{other:04x}"),
    }
}

async fn set_json(stream: &mut TcpStream, key: &[u8], json: &[u8]) -> u64 {
    let extras = [0u32.to_be_bytes(), 0u32.to_be_bytes()].concat();
    let wire = request(opcode::SET, &extras, key, json, 0x01, 0);
    let resp = roundtrip(stream, &wire).await;
    assert_eq!(status_of(&resp), Status::Success);
    resp.header.cas
}

#[tokio::test]
async fn s1_subdoc_get_into_array_element() {
    let (addr, _handle) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let cas_x = set_json(&mut stream, b"doc1", br#"{"a":[1,2,3]}"#).await;

    let wire = subdoc_request(opcode::SUBDOC_GET, b"doc1", "a[1]", 0, None, b"", 0);
    let resp = roundtrip(&mut stream, &wire).await;

    assert_eq!(status_of(&resp), Status::Success);
    assert_eq!(&resp.body[..], b"2");
    assert_eq!(resp.header.cas, cas_x);
}

#[tokio::test]
async fn s2_dict_add_with_auto_cas_retry() {
    let (addr, _handle) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    set_json(&mut stream, b"doc2", br#"{"a":1}"#).await;

    // A concurrent writer bumps the document's CAS a handful of times on
    // its own connection while the DICT_ADD below retries with cas=0.
    let writer_addr = addr;
    let writer = tokio::spawn(async move {
        let mut w = TcpStream::connect(writer_addr).await.unwrap();
        for _ in 0..5 {
            set_json(&mut w, b"doc2", br#"{"a":1}"#).await;
            tokio::task::yield_now().await;
        }
    });

    let wire = subdoc_request(opcode::SUBDOC_DICT_ADD, b"doc2", "b", 0, Some(0), b"2", 0);
    let resp = roundtrip(&mut stream, &wire).await;
    writer.await.unwrap();

    assert_eq!(status_of(&resp), Status::Success);

    let wire = subdoc_request(opcode::SUBDOC_GET, b"doc2", "b", 0, None, b"", 0);
    let resp = roundtrip(&mut stream, &wire).await;
    assert_eq!(status_of(&resp), Status::Success);
    assert_eq!(&resp.body[..], b"2");
}

#[tokio::test]
async fn s3_counter_increments_nested_path() {
    let (addr, _handle) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    set_json(&mut stream, b"doc3", br#"{"x":{"y":5}}"#).await;

    let wire = subdoc_request(opcode::SUBDOC_COUNTER, b"doc3", "x.y", 0, Some(0), b"3", 0);
    let resp = roundtrip(&mut stream, &wire).await;

    assert_eq!(status_of(&resp), Status::Success);
    assert_eq!(&resp.body[..], b"8");

    let wire = subdoc_request(opcode::SUBDOC_GET, b"doc3", "x.y", 0, None, b"", 0);
    let resp = roundtrip(&mut stream, &wire).await;
    assert_eq!(&resp.body[..], b"8");
}

#[tokio::test]
async fn s4_exists_on_compressed_json() {
    let (addr, _handle) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut encoder = snap::raw::Encoder::new();
    let compressed = encoder.compress_vec(br#"{"k":"v"}"#).unwrap();

    let extras = [0u32.to_be_bytes(), 0u32.to_be_bytes()].concat();
    let wire = request(opcode::SET, &extras, b"doc4", &compressed, 0x03, 0);
    let resp = roundtrip(&mut stream, &wire).await;
    assert_eq!(status_of(&resp), Status::Success);

    let wire = subdoc_request(opcode::SUBDOC_EXISTS, b"doc4", "k", 0, None, b"", 0);
    let resp = roundtrip(&mut stream, &wire).await;

    assert_eq!(status_of(&resp), Status::Success);
    assert!(resp.body.is_empty());
}

#[tokio::test]
async fn s5_multi_lookup_mixed_success_and_failure() {
    let (addr, _handle) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    set_json(&mut stream, b"doc5", br#"{"a":1,"b":2}"#).await;

    let mut body = Vec::new();
    for (op, path) in [
        (opcode::SUBDOC_GET, "a"),
        (opcode::SUBDOC_EXISTS, "missing"),
        (opcode::SUBDOC_GET, "b"),
    ] {
        body.push(op);
        body.push(0);
        body.extend_from_slice(&(path.len() as u16).to_be_bytes());
        body.extend_from_slice(path.as_bytes());
    }
    let wire = request(opcode::SUBDOC_MULTI_LOOKUP, &[], b"doc5", &body, 0, 0);
    let resp = roundtrip(&mut stream, &wire).await;

    assert_eq!(status_of(&resp), Status::SubdocMultiPathFailure);

    let b = &resp.body;
    assert_eq!(&b[0..2], &0u16.to_be_bytes()); // spec 0: SUCCESS
    assert_eq!(&b[2..6], &1u32.to_be_bytes());
    assert_eq!(&b[6..7], b"1");
    assert_eq!(&b[7..9], &0x00c0u16.to_be_bytes()); // spec 1: PATH_ENOENT
    assert_eq!(&b[9..13], &0u32.to_be_bytes());
    assert_eq!(&b[13..15], &0x0000u16.to_be_bytes()); // spec 2: SUCCESS
    assert_eq!(&b[15..19], &1u32.to_be_bytes());
    assert_eq!(&b[19..20], b"2");
}

#[tokio::test]
async fn malformed_magic_is_rejected_without_reaching_storage() {
    let (addr, _handle) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut wire = request(opcode::GET, &[], b"nope", &[], 0, 0);
    wire[0] = 0x00; // corrupt the magic byte
    let resp = roundtrip(&mut stream, &wire).await;
    assert_eq!(resp.header.vbucket_or_status, Status::Einval as u16);

    // The key was never touched, so a well-formed GET for it is ENOENT,
    // not some partially-applied state.
    let wire = request(opcode::GET, &[], b"nope", &[], 0, 0);
    let resp = roundtrip(&mut stream, &wire).await;
    assert_eq!(status_of(&resp), Status::KeyEnoent);
}

#[tokio::test]
async fn quiet_get_replies_on_hit_but_suppresses_on_miss() {
    let (addr, _handle) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    set_json(&mut stream, b"doc6", br#"{}"#).await;

    // GETQ on a hit replies normally, same as a plain GET.
    let wire = request(opcode::GETQ, &[], b"doc6", &[], 0, 0);
    let resp = roundtrip(&mut stream, &wire).await;
    assert_eq!(status_of(&resp), Status::Success);

    // GETQ on a miss sends nothing back; immediately follow with a NOOP
    // and confirm its response is the first thing that comes off the wire
    // (this is what makes a GETQ...GETQ...NOOP pipeline work).
    let getq = request(opcode::GETQ, &[], b"missing", &[], 0, 0);
    let noop = request(opcode::NOOP, &[], &[], &[], 0, 0);
    stream.write_all(&getq).await.unwrap();
    stream.write_all(&noop).await.unwrap();

    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).await.unwrap();
    let header = Header::parse(&header_buf);
    assert_eq!(header.opcode, opcode::NOOP);
}

#[tokio::test]
async fn quit_closes_the_connection() {
    let (addr, _handle) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let wire = request(opcode::QUIT, &[], &[], &[], 0, 0);
    let resp = roundtrip(&mut stream, &wire).await;
    assert_eq!(status_of(&resp), Status::Success);

    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "server must close the socket after QUIT");
}
