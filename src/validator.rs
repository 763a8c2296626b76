//! Request validator (spec C2). Runs before any engine call; a validation
//! failure always yields a status and never touches the engine (spec §8
//! property 1).

use crate::protocol::header::MAGIC_REQUEST;
use crate::protocol::opcode::{self, OpTraits};
use crate::protocol::{Request, opcode::SUBDOC_FLAG_MKDIR_P};
use crate::status::Status;
use crate::subdoc::path::MAX_PATH_LEN;

const MAX_MULTI_SPECS: usize = 16;

/// A parsed multi-path spec header, as it appears inside a multi-lookup or
/// multi-mutation body (spec §6): `opcode | flags | pathlen(u16) | path`.
pub struct RawSpec<'a> {
    pub opcode: u8,
    pub flags: u8,
    pub path: &'a [u8],
    pub value: &'a [u8],
}

/// Validate a request. Returns the traits record for single-path
/// sub-document opcodes so the executor doesn't have to look it up again.
pub fn validate(req: &Request) -> Result<(), Status> {
    if req.header.magic != MAGIC_REQUEST {
        return Err(Status::Einval);
    }

    let opcode = req.opcode();

    if opcode::is_subdoc_opcode(opcode) {
        return validate_subdoc_single(req, opcode::traits_for(opcode).ok_or(Status::UnknownCommand)?);
    }
    if opcode::is_subdoc_multi_opcode(opcode) {
        return validate_subdoc_multi(req, opcode == opcode::SUBDOC_MULTI_MUTATION);
    }

    validate_basic_kv(req)
}

fn validate_basic_kv(req: &Request) -> Result<(), Status> {
    let opcode = req.opcode();
    if let Some(expected) = opcode::fixed_extras_len(opcode) {
        if req.header.extras_len != expected {
            return Err(Status::Einval);
        }
    } else {
        return Err(Status::UnknownCommand);
    }

    let allows_empty_key = matches!(opcode, opcode::NOOP | opcode::VERSION | opcode::QUIT);
    if req.key.is_empty() && !allows_empty_key {
        return Err(Status::Einval);
    }

    if req.header.datatype != 0 && req.header.datatype != 1 {
        return Err(Status::Einval);
    }

    let declared_rest = req
        .header
        .body_len
        .saturating_sub(req.header.extras_len as u32)
        .saturating_sub(req.header.key_len as u32);
    if declared_rest as usize != req.value.len() {
        return Err(Status::Einval);
    }

    Ok(())
}

/// Sub-document extras: `pathlen(u16) | subdoc_flags(u8) [ | expiry(u32) ]`.
/// The trailing expiry field is present only for mutators; its absence for
/// non-mutators is why extras length isn't a single fixed-opcode constant
/// the way basic K/V opcodes are.
struct SubdocExtras {
    path_len: u16,
    flags: u8,
}

fn parse_subdoc_extras(extras: &[u8], is_mutator: bool) -> Result<SubdocExtras, Status> {
    let expected_len: &[usize] = if is_mutator { &[3, 7] } else { &[3] };
    if !expected_len.contains(&extras.len()) {
        return Err(Status::Einval);
    }
    let path_len = u16::from_be_bytes([extras[0], extras[1]]);
    let flags = extras[2];
    Ok(SubdocExtras { path_len, flags })
}

fn validate_subdoc_single(req: &Request, traits: OpTraits) -> Result<(), Status> {
    if req.key.is_empty() {
        return Err(Status::Einval);
    }
    if req.header.datatype != 0 {
        return Err(Status::Einval);
    }

    let extras = parse_subdoc_extras(&req.extras, traits.is_mutator)?;

    if extras.flags & !traits.valid_flags != 0 {
        return Err(Status::Einval);
    }

    let path_len = extras.path_len as usize;
    if path_len == 0 && !traits.allow_empty_path {
        return Err(Status::Einval);
    }
    if path_len > MAX_PATH_LEN {
        return Err(Status::SubdocPathE2big);
    }

    let declared_rest = req
        .header
        .body_len
        .saturating_sub(req.header.extras_len as u32)
        .saturating_sub(req.header.key_len as u32) as usize;
    if declared_rest != req.value.len() {
        return Err(Status::Einval);
    }
    if path_len > req.value.len() {
        return Err(Status::Einval);
    }

    let value_len = req.value.len() - path_len;
    let has_value = value_len > 0;
    if has_value != traits.request_has_value {
        return Err(Status::Einval);
    }

    std::str::from_utf8(&req.value[..path_len]).map_err(|_| Status::SubdocPathEinval)?;

    Ok(())
}

/// The pieces of a single-path sub-document request, split out after
/// `validate` has already accepted it. Kept separate from `validate` so the
/// executor never has to re-derive lengths by hand.
pub struct ParsedSingle<'a> {
    pub path: &'a str,
    pub value: &'a [u8],
    pub flags: u8,
    pub expiry: Option<u32>,
}

/// Parse a single-path sub-document request's extras/value split. Callers
/// must have already run this request through `validate` successfully.
pub fn parse_single<'a>(req: &'a Request, traits: &OpTraits) -> ParsedSingle<'a> {
    let extras = &req.extras[..];
    let path_len = u16::from_be_bytes([extras[0], extras[1]]) as usize;
    let flags = extras[2];
    let expiry = if extras.len() == 7 {
        Some(u32::from_be_bytes([
            extras[3], extras[4], extras[5], extras[6],
        ]))
    } else {
        None
    };
    let path = std::str::from_utf8(&req.value[..path_len]).unwrap_or("");
    let value = &req.value[path_len..];
    let _ = traits;
    ParsedSingle {
        path,
        value,
        flags,
        expiry,
    }
}

fn validate_subdoc_multi(req: &Request, is_mutation: bool) -> Result<(), Status> {
    if req.header.extras_len != 0 {
        return Err(Status::Einval);
    }
    if req.key.is_empty() {
        return Err(Status::Einval);
    }
    if req.header.datatype != 0 {
        return Err(Status::Einval);
    }

    let body = &req.value[..];
    let min_spec_len = 4; // opcode(1) + flags(1) + pathlen(2), possibly zero-length path/value
    if body.len() < min_spec_len {
        return Err(Status::Einval);
    }

    let mut offset = 0;
    let mut count = 0usize;

    while offset < body.len() {
        if count >= MAX_MULTI_SPECS {
            return Err(Status::Einval);
        }
        if body.len() - offset < 4 {
            return Err(Status::Einval);
        }
        let spec_opcode = body[offset];
        let spec_flags = body[offset + 1];
        let path_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        offset += 4;

        if path_len > MAX_PATH_LEN {
            return Err(Status::SubdocPathE2big);
        }
        if body.len() - offset < path_len {
            return Err(Status::Einval);
        }
        let path = &body[offset..offset + path_len];
        offset += path_len;

        let traits = if is_mutation {
            let t = crate::protocol::opcode::traits_for(spec_opcode).ok_or(Status::Einval)?;
            if !t.is_mutator {
                return Err(Status::Einval);
            }
            t
        } else {
            if !matches!(spec_opcode, opcode::SUBDOC_GET | opcode::SUBDOC_EXISTS) {
                return Err(Status::Einval);
            }
            crate::protocol::opcode::traits_for(spec_opcode).ok_or(Status::Einval)?
        };

        if spec_flags & !traits.valid_flags != 0 {
            return Err(Status::Einval);
        }
        if path_len == 0 && !traits.allow_empty_path {
            return Err(Status::Einval);
        }
        std::str::from_utf8(path).map_err(|_| Status::SubdocPathEinval)?;

        let value_len = if is_mutation && traits.request_has_value {
            if body.len() - offset < 4 {
                return Err(Status::Einval);
            }
            let len = u32::from_be_bytes([
                body[offset],
                body[offset + 1],
                body[offset + 2],
                body[offset + 3],
            ]) as usize;
            offset += 4;
            if body.len() - offset < len {
                return Err(Status::Einval);
            }
            offset += len;
            len
        } else {
            0
        };
        let _ = value_len;

        count += 1;
    }

    if count == 0 || count > MAX_MULTI_SPECS {
        return Err(Status::Einval);
    }
    if offset != body.len() {
        // Trailing junk or truncation: consumed bytes must exactly equal
        // declared body length (spec §4.2).
        return Err(Status::Einval);
    }

    Ok(())
}

/// Parse a validated multi-lookup body into its specs (opcode/flags/path,
/// no value — multi-lookup specs never carry one).
pub fn parse_multi_lookup_specs(body: &[u8]) -> Vec<RawSpec<'_>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        let spec_opcode = body[offset];
        let flags = body[offset + 1];
        let path_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        offset += 4;
        let path = &body[offset..offset + path_len];
        offset += path_len;
        out.push(RawSpec {
            opcode: spec_opcode,
            flags,
            path,
            value: &[],
        });
    }
    out
}

/// Parse a validated multi-mutation body into its specs, including values.
pub fn parse_multi_mutation_specs(body: &[u8]) -> Vec<RawSpec<'_>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        let spec_opcode = body[offset];
        let flags = body[offset + 1];
        let path_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        offset += 4;
        let path = &body[offset..offset + path_len];
        offset += path_len;

        let traits = crate::protocol::opcode::traits_for(spec_opcode);
        let value = if traits.map(|t| t.request_has_value).unwrap_or(false) {
            let len = u32::from_be_bytes([
                body[offset],
                body[offset + 1],
                body[offset + 2],
                body[offset + 3],
            ]) as usize;
            offset += 4;
            let v = &body[offset..offset + len];
            offset += len;
            v
        } else {
            &[]
        };

        out.push(RawSpec {
            opcode: spec_opcode,
            flags,
            path,
            value,
        });
    }
    out
}

/// Whether the extras carry the MKDIR_P bit.
pub fn mkdir_p(flags: u8) -> bool {
    flags & SUBDOC_FLAG_MKDIR_P != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::{Header, MAGIC_REQUEST};
    use bytes::Bytes;

    fn req(opcode: u8, extras: Vec<u8>, key: &[u8], value: Vec<u8>, datatype: u8) -> Request {
        Request {
            header: Header {
                magic: MAGIC_REQUEST,
                opcode,
                key_len: key.len() as u16,
                extras_len: extras.len() as u8,
                datatype,
                vbucket_or_status: 0,
                body_len: (extras.len() + key.len() + value.len()) as u32,
                opaque: 0,
                cas: 0,
            },
            extras: Bytes::from(extras),
            key: Bytes::copy_from_slice(key),
            value: Bytes::from(value),
        }
    }

    fn subdoc_get_request(path: &str) -> Request {
        let mut extras = vec![0u8; 3];
        extras[0..2].copy_from_slice(&(path.len() as u16).to_be_bytes());
        req(
            opcode::SUBDOC_GET,
            extras,
            b"key",
            path.as_bytes().to_vec(),
            0,
        )
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut r = subdoc_get_request("a");
        r.header.magic = 0x00;
        assert_eq!(validate(&r), Err(Status::Einval));
    }

    #[test]
    fn empty_key_is_rejected_for_subdoc_get() {
        let r = req(
            opcode::SUBDOC_GET,
            vec![0, 1, 0],
            b"",
            b"a".to_vec(),
            0,
        );
        assert_eq!(validate(&r), Err(Status::Einval));
    }

    #[test]
    fn path_over_1024_bytes_is_rejected() {
        let long_path = "a".repeat(1025);
        let r = subdoc_get_request(&long_path);
        assert_eq!(validate(&r), Err(Status::SubdocPathE2big));
    }

    #[test]
    fn zero_length_path_rejected_when_not_allowed() {
        let r = subdoc_get_request("");
        assert_eq!(validate(&r), Err(Status::Einval));
    }

    #[test]
    fn zero_length_path_allowed_for_get_count() {
        let r = req(opcode::SUBDOC_GET_COUNT, vec![0, 0, 0], b"key", vec![], 0);
        assert!(validate(&r).is_ok());
    }

    #[test]
    fn invalid_flag_bit_is_rejected() {
        let mut extras = vec![0u8, 1, 0b0000_0010];
        extras[0..2].copy_from_slice(&1u16.to_be_bytes());
        let r = req(opcode::SUBDOC_GET, extras, b"key", b"a".to_vec(), 0);
        assert_eq!(validate(&r), Err(Status::Einval));
    }

    #[test]
    fn value_present_when_not_expected_is_rejected() {
        // SUBDOC_GET must not carry a value.
        let mut extras = vec![0u8; 3];
        extras[0..2].copy_from_slice(&1u16.to_be_bytes());
        let r = req(opcode::SUBDOC_GET, extras, b"key", b"a_extra".to_vec(), 0);
        assert_eq!(validate(&r), Err(Status::Einval));
    }

    fn multi_lookup_body(specs: &[(u8, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (op, path) in specs {
            body.push(*op);
            body.push(0);
            body.extend_from_slice(&(path.len() as u16).to_be_bytes());
            body.extend_from_slice(path.as_bytes());
        }
        body
    }

    #[test]
    fn multi_lookup_accepts_one_to_sixteen_specs() {
        let specs: Vec<(u8, &str)> = (0..16).map(|_| (opcode::SUBDOC_GET, "a")).collect();
        let body = multi_lookup_body(&specs);
        let r = req(opcode::SUBDOC_MULTI_LOOKUP, vec![], b"key", body, 0);
        assert!(validate(&r).is_ok());
    }

    #[test]
    fn multi_lookup_rejects_seventeen_specs() {
        let specs: Vec<(u8, &str)> = (0..17).map(|_| (opcode::SUBDOC_GET, "a")).collect();
        let body = multi_lookup_body(&specs);
        let r = req(opcode::SUBDOC_MULTI_LOOKUP, vec![], b"key", body, 0);
        assert_eq!(validate(&r), Err(Status::Einval));
    }

    #[test]
    fn multi_lookup_rejects_mutator_opcode() {
        let body = multi_lookup_body(&[(opcode::SUBDOC_DICT_ADD, "a")]);
        let r = req(opcode::SUBDOC_MULTI_LOOKUP, vec![], b"key", body, 0);
        assert_eq!(validate(&r), Err(Status::Einval));
    }

    #[test]
    fn multi_lookup_rejects_nested_multi_opcode() {
        let body = multi_lookup_body(&[(opcode::SUBDOC_MULTI_LOOKUP, "a")]);
        let r = req(opcode::SUBDOC_MULTI_LOOKUP, vec![], b"key", body, 0);
        assert_eq!(validate(&r), Err(Status::Einval));
    }

    #[test]
    fn multi_lookup_rejects_trailing_junk() {
        let mut body = multi_lookup_body(&[(opcode::SUBDOC_GET, "a")]);
        body.push(0xff);
        let r = req(opcode::SUBDOC_MULTI_LOOKUP, vec![], b"key", body, 0);
        assert_eq!(validate(&r), Err(Status::Einval));
    }

    #[test]
    fn multi_lookup_rejects_truncated_body() {
        let mut body = multi_lookup_body(&[(opcode::SUBDOC_GET, "a")]);
        body.pop();
        let r = req(opcode::SUBDOC_MULTI_LOOKUP, vec![], b"key", body, 0);
        assert_eq!(validate(&r), Err(Status::Einval));
    }

    #[test]
    fn basic_get_requires_empty_extras() {
        let r = req(opcode::GET, vec![1], b"key", vec![], 0);
        assert_eq!(validate(&r), Err(Status::Einval));
    }

    #[test]
    fn noop_allows_empty_key() {
        let r = req(opcode::NOOP, vec![], b"", vec![], 0);
        assert!(validate(&r).is_ok());
    }
}
