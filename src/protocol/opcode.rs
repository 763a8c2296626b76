//! Opcode constants and the per-opcode traits table (spec §9 design note).
//!
//! All dispatch-time behavior is derived from [`OpTraits`] via [`traits_for`]
//! — there is no per-opcode switch anywhere else in the codebase beyond the
//! validator's own structural checks.

use crate::subdoc::engine::SubdocCommand;

pub const GET: u8 = 0x00;
pub const SET: u8 = 0x01;
pub const ADD: u8 = 0x02;
pub const REPLACE: u8 = 0x03;
pub const DELETE: u8 = 0x04;
pub const INCREMENT: u8 = 0x05;
pub const DECREMENT: u8 = 0x06;
pub const QUIT: u8 = 0x07;
pub const GETQ: u8 = 0x09;
pub const NOOP: u8 = 0x0a;
pub const VERSION: u8 = 0x0b;
pub const GETK: u8 = 0x0c;
pub const GETKQ: u8 = 0x0d;
pub const APPEND: u8 = 0x0e;
pub const PREPEND: u8 = 0x0f;
pub const SETQ: u8 = 0x11;
pub const ADDQ: u8 = 0x12;
pub const REPLACEQ: u8 = 0x13;
pub const DELETEQ: u8 = 0x14;
pub const INCREMENTQ: u8 = 0x15;
pub const DECREMENTQ: u8 = 0x16;
pub const APPENDQ: u8 = 0x19;
pub const PREPENDQ: u8 = 0x1a;
pub const TOUCH: u8 = 0x1c;
pub const IOCTL_GET: u8 = 0x1e;
pub const IOCTL_SET: u8 = 0x1f;

pub const SUBDOC_GET: u8 = 0xc5;
pub const SUBDOC_EXISTS: u8 = 0xc6;
pub const SUBDOC_DICT_ADD: u8 = 0xc7;
pub const SUBDOC_DICT_UPSERT: u8 = 0xc8;
pub const SUBDOC_DELETE: u8 = 0xc9;
pub const SUBDOC_REPLACE: u8 = 0xca;
pub const SUBDOC_ARRAY_PUSH_LAST: u8 = 0xcb;
pub const SUBDOC_ARRAY_PUSH_FIRST: u8 = 0xcc;
pub const SUBDOC_ARRAY_INSERT: u8 = 0xcd;
pub const SUBDOC_ARRAY_ADD_UNIQUE: u8 = 0xce;
pub const SUBDOC_COUNTER: u8 = 0xcf;
pub const SUBDOC_MULTI_LOOKUP: u8 = 0xd0;
pub const SUBDOC_MULTI_MUTATION: u8 = 0xd1;
pub const SUBDOC_GET_COUNT: u8 = 0xd2;

/// Sub-document flag bits carried in the extras (spec §6).
pub const SUBDOC_FLAG_MKDIR_P: u8 = 0x01;

/// Fixed extras length expected for an opcode's request, used by the
/// validator's "extras length equals the expected constant" rule. `None`
/// means the opcode's extras length is opcode-specific/variable and is
/// checked by a dedicated rule instead (sub-document single-path extras
/// carry an optional trailing expiry field).
pub fn fixed_extras_len(opcode: u8) -> Option<u8> {
    match opcode {
        GET | GETQ | GETK | GETKQ | DELETE | DELETEQ | NOOP | VERSION | QUIT => Some(0),
        SET | SETQ | ADD | ADDQ | REPLACE | REPLACEQ => Some(8),
        INCREMENT | INCREMENTQ | DECREMENT | DECREMENTQ => Some(20),
        APPEND | APPENDQ | PREPEND | PREPENDQ => Some(0),
        TOUCH => Some(4),
        IOCTL_GET => Some(0),
        IOCTL_SET => Some(0),
        SUBDOC_MULTI_LOOKUP | SUBDOC_MULTI_MUTATION => Some(0),
        _ => None,
    }
}

/// Compile-time/lookup-table record per sub-document opcode (spec §3
/// "Operation traits"). Basic K/V opcodes don't need the sub-document
/// columns and aren't represented here; [`is_subdoc_opcode`] distinguishes
/// the two families.
#[derive(Debug, Clone, Copy)]
pub struct OpTraits {
    pub is_mutator: bool,
    pub request_has_value: bool,
    pub response_has_value: bool,
    pub allow_empty_path: bool,
    pub valid_flags: u8,
    pub subdoc_cmd: SubdocCommand,
}

pub fn is_subdoc_opcode(opcode: u8) -> bool {
    matches!(
        opcode,
        SUBDOC_GET
            | SUBDOC_EXISTS
            | SUBDOC_DICT_ADD
            | SUBDOC_DICT_UPSERT
            | SUBDOC_DELETE
            | SUBDOC_REPLACE
            | SUBDOC_ARRAY_PUSH_LAST
            | SUBDOC_ARRAY_PUSH_FIRST
            | SUBDOC_ARRAY_INSERT
            | SUBDOC_ARRAY_ADD_UNIQUE
            | SUBDOC_COUNTER
            | SUBDOC_GET_COUNT
    )
}

pub fn is_subdoc_multi_opcode(opcode: u8) -> bool {
    matches!(opcode, SUBDOC_MULTI_LOOKUP | SUBDOC_MULTI_MUTATION)
}

/// Look up the traits record for a single-path sub-document opcode.
/// Returns `None` for non-sub-document opcodes (including the multi-path
/// opcodes, which are driven by the per-spec opcode inside the body, not by
/// their own traits record).
pub fn traits_for(opcode: u8) -> Option<OpTraits> {
    const MKDIR_P: u8 = SUBDOC_FLAG_MKDIR_P;
    match opcode {
        SUBDOC_GET => Some(OpTraits {
            is_mutator: false,
            request_has_value: false,
            response_has_value: true,
            allow_empty_path: false,
            valid_flags: 0,
            subdoc_cmd: SubdocCommand::Get,
        }),
        SUBDOC_EXISTS => Some(OpTraits {
            is_mutator: false,
            request_has_value: false,
            response_has_value: false,
            allow_empty_path: false,
            valid_flags: 0,
            subdoc_cmd: SubdocCommand::Exists,
        }),
        SUBDOC_GET_COUNT => Some(OpTraits {
            is_mutator: false,
            request_has_value: false,
            response_has_value: true,
            allow_empty_path: true,
            valid_flags: 0,
            subdoc_cmd: SubdocCommand::GetCount,
        }),
        SUBDOC_DICT_ADD => Some(OpTraits {
            is_mutator: true,
            request_has_value: true,
            response_has_value: false,
            allow_empty_path: false,
            valid_flags: MKDIR_P,
            subdoc_cmd: SubdocCommand::DictAdd,
        }),
        SUBDOC_DICT_UPSERT => Some(OpTraits {
            is_mutator: true,
            request_has_value: true,
            response_has_value: false,
            allow_empty_path: false,
            valid_flags: MKDIR_P,
            subdoc_cmd: SubdocCommand::DictUpsert,
        }),
        SUBDOC_DELETE => Some(OpTraits {
            is_mutator: true,
            request_has_value: false,
            response_has_value: false,
            allow_empty_path: false,
            valid_flags: 0,
            subdoc_cmd: SubdocCommand::Delete,
        }),
        SUBDOC_REPLACE => Some(OpTraits {
            is_mutator: true,
            request_has_value: true,
            response_has_value: false,
            allow_empty_path: false,
            valid_flags: 0,
            subdoc_cmd: SubdocCommand::Replace,
        }),
        SUBDOC_ARRAY_PUSH_LAST => Some(OpTraits {
            is_mutator: true,
            request_has_value: true,
            response_has_value: false,
            allow_empty_path: true,
            valid_flags: MKDIR_P,
            subdoc_cmd: SubdocCommand::ArrayPushLast,
        }),
        SUBDOC_ARRAY_PUSH_FIRST => Some(OpTraits {
            is_mutator: true,
            request_has_value: true,
            response_has_value: false,
            allow_empty_path: true,
            valid_flags: MKDIR_P,
            subdoc_cmd: SubdocCommand::ArrayPushFirst,
        }),
        SUBDOC_ARRAY_INSERT => Some(OpTraits {
            is_mutator: true,
            request_has_value: true,
            response_has_value: false,
            allow_empty_path: false,
            valid_flags: 0,
            subdoc_cmd: SubdocCommand::ArrayInsert,
        }),
        SUBDOC_ARRAY_ADD_UNIQUE => Some(OpTraits {
            is_mutator: true,
            request_has_value: true,
            response_has_value: false,
            allow_empty_path: true,
            valid_flags: MKDIR_P,
            subdoc_cmd: SubdocCommand::ArrayAddUnique,
        }),
        SUBDOC_COUNTER => Some(OpTraits {
            is_mutator: true,
            request_has_value: true,
            response_has_value: true,
            allow_empty_path: true,
            valid_flags: MKDIR_P,
            subdoc_cmd: SubdocCommand::Counter,
        }),
        _ => None,
    }
}

/// Quiet (`*Q`) K/V opcodes suppress a response in one direction or the
/// other; errors outside that direction are always sent regardless.
pub fn is_quiet(opcode: u8) -> bool {
    matches!(
        opcode,
        GETQ | SETQ
            | ADDQ
            | REPLACEQ
            | DELETEQ
            | INCREMENTQ
            | DECREMENTQ
            | APPENDQ
            | PREPENDQ
            | GETKQ
    )
}

/// True for the retrieval-quiet opcodes (`GETQ`/`GETKQ`), whose "suppress"
/// direction is inverted relative to every other quiet opcode: memcached's
/// binary protocol replies on a hit and stays silent on a miss, which is
/// what lets a `GETQ ... GETQ NOOP` pipeline skip straight to the `NOOP`
/// response when every key hits.
pub fn is_retrieval_quiet(opcode: u8) -> bool {
    matches!(opcode, GETQ | GETKQ)
}
