//! Wire codec (spec C1): header layout, opcode/traits table, and frame
//! assembly. Byte order on the wire is big-endian throughout.

pub mod frame;
pub mod header;
pub mod opcode;

pub use frame::{Request, Response, read_request, status_response, write_response};
pub use header::{HEADER_LEN, Header, MAGIC_REQUEST, MAGIC_RESPONSE};
