//! Fixed 24-byte packet header. All multi-byte integers are big-endian.
//!
//! ```text
//! magic(u8) | opcode(u8) | keylen(u16) | extlen(u8) | datatype(u8)
//! | vbucket_or_status(u16) | bodylen(u32) | opaque(u32) | cas(u64)
//! ```

pub const HEADER_LEN: usize = 24;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub datatype: u8,
    pub vbucket_or_status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Header {
        Header {
            magic: buf[0],
            opcode: buf[1],
            key_len: u16::from_be_bytes([buf[2], buf[3]]),
            extras_len: buf[4],
            datatype: buf[5],
            vbucket_or_status: u16::from_be_bytes([buf[6], buf[7]]),
            body_len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.magic;
        out[1] = self.opcode;
        out[2..4].copy_from_slice(&self.key_len.to_be_bytes());
        out[4] = self.extras_len;
        out[5] = self.datatype;
        out[6..8].copy_from_slice(&self.vbucket_or_status.to_be_bytes());
        out[8..12].copy_from_slice(&self.body_len.to_be_bytes());
        out[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        out[16..24].copy_from_slice(&self.cas.to_be_bytes());
        out
    }

    /// Value length is whatever's left of the body after extras and key.
    /// Saturates to 0 if the declared lengths are inconsistent; the
    /// validator is responsible for rejecting that case before it matters.
    pub fn value_len(&self) -> usize {
        (self.body_len as usize)
            .saturating_sub(self.extras_len as usize)
            .saturating_sub(self.key_len as usize)
    }
}
