//! Tagged stream opcodes shared by the encoder and decoder.
//!
//! Any byte other than [`ESCAPE_CHAR`] is a literal. [`ESCAPE_CHAR`] is
//! always followed by one opcode byte:
//!
//! | op | payload |
//! |---|---|
//! | [`OP_ESCAPE`] | none; stands for a literal `0xf1` |
//! | [`OP_EXTRACT`] | hash (u64 BE) + one segment |
//! | [`OP_REF`] | hash (u64 BE) |
//! | [`OP_BACKREF`] | window slot (u8) |

use bytes::BufMut;

use crate::segment::SEGMENT_LENGTH;

/// Introduces every non-literal op
pub const ESCAPE_CHAR: u8 = 0xf1;
/// Literal [`ESCAPE_CHAR`]
pub const OP_ESCAPE: u8 = 0x00;
/// In-band declaration of a segment
pub const OP_EXTRACT: u8 = 0x01;
/// Reference by hash
pub const OP_REF: u8 = 0x02;
/// Reference by window slot
pub const OP_BACKREF: u8 = 0x03;

/// Encoded length of an EXTRACT op
pub const EXTRACT_LEN: usize = 2 + 8 + SEGMENT_LENGTH;
/// Encoded length of a REF op
pub const REF_LEN: usize = 2 + 8;
/// Encoded length of a BACKREF op
pub const BACKREF_LEN: usize = 2 + 1;

/// Append `data` as literals, escaping every [`ESCAPE_CHAR`].
pub fn escape_into<B: BufMut>(output: &mut B, data: &[u8]) {
    let mut rest = data;
    while let Some(at) = rest.iter().position(|&b| b == ESCAPE_CHAR) {
        output.put_slice(&rest[..at]);
        output.put_u8(ESCAPE_CHAR);
        output.put_u8(OP_ESCAPE);
        rest = &rest[at + 1..];
    }
    output.put_slice(rest);
}
