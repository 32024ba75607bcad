//! Wire messages of the XCodec synchronization protocol.
//!
//! Every message starts with a one-byte opcode. Multi-byte integers are big
//! endian. Length-prefixed messages are only parsed once complete.
//!
//! | op | byte | payload |
//! |---|---|---|
//! | FRAME | `0x00` | length u32 + tagged stream bytes |
//! | HELLO | `0xff` | length u8 (16) + UUID |
//! | LEARN | `0xfe` | count u16 + count segments |
//! | ASK | `0xfd` | count u16 + count hashes (u64) |
//! | EOS | `0xfc` | none |
//! | EOS_ACK | `0xfb` | none |
//! | ADVANCE | `0xfa` | count u32 |

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;
use wanproxy_xcodec::{Segment, SEGMENT_LENGTH};

use crate::error::{Result, TransportError};

/// Largest FRAME payload accepted or produced
pub const MAX_FRAME_LENGTH: u32 = 1024 * 1024;

/// Largest number of hashes in one ASK (and segments in one LEARN)
pub const MAX_ASK_HASHES: usize = 512;

/// Length of the HELLO identity payload
pub const HELLO_UUID_LENGTH: u8 = 16;

/// Wire opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Encoded data
    Frame = 0x00,
    /// Sender identity, first message in each direction
    Hello = 0xff,
    /// Segments answering an ASK
    Learn = 0xfe,
    /// Request for unknown segments
    Ask = 0xfd,
    /// No more FRAMEs will follow
    Eos = 0xfc,
    /// Peer's EOS received and everything before it decoded
    EosAck = 0xfb,
    /// Number of frames fully decoded since the last ADVANCE
    Advance = 0xfa,
}

impl TryFrom<u8> for Opcode {
    type Error = TransportError;

    fn try_from(b: u8) -> Result<Self> {
        Ok(match b {
            0x00 => Opcode::Frame,
            0xff => Opcode::Hello,
            0xfe => Opcode::Learn,
            0xfd => Opcode::Ask,
            0xfc => Opcode::Eos,
            0xfb => Opcode::EosAck,
            0xfa => Opcode::Advance,
            other => return Err(TransportError::UnknownOpcode(other)),
        })
    }
}

/// One parsed wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Tagged stream produced by one encoder call
    Frame(BytesMut),
    /// Sender's cache identity
    Hello(Uuid),
    /// Segments in the order they were asked for
    Learn(Vec<Segment>),
    /// Hashes the sender's decoder is stalled on
    Ask(Vec<u64>),
    /// End of stream
    Eos,
    /// End of stream acknowledged
    EosAck,
    /// Frames fully decoded
    Advance(u32),
}

impl Message {
    /// The opcode this message is sent with
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Frame(_) => Opcode::Frame,
            Message::Hello(_) => Opcode::Hello,
            Message::Learn(_) => Opcode::Learn,
            Message::Ask(_) => Opcode::Ask,
            Message::Eos => Opcode::Eos,
            Message::EosAck => Opcode::EosAck,
            Message::Advance(_) => Opcode::Advance,
        }
    }

    /// Append the wire encoding to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.opcode() as u8);
        match self {
            Message::Frame(payload) => {
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            Message::Hello(uuid) => {
                buf.put_u8(HELLO_UUID_LENGTH);
                buf.put_slice(uuid.as_bytes());
            }
            Message::Learn(segments) => {
                buf.reserve(2 + segments.len() * SEGMENT_LENGTH);
                buf.put_u16(segments.len() as u16);
                for segment in segments {
                    buf.put_slice(segment.as_bytes());
                }
            }
            Message::Ask(hashes) => {
                buf.put_u16(hashes.len() as u16);
                for hash in hashes {
                    buf.put_u64(*hash);
                }
            }
            Message::Eos | Message::EosAck => {}
            Message::Advance(count) => buf.put_u32(*count),
        }
    }

    /// Total encoded length
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Message::Frame(payload) => 4 + payload.len(),
            Message::Hello(_) => 1 + HELLO_UUID_LENGTH as usize,
            Message::Learn(segments) => 2 + segments.len() * SEGMENT_LENGTH,
            Message::Ask(hashes) => 2 + hashes.len() * 8,
            Message::Eos | Message::EosAck => 0,
            Message::Advance(_) => 4,
        }
    }

    /// Remove one complete message from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched if more bytes are needed.
    /// Malformed headers are rejected as soon as they are visible.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Message>> {
        let Some(&op) = buf.first() else {
            return Ok(None);
        };
        let opcode = Opcode::try_from(op)?;
        let message = match opcode {
            Opcode::Eos => {
                buf.advance(1);
                Message::Eos
            }
            Opcode::EosAck => {
                buf.advance(1);
                Message::EosAck
            }
            Opcode::Frame => {
                let Some(length) = peek_u32(buf) else {
                    return Ok(None);
                };
                if length == 0 {
                    return Err(TransportError::violation("zero-length FRAME"));
                }
                if length > MAX_FRAME_LENGTH {
                    return Err(TransportError::PayloadTooLarge {
                        size: length,
                        max_size: MAX_FRAME_LENGTH,
                    });
                }
                if buf.len() < 5 + length as usize {
                    return Ok(None);
                }
                buf.advance(5);
                Message::Frame(buf.split_to(length as usize))
            }
            Opcode::Hello => {
                let Some(&length) = buf.get(1) else {
                    return Ok(None);
                };
                if length != HELLO_UUID_LENGTH {
                    return Err(TransportError::violation(format!(
                        "HELLO carries {} bytes, expected {}",
                        length, HELLO_UUID_LENGTH
                    )));
                }
                if buf.len() < 2 + length as usize {
                    return Ok(None);
                }
                buf.advance(2);
                let mut raw = [0u8; 16];
                buf.copy_to_slice(&mut raw);
                Message::Hello(Uuid::from_bytes(raw))
            }
            Opcode::Learn => {
                let Some(count) = peek_count(buf)? else {
                    return Ok(None);
                };
                if buf.len() < 3 + count * SEGMENT_LENGTH {
                    return Ok(None);
                }
                buf.advance(3);
                let payload = buf.split_to(count * SEGMENT_LENGTH).freeze();
                let segments = (0..count)
                    .map(|i| Segment::new(payload.slice(i * SEGMENT_LENGTH..(i + 1) * SEGMENT_LENGTH)))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Message::Learn(segments)
            }
            Opcode::Ask => {
                let Some(count) = peek_count(buf)? else {
                    return Ok(None);
                };
                if buf.len() < 3 + count * 8 {
                    return Ok(None);
                }
                buf.advance(3);
                Message::Ask((0..count).map(|_| buf.get_u64()).collect())
            }
            Opcode::Advance => {
                let Some(count) = peek_u32(buf) else {
                    return Ok(None);
                };
                if count == 0 {
                    return Err(TransportError::violation("ADVANCE of zero frames"));
                }
                buf.advance(5);
                Message::Advance(count)
            }
        };
        Ok(Some(message))
    }
}

fn peek_u32(buf: &[u8]) -> Option<u32> {
    let raw = buf.get(1..5)?;
    Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// u16 count of an ASK or LEARN, validated against [`MAX_ASK_HASHES`].
fn peek_count(buf: &[u8]) -> Result<Option<usize>> {
    let Some(raw) = buf.get(1..3) else {
        return Ok(None);
    };
    let count = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    if count == 0 || count > MAX_ASK_HASHES {
        return Err(TransportError::violation(format!(
            "count {} outside 1..={}",
            count, MAX_ASK_HASHES
        )));
    }
    Ok(Some(count))
}
