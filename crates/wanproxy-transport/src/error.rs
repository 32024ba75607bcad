use thiserror::Error;
use wanproxy_xcodec::XCodecError;

/// Errors raised by the synchronization protocol and its session driver.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer sent something the protocol does not allow at this point
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// What the peer did wrong
        reason: String,
    },

    /// Unknown wire opcode
    #[error("unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    /// A length-prefixed message is larger than allowed
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Announced size
        size: u32,
        /// Allowed maximum
        max_size: u32,
    },

    /// The local side misused the pipe
    #[error("invalid state: {reason}")]
    InvalidState {
        /// Description of the misuse
        reason: String,
    },

    /// The wire ended before both EOS handshakes completed
    #[error("unexpected end of wire stream: {reason}")]
    UnexpectedEof {
        /// Which handshake was still open
        reason: String,
    },

    /// A configuration value is out of range
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem
        reason: String,
    },

    /// The pipe pair failed or was closed
    #[error("pipe pair closed")]
    Closed,

    /// Encoding, decoding or a dictionary operation failed
    #[error(transparent)]
    Codec(#[from] XCodecError),

    /// Socket or stream I/O failed
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        TransportError::ProtocolViolation {
            reason: reason.into(),
        }
    }
}

/// Result type alias for the transport crate.
pub type Result<T> = std::result::Result<T, TransportError>;
