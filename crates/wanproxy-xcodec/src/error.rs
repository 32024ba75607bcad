//! Error types for the wanproxy-xcodec subsystem

use uuid::Uuid;

/// Result type alias for codec and cache operations.
pub type XCodecResult<T> = Result<T, XCodecError>;

/// All errors that can occur while encoding, decoding or maintaining a dictionary
#[derive(Debug, thiserror::Error)]
pub enum XCodecError {
    /// Block or file I/O failed; fatal to the cache instance
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The tagged stream could not be parsed or contradicts itself
    #[error("Corrupt stream: {reason}")]
    CorruptStream {
        /// What was wrong with the stream
        reason: String,
    },
    /// A segment was built from a buffer of the wrong size
    #[error("Invalid segment length: {length} bytes")]
    InvalidSegmentLength {
        /// Length of the offending buffer
        length: usize,
    },
    /// The on-disk cache file is not usable (bad magic, version or geometry)
    #[error("Corrupt cache file: {reason}")]
    CorruptCacheFile {
        /// Description of the problem
        reason: String,
    },
    /// Every namespace slot is taken and garbage collection freed none
    #[error("Namespace table exhausted: cannot register {uuid}")]
    NamespaceExhausted {
        /// The peer identity that could not be registered
        uuid: Uuid,
    },
    /// A configuration value is out of range or inconsistent
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem
        reason: String,
    },
}

impl XCodecError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        XCodecError::CorruptStream {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        XCodecError::InvalidConfig {
            reason: reason.into(),
        }
    }
}
