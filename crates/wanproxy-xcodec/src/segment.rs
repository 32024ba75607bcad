//! Fixed-length content segments, the unit of deduplication.

use bytes::Bytes;

use crate::error::{XCodecError, XCodecResult};
use crate::hash::segment_hash;

/// Length in bytes of every dictionary segment and of every hashed window.
pub const SEGMENT_LENGTH: usize = 2048;

/// An immutable block of exactly [`SEGMENT_LENGTH`] bytes.
///
/// Clones share the underlying buffer; the bytes are freed when the last
/// clone held by any cache, window or reference frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment(Bytes);

impl Segment {
    /// Wrap a buffer, rejecting anything that is not exactly one segment long.
    pub fn new(data: Bytes) -> XCodecResult<Self> {
        if data.len() != SEGMENT_LENGTH {
            return Err(XCodecError::InvalidSegmentLength { length: data.len() });
        }
        Ok(Self(data))
    }

    /// Copy a slice into a new segment.
    pub fn from_slice(data: &[u8]) -> XCodecResult<Self> {
        Self::new(Bytes::copy_from_slice(data))
    }

    /// The raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// A cheap shared handle to the underlying buffer
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// Content hash of this segment
    pub fn hash(&self) -> u64 {
        segment_hash(&self.0)
    }

    /// True if `window` holds exactly the same bytes.
    pub fn matches(&self, window: &[u8]) -> bool {
        self.0.as_ref() == window
    }
}

impl AsRef<[u8]> for Segment {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
