//! Per-frame record of the segments an encoded frame depends on.

use std::collections::HashMap;

use crate::segment::Segment;

/// Segments declared or referenced while encoding one frame.
///
/// The sender keeps the frame until the peer acknowledges it so that any ASK
/// for one of these hashes can be answered even if the cache has since
/// evicted or replaced the entry.
#[derive(Debug, Clone, Default)]
pub struct ReferenceFrame {
    segments: HashMap<u64, Segment>,
}

impl ReferenceFrame {
    /// Create an empty frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that the frame uses `segment` under `hash`.
    pub fn record(&mut self, hash: u64, segment: Segment) {
        self.segments.insert(hash, segment);
    }

    /// The segment recorded under `hash`
    pub fn get(&self, hash: u64) -> Option<&Segment> {
        self.segments.get(&hash)
    }

    /// Number of distinct segments recorded
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SEGMENT_LENGTH;

    #[test]
    fn record_and_get() {
        let mut frame = ReferenceFrame::new();
        assert!(frame.is_empty());
        let seg = Segment::from_slice(&[3u8; SEGMENT_LENGTH]).unwrap();
        frame.record(seg.hash(), seg.clone());
        frame.record(seg.hash(), seg.clone());
        assert_eq!(frame.len(), 1);
        assert_eq!(frame.get(seg.hash()), Some(&seg));
        assert_eq!(frame.get(0), None);
    }
}
