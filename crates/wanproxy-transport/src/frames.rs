//! Outstanding reference frames on the sending side.

use std::collections::VecDeque;

use wanproxy_xcodec::{ReferenceFrame, Segment};

use crate::error::{Result, TransportError};

/// FIFO of the reference frames of every FRAME the peer has not yet
/// acknowledged with ADVANCE.
#[derive(Debug, Default)]
pub struct ReferenceFrames {
    frames: VecDeque<ReferenceFrame>,
}

impl ReferenceFrames {
    /// Create an empty FIFO
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the frame of a FRAME just sent.
    pub fn push(&mut self, frame: ReferenceFrame) {
        self.frames.push_back(frame);
    }

    /// Find `hash`, searching the oldest frame first.
    pub fn find(&self, hash: u64) -> Option<&Segment> {
        self.frames.iter().find_map(|frame| frame.get(hash))
    }

    /// Drop the `count` oldest frames.
    pub fn advance(&mut self, count: usize) -> Result<()> {
        if count > self.frames.len() {
            return Err(TransportError::violation(format!(
                "ADVANCE of {} frames with only {} outstanding",
                count,
                self.frames.len()
            )));
        }
        self.frames.drain(..count);
        Ok(())
    }

    /// Drop every frame
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Number of unacknowledged frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True if every frame was acknowledged
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
