//! Back-reference window shared in lockstep by an encoder and its decoder.
//!
//! Both ends declare the same hashes in the same order, so a one-byte slot
//! index is enough to name a recently used segment.

use std::collections::HashMap;

use crate::segment::Segment;

/// Number of slots; an index always fits in one byte.
pub const WINDOW_SLOTS: usize = 256;

/// Fixed-size ring of recently declared or referenced segments.
#[derive(Debug, Clone)]
pub struct Window {
    slots: Vec<Option<(u64, Segment)>>,
    present: HashMap<u64, u8>,
    cursor: u8,
}

impl Default for Window {
    fn default() -> Self {
        Self::new()
    }
}

impl Window {
    /// Create an empty window
    pub fn new() -> Self {
        Self {
            slots: vec![None; WINDOW_SLOTS],
            present: HashMap::new(),
            cursor: 0,
        }
    }

    /// Record `hash` as recently used.
    ///
    /// A hash already in the window keeps its slot and only has its segment
    /// refreshed; otherwise the oldest slot is overwritten.
    pub fn declare(&mut self, hash: u64, segment: Segment) {
        if let Some(&index) = self.present.get(&hash) {
            self.slots[index as usize] = Some((hash, segment));
            return;
        }
        let index = self.cursor;
        if let Some((old, _)) = self.slots[index as usize].take() {
            self.present.remove(&old);
        }
        self.slots[index as usize] = Some((hash, segment));
        self.present.insert(hash, index);
        self.cursor = self.cursor.wrapping_add(1);
    }

    /// Slot index and segment for `hash`, if present.
    pub fn lookup(&self, hash: u64) -> Option<(u8, &Segment)> {
        let index = *self.present.get(&hash)?;
        self.slots[index as usize]
            .as_ref()
            .map(|(_, segment)| (index, segment))
    }

    /// Segment stored in slot `index`, if that slot has been filled.
    pub fn dereference(&self, index: u8) -> Option<&Segment> {
        self.slots[index as usize].as_ref().map(|(_, segment)| segment)
    }

    /// Number of filled slots
    pub fn len(&self) -> usize {
        self.present.len()
    }

    /// Is the window empty?
    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }
}
