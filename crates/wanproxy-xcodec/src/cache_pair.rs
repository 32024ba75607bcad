//! Two-tier cache: a primary in front of a secondary, promoting on hit.

use tracing::trace;

use crate::cache::{CacheStats, SharedCache, XCodecCache};
use crate::error::{XCodecError, XCodecResult};
use crate::segment::Segment;

/// Primary/secondary hierarchy.
///
/// Lookups try the primary first; a secondary hit is copied into the primary.
/// A primary hit touches the secondary so the entry does not age out of the
/// lower tier while it is hot in the upper one.
pub struct CachePair {
    primary: SharedCache,
    secondary: SharedCache,
}

impl CachePair {
    /// Pair two caches that agree on whether they are out of band.
    pub fn new(primary: SharedCache, secondary: SharedCache) -> XCodecResult<Self> {
        if primary.out_of_band() != secondary.out_of_band() {
            return Err(XCodecError::invalid_config(
                "cache pair mixes in-band and out-of-band tiers",
            ));
        }
        Ok(Self { primary, secondary })
    }

    /// The upper tier
    pub fn primary(&self) -> &SharedCache {
        &self.primary
    }

    /// The lower tier
    pub fn secondary(&self) -> &SharedCache {
        &self.secondary
    }
}

impl XCodecCache for CachePair {
    fn enter(&self, hash: u64, segment: Segment) -> XCodecResult<()> {
        self.primary.enter(hash, segment.clone())?;
        self.secondary.enter(hash, segment)
    }

    fn lookup(&self, hash: u64) -> XCodecResult<Option<Segment>> {
        if let Some(segment) = self.primary.lookup(hash)? {
            self.secondary.touch(hash, &segment)?;
            return Ok(Some(segment));
        }
        match self.secondary.lookup(hash)? {
            Some(segment) => {
                trace!(hash = format_args!("{:#018x}", hash), "promoting segment to primary");
                self.primary.enter(hash, segment.clone())?;
                Ok(Some(segment))
            }
            None => Ok(None),
        }
    }

    fn touch(&self, hash: u64, segment: &Segment) -> XCodecResult<()> {
        self.primary.touch(hash, segment)?;
        self.secondary.touch(hash, segment)
    }

    fn out_of_band(&self) -> bool {
        self.primary.out_of_band()
    }

    fn stats(&self) -> CacheStats {
        self.primary.stats()
    }
}
