//! In-memory dictionary with optional LRU bound.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cache::{CacheStats, XCodecCache};
use crate::error::XCodecResult;
use crate::segment::Segment;

#[derive(Debug)]
struct Entry {
    segment: Segment,
    stamp: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<u64, Entry>,
    /// recency stamp -> hash, oldest first
    recency: BTreeMap<u64, u64>,
    clock: u64,
    stats: CacheStats,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn refresh(&mut self, hash: u64) {
        let stamp = self.tick();
        if let Some(entry) = self.entries.get_mut(&hash) {
            self.recency.remove(&entry.stamp);
            entry.stamp = stamp;
            self.recency.insert(stamp, hash);
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((_, hash)) = self.recency.pop_first() {
            self.entries.remove(&hash);
            self.stats.evictions += 1;
            trace!(hash = format_args!("{:#018x}", hash), "evicted memory cache entry");
        }
    }
}

/// Hash → segment map, optionally bounded to `max_entries` with LRU eviction.
///
/// Never out of band: a private memory cache is not shared with the peer, so
/// encoders using it declare segments in band.
#[derive(Debug)]
pub struct MemoryCache {
    max_entries: Option<usize>,
    inner: Mutex<Inner>,
}

impl MemoryCache {
    /// Create a cache; `None` or `Some(0)` means unbounded.
    pub fn new(max_entries: Option<usize>) -> Self {
        let max_entries = max_entries.filter(|&n| n > 0);
        debug!(?max_entries, "created memory cache");
        Self {
            max_entries,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create an unbounded cache
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Number of cached segments
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Is the cache empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `hash` is cached, without touching recency.
    pub fn contains(&self, hash: u64) -> bool {
        self.inner.lock().entries.contains_key(&hash)
    }
}

impl XCodecCache for MemoryCache {
    fn enter(&self, hash: u64, segment: Segment) -> XCodecResult<()> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.get_mut(&hash) {
            if existing.segment != segment {
                existing.segment = segment;
            }
            inner.refresh(hash);
            return Ok(());
        }
        if let Some(max) = self.max_entries {
            while inner.entries.len() >= max {
                inner.evict_oldest();
            }
        }
        let stamp = inner.tick();
        inner.recency.insert(stamp, hash);
        inner.entries.insert(hash, Entry { segment, stamp });
        inner.stats.insertions += 1;
        Ok(())
    }

    fn lookup(&self, hash: u64) -> XCodecResult<Option<Segment>> {
        let mut inner = self.inner.lock();
        let found = inner.entries.get(&hash).map(|e| e.segment.clone());
        match found {
            Some(segment) => {
                inner.refresh(hash);
                inner.stats.hits += 1;
                Ok(Some(segment))
            }
            None => {
                inner.stats.misses += 1;
                Ok(None)
            }
        }
    }

    fn touch(&self, hash: u64, _segment: &Segment) -> XCodecResult<()> {
        self.inner.lock().refresh(hash);
        Ok(())
    }

    fn out_of_band(&self) -> bool {
        false
    }

    fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }
}
