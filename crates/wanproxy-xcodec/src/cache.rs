//! Dictionary cache interface and the per-process cache registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache_pair::CachePair;
use crate::config::CacheConfig;
use crate::disk_cache::DiskStore;
use crate::error::{XCodecError, XCodecResult};
use crate::memory_cache::MemoryCache;
use crate::segment::Segment;

/// Counters common to every cache backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups that found a segment
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// New entries stored
    pub insertions: u64,
    /// Entries dropped to make room
    pub evictions: u64,
}

impl CacheStats {
    /// Ratio of hits to lookups, 0.0 with no lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A namespaced hash → segment dictionary.
///
/// Implementations synchronise internally so one cache can be shared by
/// several encoders and decoders through an `Arc`.
pub trait XCodecCache: Send + Sync {
    /// Insert or replace the segment named `hash`.
    fn enter(&self, hash: u64, segment: Segment) -> XCodecResult<()>;

    /// Fetch the segment named `hash`.
    fn lookup(&self, hash: u64) -> XCodecResult<Option<Segment>>;

    /// Note that `hash` is still in use so the backend keeps it around.
    fn touch(&self, hash: u64, segment: &Segment) -> XCodecResult<()> {
        let _ = (hash, segment);
        Ok(())
    }

    /// True if the peer can be assumed to reach this cache's contents without
    /// the bytes travelling inside the stream.
    fn out_of_band(&self) -> bool;

    /// Snapshot of the backend's counters
    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Shared handle to a namespaced cache
pub type SharedCache = Arc<dyn XCodecCache>;

/// Owns every namespaced cache of one process (or one test).
///
/// Encoders use the local namespace; decoders use the namespace of the peer
/// that announced itself in HELLO. Disk stores are opened once per path and
/// shared by every namespace that lives in them.
pub struct CacheRegistry {
    config: CacheConfig,
    local_uuid: Uuid,
    stores: Mutex<HashMap<PathBuf, Arc<DiskStore>>>,
    caches: Mutex<HashMap<Uuid, SharedCache>>,
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("config", &self.config)
            .field("local_uuid", &self.local_uuid)
            .field("namespaces", &self.caches.lock().len())
            .finish()
    }
}

impl CacheRegistry {
    /// Build a registry; disk stores named by `config` are opened immediately.
    pub fn new(config: CacheConfig, local_uuid: Uuid) -> XCodecResult<Self> {
        config.validate()?;
        if local_uuid.is_nil() {
            return Err(XCodecError::invalid_config("local UUID must not be nil"));
        }
        let registry = Self {
            config,
            local_uuid,
            stores: Mutex::new(HashMap::new()),
            caches: Mutex::new(HashMap::new()),
        };
        registry.local()?;
        info!(local_uuid = %local_uuid, "cache registry ready");
        Ok(registry)
    }

    /// Identity of this end of every connection
    pub fn local_uuid(&self) -> Uuid {
        self.local_uuid
    }

    /// Cache configuration in use
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The local namespace, used by encoders.
    pub fn local(&self) -> XCodecResult<SharedCache> {
        self.connect(self.local_uuid)
    }

    /// The namespace for `uuid`, created on first use.
    pub fn connect(&self, uuid: Uuid) -> XCodecResult<SharedCache> {
        if let Some(cache) = self.caches.lock().get(&uuid) {
            return Ok(cache.clone());
        }
        let config = self.config.clone();
        let cache = self.build(&config, uuid)?;
        let mut caches = self.caches.lock();
        let cache = caches.entry(uuid).or_insert(cache).clone();
        debug!(uuid = %uuid, out_of_band = cache.out_of_band(), "connected cache namespace");
        Ok(cache)
    }

    /// The single store backing `path`, opened on first use.
    pub fn disk_store(&self, path: &Path, size_bytes: u64) -> XCodecResult<Arc<DiskStore>> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(path) {
            return Ok(store.clone());
        }
        let store = DiskStore::open(path, size_bytes, self.local_uuid)?;
        stores.insert(path.to_path_buf(), store.clone());
        Ok(store)
    }

    /// Drop the registry's handle on a peer namespace once a connection ends.
    ///
    /// Only disk-backed namespaces are released: their segments stay on disk
    /// and an idle, empty namespace becomes collectable by its store. A memory
    /// namespace is the only copy of what the peer taught us, so it is kept.
    /// Connections still holding the cache keep it open until they drop it.
    pub fn release(&self, uuid: Uuid) -> bool {
        if uuid == self.local_uuid || !self.config.out_of_band() {
            return false;
        }
        let released = self.caches.lock().remove(&uuid).is_some();
        if released {
            debug!(uuid = %uuid, "released cache namespace");
        }
        released
    }

    fn build(&self, config: &CacheConfig, uuid: Uuid) -> XCodecResult<SharedCache> {
        let cache: SharedCache = match config {
            CacheConfig::Memory { max_entries } => Arc::new(MemoryCache::new(*max_entries)),
            CacheConfig::Disk { path, size_bytes } => {
                let store = self.disk_store(path, *size_bytes)?;
                Arc::new(store.connect(uuid)?)
            }
            CacheConfig::Pair { primary, secondary } => {
                let primary = self.build(primary, uuid)?;
                let secondary = self.build(secondary, uuid)?;
                Arc::new(CachePair::new(primary, secondary)?)
            }
        };
        Ok(cache)
    }
}
