//! Persistent, crash-consistent, content-addressable dictionary.
//!
//! A [`DiskStore`] owns one cache file (see [`crate::layout`]) and serves
//! every namespace stored in it. [`DiskStore::connect`] hands out a
//! namespaced [`DiskCache`] implementing [`XCodecCache`].
//!
//! Writes are a circular log of groups. Data blocks are written as soon as a
//! segment is entered; the group's index block is written once all of its
//! slots are used, stamped with the next counter value. On open the groups
//! are replayed oldest counter first, with the groups at both ends of that
//! order re-hashed to catch torn writes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::block_device::{BlockDevice, FileBlockDevice};
use crate::cache::{CacheStats, XCodecCache};
use crate::error::{XCodecError, XCodecResult};
use crate::hash::segment_hash;
use crate::layout::{
    decode_registry_block, encode_registry_block, slot_to_xuid, xuid_to_slot, BlockLayout,
    CacheHeader, IndexBlock, IndexEntry, Xuid, BLOCK_SIZE, CHECK_BOUNDARY, ENTRIES_PER_INDEX,
    MAX_NAMESPACES, REGISTRY_BLOCKS, REGISTRY_SLOTS_PER_BLOCK,
};
use crate::segment::Segment;

/// Where a segment lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockLocation {
    group: u64,
    slot: usize,
}

/// Counters and geometry of a disk store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskStoreStats {
    /// Groups in the file
    pub groups: u64,
    /// Group currently being filled
    pub head_group: u64,
    /// Slots of the head group already used
    pub head_slot: usize,
    /// Highest index counter written
    pub max_counter: u64,
    /// Live dictionary entries across all namespaces
    pub entries: usize,
    /// Registered namespaces
    pub namespaces: usize,
    /// Blocks read
    pub block_reads: u64,
    /// Blocks written
    pub block_writes: u64,
    /// Mappings dropped because the data no longer matched the hash
    pub stale_discards: u64,
    /// Lookup, insertion and eviction counters
    pub cache: CacheStats,
}

struct DiskInner {
    device: Box<dyn BlockDevice>,
    layout: BlockLayout,
    local_xuid: Xuid,
    namespaces: Vec<Option<Uuid>>,
    by_uuid: HashMap<Uuid, Xuid>,
    /// live entries per namespace
    live: HashMap<Xuid, usize>,
    /// open handles per namespace
    handles: HashMap<Xuid, usize>,
    map: HashMap<(Xuid, u64), BlockLocation>,
    /// in-memory copy of each group's mapped entries
    groups: Vec<IndexBlock>,
    head: u64,
    next_slot: usize,
    max_counter: u64,
    stats: DiskStoreStats,
}

/// One cache file shared by every namespace stored in it.
///
/// Single writer: open each path once and share the `Arc`
/// ([`crate::cache::CacheRegistry`] does this).
pub struct DiskStore {
    local_uuid: Uuid,
    inner: Mutex<DiskInner>,
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("local_uuid", &self.local_uuid)
            .finish_non_exhaustive()
    }
}

impl DiskStore {
    /// Open (formatting if new) the cache file at `path`.
    pub fn open(path: &Path, size_bytes: u64, local_uuid: Uuid) -> XCodecResult<Arc<Self>> {
        let layout = BlockLayout::for_size_bytes(size_bytes)?;
        let device = FileBlockDevice::open(path, layout.total_blocks())?;
        info!(path = %path.display(), size_bytes, "opening disk cache");
        Self::with_device(Box::new(device), local_uuid)
    }

    /// Open a store on an arbitrary block device.
    pub fn with_device(device: Box<dyn BlockDevice>, local_uuid: Uuid) -> XCodecResult<Arc<Self>> {
        if local_uuid.is_nil() {
            return Err(XCodecError::invalid_config("local UUID must not be nil"));
        }
        let mut inner = DiskInner::load(device)?;
        let local_xuid = inner.register(local_uuid)?;
        inner.local_xuid = local_xuid;
        info!(
            groups = inner.layout.group_count(),
            head = inner.head,
            entries = inner.map.len(),
            local_xuid,
            "disk cache loaded"
        );
        Ok(Arc::new(Self {
            local_uuid,
            inner: Mutex::new(inner),
        }))
    }

    /// Identity of the never-collected local namespace
    pub fn local_uuid(&self) -> Uuid {
        self.local_uuid
    }

    /// Namespaced handle for `uuid`, registering the namespace if needed.
    pub fn connect(self: &Arc<Self>, uuid: Uuid) -> XCodecResult<DiskCache> {
        let mut inner = self.inner.lock();
        let xuid = inner.register(uuid)?;
        *inner.handles.entry(xuid).or_insert(0) += 1;
        debug!(uuid = %uuid, xuid, "disk cache namespace connected");
        Ok(DiskCache {
            store: Arc::clone(self),
            xuid,
            uuid,
        })
    }

    /// Persist the partially filled head group.
    pub fn flush(&self) -> XCodecResult<()> {
        let mut inner = self.inner.lock();
        if inner.next_slot > 0 {
            inner.seal_head()?;
        }
        inner.device.sync()?;
        Ok(())
    }

    /// Snapshot of counters and geometry
    pub fn stats(&self) -> DiskStoreStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.groups = inner.layout.group_count();
        stats.head_group = inner.head;
        stats.head_slot = inner.next_slot;
        stats.max_counter = inner.max_counter;
        stats.entries = inner.map.len();
        stats.namespaces = inner.by_uuid.len();
        stats
    }

    /// Registered namespaces and their live entry counts.
    pub fn namespaces(&self) -> Vec<(Uuid, usize)> {
        let inner = self.inner.lock();
        let mut out: Vec<(Uuid, usize)> = inner
            .by_uuid
            .iter()
            .map(|(uuid, xuid)| (*uuid, inner.live.get(xuid).copied().unwrap_or(0)))
            .collect();
        out.sort();
        out
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to flush disk cache on close");
        }
    }
}

impl DiskInner {
    fn load(device: Box<dyn BlockDevice>) -> XCodecResult<Self> {
        let mut block = vec![0u8; BLOCK_SIZE];
        let available = BlockLayout::for_block_count(device.block_count())?;
        device.read_block(0, &mut block)?;
        let layout = match CacheHeader::from_block(&block)? {
            None => {
                info!(groups = available.group_count(), "formatting empty disk cache");
                device.write_block(available.header_block(), &CacheHeader::new(&available).to_block())?;
                available
            }
            Some(header) => {
                if header.group_count > available.group_count() {
                    return Err(XCodecError::CorruptCacheFile {
                        reason: format!(
                            "header claims {} groups, file holds {}",
                            header.group_count,
                            available.group_count()
                        ),
                    });
                }
                BlockLayout::new(header.group_count)?
            }
        };

        let mut namespaces = Vec::with_capacity(MAX_NAMESPACES);
        for n in 0..REGISTRY_BLOCKS {
            device.read_block(layout.registry_block(n), &mut block)?;
            namespaces.extend(decode_registry_block(&block));
        }
        let by_uuid = namespaces
            .iter()
            .enumerate()
            .filter_map(|(slot, uuid)| uuid.map(|u| (u, slot_to_xuid(slot))))
            .collect();

        let mut groups = Vec::with_capacity(layout.group_count() as usize);
        for g in 0..layout.group_count() {
            device.read_block(layout.index_block(g), &mut block)?;
            groups.push(IndexBlock::from_block(&block));
        }

        let mut inner = Self {
            device,
            layout,
            local_xuid: 0,
            namespaces,
            by_uuid,
            live: HashMap::new(),
            handles: HashMap::new(),
            map: HashMap::new(),
            groups,
            head: 0,
            next_slot: 0,
            max_counter: 0,
            stats: DiskStoreStats::default(),
        };
        inner.replay()?;
        Ok(inner)
    }

    /// Pick the write head and rebuild the dictionary from the index blocks.
    fn replay(&mut self) -> XCodecResult<()> {
        self.max_counter = self.groups.iter().map(|g| g.counter).max().unwrap_or(0);
        self.head = match self.groups.iter().position(IndexBlock::is_free) {
            Some(free) => free as u64,
            None => self
                .groups
                .iter()
                .enumerate()
                .min_by_key(|(_, g)| g.counter)
                .map(|(i, _)| i as u64)
                .unwrap_or(0),
        };

        let mut order: Vec<u64> = (0..self.layout.group_count())
            .filter(|&g| g != self.head && !self.groups[g as usize].is_free())
            .collect();
        order.sort_by_key(|&g| self.groups[g as usize].counter);

        let mut replayed = vec![false; self.groups.len()];
        for (pos, &group) in order.iter().enumerate() {
            let at_boundary = pos < CHECK_BOUNDARY || pos + CHECK_BOUNDARY >= order.len();
            if at_boundary && !self.verify_group(group)? {
                warn!(
                    group,
                    counter = self.groups[group as usize].counter,
                    "torn group found while loading; resetting write head"
                );
                self.head = group;
                break;
            }
            self.apply_group(group);
            replayed[group as usize] = true;
        }
        for (group, index) in self.groups.iter_mut().enumerate() {
            if !replayed[group] {
                index.clear_entries();
            }
        }
        self.next_slot = 0;
        Ok(())
    }

    fn verify_group(&mut self, group: u64) -> XCodecResult<bool> {
        let mut block = vec![0u8; BLOCK_SIZE];
        for slot in 0..ENTRIES_PER_INDEX {
            let entry = self.groups[group as usize].entries[slot];
            if entry.is_empty() {
                continue;
            }
            self.read(self.layout.data_block(group, slot), &mut block)?;
            if segment_hash(&block) != entry.hash {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn apply_group(&mut self, group: u64) {
        for slot in 0..ENTRIES_PER_INDEX {
            let entry = self.groups[group as usize].entries[slot];
            if entry.is_empty() {
                continue;
            }
            let registered = xuid_to_slot(entry.xuid)
                .and_then(|s| self.namespaces.get(s).copied().flatten())
                .is_some();
            if !registered {
                self.groups[group as usize].entries[slot] = IndexEntry::default();
                continue;
            }
            let location = BlockLocation { group, slot };
            if self.map.insert((entry.xuid, entry.hash), location).is_none() {
                *self.live.entry(entry.xuid).or_insert(0) += 1;
            }
        }
    }

    fn read(&mut self, index: u64, buf: &mut [u8]) -> XCodecResult<()> {
        self.device.read_block(index, buf)?;
        self.stats.block_reads += 1;
        Ok(())
    }

    fn write(&mut self, index: u64, buf: &[u8]) -> XCodecResult<()> {
        self.device.write_block(index, buf)?;
        self.stats.block_writes += 1;
        Ok(())
    }

    fn register(&mut self, uuid: Uuid) -> XCodecResult<Xuid> {
        if uuid.is_nil() {
            return Err(XCodecError::invalid_config("namespace UUID must not be nil"));
        }
        if let Some(&xuid) = self.by_uuid.get(&uuid) {
            return Ok(xuid);
        }
        let slot = match self.free_namespace_slot() {
            Some(slot) => slot,
            None => {
                self.collect_namespaces()?;
                self.free_namespace_slot()
                    .ok_or(XCodecError::NamespaceExhausted { uuid })?
            }
        };
        self.namespaces[slot] = Some(uuid);
        self.write_registry(slot)?;
        let xuid = slot_to_xuid(slot);
        self.by_uuid.insert(uuid, xuid);
        info!(uuid = %uuid, xuid, "registered disk cache namespace");
        Ok(xuid)
    }

    fn free_namespace_slot(&self) -> Option<usize> {
        self.namespaces.iter().position(Option::is_none)
    }

    /// Free every namespace that holds no entries and has no open handle.
    fn collect_namespaces(&mut self) -> XCodecResult<()> {
        let mut freed = 0usize;
        for slot in 0..self.namespaces.len() {
            let Some(uuid) = self.namespaces[slot] else {
                continue;
            };
            let xuid = slot_to_xuid(slot);
            let empty = self.live.get(&xuid).copied().unwrap_or(0) == 0;
            let idle = self.handles.get(&xuid).copied().unwrap_or(0) == 0;
            if xuid == self.local_xuid || !empty || !idle {
                continue;
            }
            self.namespaces[slot] = None;
            self.by_uuid.remove(&uuid);
            self.live.remove(&xuid);
            self.write_registry(slot)?;
            freed += 1;
        }
        warn!(freed, "garbage collected empty disk cache namespaces");
        Ok(())
    }

    fn write_registry(&mut self, slot: usize) -> XCodecResult<()> {
        let (block, _) = self.layout.registry_position(slot);
        let first = slot - slot % REGISTRY_SLOTS_PER_BLOCK;
        let encoded =
            encode_registry_block(&self.namespaces[first..first + REGISTRY_SLOTS_PER_BLOCK]);
        self.write(block, &encoded)
    }

    fn read_segment(&mut self, location: BlockLocation) -> XCodecResult<Vec<u8>> {
        let mut block = vec![0u8; BLOCK_SIZE];
        self.read(self.layout.data_block(location.group, location.slot), &mut block)?;
        Ok(block)
    }

    fn forget(&mut self, key: (Xuid, u64)) {
        if self.map.remove(&key).is_some() {
            if let Some(count) = self.live.get_mut(&key.0) {
                *count = count.saturating_sub(1);
            }
        }
    }

    fn lookup(&mut self, xuid: Xuid, hash: u64) -> XCodecResult<Option<Segment>> {
        let Some(location) = self.map.get(&(xuid, hash)).copied() else {
            self.stats.cache.misses += 1;
            return Ok(None);
        };
        let block = self.read_segment(location)?;
        if segment_hash(&block) != hash {
            warn!(
                xuid,
                hash = format_args!("{:#018x}", hash),
                group = location.group,
                slot = location.slot,
                "disk cache block no longer matches its index entry"
            );
            self.forget((xuid, hash));
            self.stats.stale_discards += 1;
            self.stats.cache.misses += 1;
            return Ok(None);
        }
        self.stats.cache.hits += 1;
        Ok(Some(Segment::new(Bytes::from(block))?))
    }

    fn enter(&mut self, xuid: Xuid, hash: u64, segment: &Segment) -> XCodecResult<()> {
        if let Some(location) = self.map.get(&(xuid, hash)).copied() {
            if self.read_segment(location)? == segment.as_bytes() {
                return Ok(());
            }
            info!(
                xuid,
                hash = format_args!("{:#018x}", hash),
                "replacing disk cache entry with different content"
            );
        }
        self.append(xuid, hash, segment)
    }

    fn touch(&mut self, xuid: Xuid, hash: u64, segment: &Segment) -> XCodecResult<()> {
        match self.map.get(&(xuid, hash)).copied() {
            None => self.append(xuid, hash, segment),
            Some(location) if location.group == self.layout.next_group(self.head) => {
                trace!(xuid, group = location.group, "rewriting hot entry ahead of recycling");
                self.append(xuid, hash, segment)
            }
            Some(_) => Ok(()),
        }
    }

    fn append(&mut self, xuid: Xuid, hash: u64, segment: &Segment) -> XCodecResult<()> {
        let location = BlockLocation {
            group: self.head,
            slot: self.next_slot,
        };
        self.write(
            self.layout.data_block(location.group, location.slot),
            segment.as_bytes(),
        )?;
        self.groups[location.group as usize].entries[location.slot] = IndexEntry { xuid, hash };
        if self.map.insert((xuid, hash), location).is_none() {
            *self.live.entry(xuid).or_insert(0) += 1;
            self.stats.cache.insertions += 1;
        }
        self.next_slot += 1;
        if self.next_slot == ENTRIES_PER_INDEX {
            self.seal_head()?;
        }
        Ok(())
    }

    /// Write the head's index block and move the head to the next group,
    /// invalidating whatever that group held.
    fn seal_head(&mut self) -> XCodecResult<()> {
        self.max_counter += 1;
        let head = self.head;
        self.groups[head as usize].counter = self.max_counter;
        let encoded = self.groups[head as usize].to_block();
        self.write(self.layout.index_block(head), &encoded)?;
        debug!(group = head, counter = self.max_counter, used = self.next_slot, "sealed disk cache group");

        self.head = self.layout.next_group(head);
        self.next_slot = 0;
        self.recycle(self.head);
        Ok(())
    }

    fn recycle(&mut self, group: u64) {
        let entries = std::mem::take(&mut self.groups[group as usize].entries);
        let mut evicted = 0u64;
        for (slot, entry) in entries.iter().enumerate() {
            if entry.is_empty() {
                continue;
            }
            let key = (entry.xuid, entry.hash);
            if self.map.get(&key) == Some(&BlockLocation { group, slot }) {
                self.forget(key);
                evicted += 1;
            }
        }
        self.groups[group as usize].entries = vec![IndexEntry::default(); ENTRIES_PER_INDEX];
        self.stats.cache.evictions += evicted;
        if evicted > 0 {
            trace!(group, evicted, "recycled disk cache group");
        }
    }
}

/// One namespace of a [`DiskStore`].
pub struct DiskCache {
    store: Arc<DiskStore>,
    xuid: Xuid,
    uuid: Uuid,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("uuid", &self.uuid)
            .field("xuid", &self.xuid)
            .finish()
    }
}

impl DiskCache {
    /// Peer identity of this namespace
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// On-disk handle of this namespace
    pub fn xuid(&self) -> Xuid {
        self.xuid
    }

    /// The shared store
    pub fn store(&self) -> &Arc<DiskStore> {
        &self.store
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        let mut inner = self.store.inner.lock();
        if let Some(count) = inner.handles.get_mut(&self.xuid) {
            *count = count.saturating_sub(1);
        }
    }
}

impl XCodecCache for DiskCache {
    fn enter(&self, hash: u64, segment: Segment) -> XCodecResult<()> {
        self.store.inner.lock().enter(self.xuid, hash, &segment)
    }

    fn lookup(&self, hash: u64) -> XCodecResult<Option<Segment>> {
        self.store.inner.lock().lookup(self.xuid, hash)
    }

    fn touch(&self, hash: u64, segment: &Segment) -> XCodecResult<()> {
        self.store.inner.lock().touch(self.xuid, hash, segment)
    }

    fn out_of_band(&self) -> bool {
        true
    }

    fn stats(&self) -> CacheStats {
        self.store.inner.lock().stats.cache.clone()
    }
}
