//! On-disk block layout of the persistent dictionary.
//!
//! Layout (block size = [`SEGMENT_LENGTH`]):
//! - Block 0: header (magic, version, group count)
//! - Blocks 1..=8: namespace registry, 128 UUID slots per block
//! - Blocks 9..: groups of one index block followed by 127 data blocks
//!
//! Every offset calculation for the format lives in [`BlockLayout`].

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::error::{XCodecError, XCodecResult};
use crate::segment::SEGMENT_LENGTH;

/// Size of every block in the cache file
pub const BLOCK_SIZE: usize = SEGMENT_LENGTH;
/// Header magic: "XCDF" = 0x58434446
pub const CACHE_MAGIC: u32 = 0x5843_4446;
/// Current format version
pub const CACHE_VERSION: u32 = 1;
/// Blocks reserved for the namespace registry
pub const REGISTRY_BLOCKS: u64 = 8;
/// Registry slots held by one registry block
pub const REGISTRY_SLOTS_PER_BLOCK: usize = BLOCK_SIZE / 16;
/// Maximum number of namespaces a cache file can hold
pub const MAX_NAMESPACES: usize = REGISTRY_BLOCKS as usize * REGISTRY_SLOTS_PER_BLOCK;
/// `(xuid, hash)` slots per index block, one per following data block
pub const ENTRIES_PER_INDEX: usize = (BLOCK_SIZE - 8) / 16;
/// Blocks per group: one index block plus its data blocks
pub const GROUP_BLOCKS: u64 = 1 + ENTRIES_PER_INDEX as u64;
/// First block of group 0
pub const FIRST_GROUP_BLOCK: u64 = 1 + REGISTRY_BLOCKS;
/// Smallest usable cache: the write head plus one replayable group
pub const MIN_GROUPS: u64 = 2;
/// Groups re-verified at each end of the replay order when loading
pub const CHECK_BOUNDARY: usize = 80;

/// Geometry of one cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    group_count: u64,
}

impl BlockLayout {
    /// Layout with exactly `group_count` groups.
    pub fn new(group_count: u64) -> XCodecResult<Self> {
        if group_count < MIN_GROUPS {
            return Err(XCodecError::invalid_config(format!(
                "cache needs at least {} groups, got {}",
                MIN_GROUPS, group_count
            )));
        }
        Ok(Self { group_count })
    }

    /// Largest layout that fits in `block_count` blocks.
    pub fn for_block_count(block_count: u64) -> XCodecResult<Self> {
        let groups = block_count.saturating_sub(FIRST_GROUP_BLOCK) / GROUP_BLOCKS;
        Self::new(groups)
    }

    /// Largest layout that fits in `size_bytes` bytes.
    pub fn for_size_bytes(size_bytes: u64) -> XCodecResult<Self> {
        Self::for_block_count(size_bytes / BLOCK_SIZE as u64)
    }

    /// Number of groups
    pub fn group_count(&self) -> u64 {
        self.group_count
    }

    /// Number of blocks the layout occupies
    pub fn total_blocks(&self) -> u64 {
        FIRST_GROUP_BLOCK + self.group_count * GROUP_BLOCKS
    }

    /// Number of bytes the layout occupies
    pub fn size_bytes(&self) -> u64 {
        self.total_blocks() * BLOCK_SIZE as u64
    }

    /// Number of data blocks, i.e. segment capacity
    pub fn capacity(&self) -> u64 {
        self.group_count * ENTRIES_PER_INDEX as u64
    }

    /// Block holding the header
    pub fn header_block(&self) -> u64 {
        0
    }

    /// Registry block holding namespace slot `slot`, and the byte offset in it.
    pub fn registry_position(&self, slot: usize) -> (u64, usize) {
        let block = 1 + (slot / REGISTRY_SLOTS_PER_BLOCK) as u64;
        (block, (slot % REGISTRY_SLOTS_PER_BLOCK) * 16)
    }

    /// Registry block number `n` (0-based within the registry)
    pub fn registry_block(&self, n: u64) -> u64 {
        1 + n
    }

    /// Index block of `group`
    pub fn index_block(&self, group: u64) -> u64 {
        FIRST_GROUP_BLOCK + group * GROUP_BLOCKS
    }

    /// Data block for `slot` of `group`
    pub fn data_block(&self, group: u64, slot: usize) -> u64 {
        self.index_block(group) + 1 + slot as u64
    }

    /// Group following `group` in write order
    pub fn next_group(&self, group: u64) -> u64 {
        (group + 1) % self.group_count
    }
}

/// Namespace handle stored in index entries; 0 marks an unused slot.
pub type Xuid = u64;

/// Convert a registry slot to its XUID.
pub fn slot_to_xuid(slot: usize) -> Xuid {
    slot as Xuid + 1
}

/// Convert an XUID back to its registry slot.
pub fn xuid_to_slot(xuid: Xuid) -> Option<usize> {
    match xuid {
        0 => None,
        x if x as usize <= MAX_NAMESPACES => Some(x as usize - 1),
        _ => None,
    }
}

/// Contents of block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHeader {
    /// Must equal [`CACHE_MAGIC`]
    pub magic: u32,
    /// Must equal [`CACHE_VERSION`]
    pub version: u32,
    /// Number of groups the file was formatted with
    pub group_count: u64,
}

impl CacheHeader {
    /// Header for a freshly formatted file
    pub fn new(layout: &BlockLayout) -> Self {
        Self {
            magic: CACHE_MAGIC,
            version: CACHE_VERSION,
            group_count: layout.group_count(),
        }
    }

    /// Serialize into one block
    pub fn to_block(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        buf.put_u32(self.magic);
        buf.put_u32(self.version);
        buf.put_u64(self.group_count);
        buf.resize(BLOCK_SIZE, 0);
        buf
    }

    /// Parse block 0. `None` means the block was never written.
    pub fn from_block(mut block: &[u8]) -> XCodecResult<Option<Self>> {
        if block.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let magic = block.get_u32();
        let version = block.get_u32();
        let group_count = block.get_u64();
        if magic != CACHE_MAGIC {
            return Err(XCodecError::CorruptCacheFile {
                reason: format!("invalid magic: expected {:#x}, got {:#x}", CACHE_MAGIC, magic),
            });
        }
        if version != CACHE_VERSION {
            return Err(XCodecError::CorruptCacheFile {
                reason: format!(
                    "unsupported version: expected {}, got {}",
                    CACHE_VERSION, version
                ),
            });
        }
        Ok(Some(Self {
            magic,
            version,
            group_count,
        }))
    }
}

/// One `(xuid, hash)` slot of an index block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexEntry {
    /// Owning namespace, 0 if the slot is unused
    pub xuid: Xuid,
    /// Content hash of the data block
    pub hash: u64,
}

impl IndexEntry {
    /// True if the slot names no data
    pub fn is_empty(&self) -> bool {
        self.xuid == 0
    }
}

/// An index block: write counter plus one entry per data block in the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    /// Monotonic write counter; 0 if the group was never written
    pub counter: u64,
    /// Exactly [`ENTRIES_PER_INDEX`] entries
    pub entries: Vec<IndexEntry>,
}

impl Default for IndexBlock {
    fn default() -> Self {
        Self {
            counter: 0,
            entries: vec![IndexEntry::default(); ENTRIES_PER_INDEX],
        }
    }
}

impl IndexBlock {
    /// True if the group has never been written
    pub fn is_free(&self) -> bool {
        self.counter == 0
    }

    /// Drop every entry, keeping the counter
    pub fn clear_entries(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = IndexEntry::default());
    }

    /// Serialize into one block
    pub fn to_block(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        buf.put_u64(self.counter);
        for entry in &self.entries {
            buf.put_u64(entry.xuid);
            buf.put_u64(entry.hash);
        }
        buf.resize(BLOCK_SIZE, 0);
        buf
    }

    /// Parse one block
    pub fn from_block(mut block: &[u8]) -> Self {
        let counter = block.get_u64();
        let entries = (0..ENTRIES_PER_INDEX)
            .map(|_| IndexEntry {
                xuid: block.get_u64(),
                hash: block.get_u64(),
            })
            .collect();
        Self { counter, entries }
    }
}

/// Parse the UUID slots of one registry block; all-zero slots are free.
pub fn decode_registry_block(block: &[u8]) -> Vec<Option<Uuid>> {
    block
        .chunks_exact(16)
        .take(REGISTRY_SLOTS_PER_BLOCK)
        .map(|raw| {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(raw);
            let uuid = Uuid::from_bytes(bytes);
            (!uuid.is_nil()).then_some(uuid)
        })
        .collect()
}

/// Serialize the UUID slots of one registry block.
pub fn encode_registry_block(slots: &[Option<Uuid>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BLOCK_SIZE);
    for slot in slots.iter().take(REGISTRY_SLOTS_PER_BLOCK) {
        match slot {
            Some(uuid) => buf.put_slice(uuid.as_bytes()),
            None => buf.put_bytes(0, 16),
        }
    }
    buf.resize(BLOCK_SIZE, 0);
    buf
}
