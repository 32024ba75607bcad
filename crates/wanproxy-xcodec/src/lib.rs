#![warn(missing_docs)]

//! WANProxy XCodec: a deduplicating stream codec over a shared segment dictionary.
//!
//! Encode path: Data → Rolling hash (2048-byte windows) → Dictionary lookup → EXTRACT / REF / BACKREF / literal
//! Decode path: Tagged stream → Dictionary / window lookup → Data (stalls on unknown REF until learned)

pub mod block_device;
pub mod cache;
pub mod cache_pair;
pub mod config;
pub mod decoder;
pub mod disk_cache;
pub mod encoder;
pub mod error;
pub mod hash;
pub mod layout;
pub mod memory_cache;
pub mod reference;
pub mod segment;
pub mod tags;
pub mod window;

pub use block_device::{BlockDevice, FileBlockDevice, MemoryBlockDevice};
pub use cache::{CacheRegistry, CacheStats, SharedCache, XCodecCache};
pub use cache_pair::CachePair;
pub use config::CacheConfig;
pub use decoder::{Decoder, DecoderStats};
pub use disk_cache::{DiskCache, DiskStore, DiskStoreStats};
pub use encoder::{Encoder, EncoderStats};
pub use error::{XCodecError, XCodecResult};
pub use hash::{segment_hash, RollingHash};
pub use layout::BlockLayout;
pub use memory_cache::MemoryCache;
pub use reference::ReferenceFrame;
pub use segment::{Segment, SEGMENT_LENGTH};
pub use window::Window;
