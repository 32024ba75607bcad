//! Cache backend configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{XCodecError, XCodecResult};
use crate::layout::BlockLayout;

/// Default bound of a memory cache: 64Ki segments, 128MB of payload.
pub const DEFAULT_MEMORY_ENTRIES: usize = 65536;

/// Which dictionary backend each namespace uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheConfig {
    /// Private in-memory cache, LRU-bounded when `max_entries` is set
    Memory {
        /// Maximum number of segments; `None` for unbounded
        #[serde(default)]
        max_entries: Option<usize>,
    },
    /// Persistent cache file shared by all namespaces
    Disk {
        /// Path of the cache file
        path: PathBuf,
        /// Size of the cache file in bytes
        size_bytes: u64,
    },
    /// Primary tier in front of a secondary tier
    Pair {
        /// Tier consulted first
        primary: Box<CacheConfig>,
        /// Tier consulted on a primary miss
        secondary: Box<CacheConfig>,
    },
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memory {
            max_entries: Some(DEFAULT_MEMORY_ENTRIES),
        }
    }
}

impl CacheConfig {
    /// Whether caches built from this configuration are out of band.
    pub fn out_of_band(&self) -> bool {
        match self {
            CacheConfig::Memory { .. } => false,
            CacheConfig::Disk { .. } => true,
            CacheConfig::Pair { primary, .. } => primary.out_of_band(),
        }
    }

    /// Check sizes and tier compatibility before anything is opened.
    pub fn validate(&self) -> XCodecResult<()> {
        match self {
            CacheConfig::Memory { .. } => Ok(()),
            CacheConfig::Disk { size_bytes, .. } => BlockLayout::for_size_bytes(*size_bytes)
                .map(|_| ())
                .map_err(|_| XCodecError::invalid_config(format!(
                    "disk cache of {} bytes is too small",
                    size_bytes
                ))),
            CacheConfig::Pair { primary, secondary } => {
                primary.validate()?;
                secondary.validate()?;
                if primary.out_of_band() != secondary.out_of_band() {
                    return Err(XCodecError::invalid_config(
                        "cache pair mixes in-band and out-of-band tiers",
                    ));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_bounded_memory() {
        let config = CacheConfig::default();
        assert_eq!(
            config,
            CacheConfig::Memory {
                max_entries: Some(DEFAULT_MEMORY_ENTRIES)
            }
        );
        assert!(!config.out_of_band());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disk_too_small_rejected() {
        let config = CacheConfig::Disk {
            path: PathBuf::from("/tmp/x.xcd"),
            size_bytes: 4096,
        };
        assert!(matches!(
            config.validate(),
            Err(XCodecError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_mixed_pair_rejected() {
        let config = CacheConfig::Pair {
            primary: Box::new(CacheConfig::default()),
            secondary: Box::new(CacheConfig::Disk {
                path: PathBuf::from("/tmp/x.xcd"),
                size_bytes: 64 << 20,
            }),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_tagged_representation() {
        let json = r#"{"kind":"pair",
            "primary":{"kind":"memory","max_entries":16},
            "secondary":{"kind":"memory"}}"#;
        let config: CacheConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config,
            CacheConfig::Pair {
                primary: Box::new(CacheConfig::Memory {
                    max_entries: Some(16)
                }),
                secondary: Box::new(CacheConfig::Memory { max_entries: None }),
            }
        );
        assert!(config.validate().is_ok());
    }
}
