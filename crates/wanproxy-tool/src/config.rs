//! Tool configuration file

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;
use wanproxy_transport::PipePairConfig;
use wanproxy_xcodec::{CacheConfig, CacheRegistry};

/// Settings shared by every `xcodec-tool` subcommand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Identity of this end; a fresh one is generated per run when unset
    pub local_uuid: Option<Uuid>,
    /// Cache backend
    pub cache: CacheConfig,
    /// Pipe pair tunables
    pub pipe: PipePairConfig,
}

impl ToolConfig {
    /// Load a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ToolConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the cache and pipe sections.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.cache.validate()?;
        self.pipe.validate()?;
        Ok(())
    }

    /// The configured UUID, or a random one.
    ///
    /// A random identity means anything this run stores under its own
    /// namespace cannot be addressed by later runs.
    pub fn resolve_uuid(&self) -> Uuid {
        match self.local_uuid {
            Some(uuid) => uuid,
            None => {
                let uuid = Uuid::new_v4();
                tracing::warn!(uuid = %uuid, "no local_uuid configured, using a temporary identity");
                uuid
            }
        }
    }

    /// Build the cache registry for this configuration.
    pub fn registry(&self) -> anyhow::Result<Arc<CacheRegistry>> {
        let registry = CacheRegistry::new(self.cache.clone(), self.resolve_uuid())?;
        Ok(Arc::new(registry))
    }
}
