//! Configuration File
//!
//! YAML document combining the cache geometry and the workload parameters.
//! Every section and field is optional:
//!
//! ```yaml
//! cache:
//!   shard_count: 13
//!   buffer_count: 30
//!   block_size: 1024
//! workload:
//!   threads: 4
//!   hot_ratio: 0.5
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::CacheConfig;
use crate::error::Result;
use crate::workload::WorkloadConfig;

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheConfig,
    pub workload: WorkloadConfig,
}

impl Settings {
    /// Parse and validate a YAML document
    pub fn from_yaml(text: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        debug!("Loaded settings from {}", path.display());
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.workload.validate()
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;

    #[test]
    fn test_empty_document_is_default() {
        let settings = Settings::from_yaml("{}").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_partial_sections() {
        let settings = Settings::from_yaml(
            "cache:\n  buffer_count: 64\nworkload:\n  threads: 2\n  write_ratio: 0.25\n",
        )
        .unwrap();
        assert_eq!(settings.cache.buffer_count, 64);
        assert_eq!(settings.cache.shard_count, 13);
        assert_eq!(settings.workload.threads, 2);
        assert_eq!(settings.workload.write_ratio, 0.25);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert_matches!(
            Settings::from_yaml("cache:\n  shard_count: 0\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            Settings::from_yaml("workload:\n  hot_ratio: 2.0\n"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockcache.yaml");

        let mut settings = Settings::default();
        settings.cache.block_size = 512;
        std::fs::write(&path, settings.to_yaml().unwrap()).unwrap();

        assert_eq!(Settings::load(&path).unwrap(), settings);
        assert_matches!(
            Settings::load(dir.path().join("missing.yaml")),
            Err(Error::Io(_))
        );
    }
}
