//! Configuration
//!
//! YAML-loadable description of a property cache deployment: the backend
//! stack, its tuning knobs and the cohorts to register.
//!
//! ```yaml
//! mutations_per_1000_writes_threshold: 300
//! lru:
//!   max_bytes: 10485760
//! fallback:
//!   threshold_bytes: 1048576
//! cohorts:
//!   - name: dom
//!     tier: primary
//!   - name: beacon
//!     tier: secondary
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::async_cache::DEFAULT_MAX_PARALLEL;
use crate::cache::lru::DEFAULT_LRU_MAX_BYTES;
use crate::cache::{BatcherConfig, WriteThroughConfig};
use crate::error::{Error, Result};
use crate::property::cache::DEFAULT_MUTATIONS_PER_1000_WRITES_THRESHOLD;
use crate::property::store::DEFAULT_KEY_PREFIX;

// =============================================================================
// Sections
// =============================================================================

/// In-process LRU tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LruConfig {
    pub max_bytes: usize,
}

impl Default for LruConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_LRU_MAX_BYTES,
        }
    }
}

/// Small/large split applied to the secondary tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Entries whose key plus value exceed this go to the large cache
    pub threshold_bytes: usize,
}

/// Bound on blocking-backend lookups in flight on the tokio blocking pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncCacheConfig {
    pub max_parallel: usize,
}

impl Default for AsyncCacheConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }
}

/// Which backend a cohort is stored in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CohortTier {
    /// Fast tier, consulted first
    Primary,
    /// Slow tier, consulted for primary misses
    Secondary,
    /// The store's default backend
    #[default]
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortConfig {
    pub name: String,
    #[serde(default)]
    pub tier: CohortTier,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// =============================================================================
// Top-level configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyCacheConfig {
    pub enabled: bool,
    pub mutations_per_1000_writes_threshold: u32,
    pub key_prefix: String,
    pub lru: LruConfig,
    pub fallback: Option<FallbackConfig>,
    pub async_cache: AsyncCacheConfig,
    pub batcher: BatcherConfig,
    pub write_through: Option<WriteThroughConfig>,
    pub cohorts: Vec<CohortConfig>,
    pub log: LogConfig,
}

impl Default for PropertyCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mutations_per_1000_writes_threshold: DEFAULT_MUTATIONS_PER_1000_WRITES_THRESHOLD,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            lru: LruConfig::default(),
            fallback: None,
            async_cache: AsyncCacheConfig::default(),
            batcher: BatcherConfig::default(),
            write_through: None,
            cohorts: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

impl PropertyCacheConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading property cache config");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for cohort in &self.cohorts {
            if cohort.name.is_empty() {
                return Err(Error::Config("cohort name must not be empty".into()));
            }
            if cohort.name.contains('@') {
                return Err(Error::Config(format!(
                    "cohort name {:?} must not contain '@'",
                    cohort.name
                )));
            }
            if !seen.insert(cohort.name.as_str()) {
                return Err(Error::Config(format!("cohort {:?} is listed twice", cohort.name)));
            }
        }
        if self.lru.max_bytes == 0 {
            return Err(Error::Config("lru.max_bytes must be > 0".into()));
        }
        if let Some(fallback) = &self.fallback {
            if fallback.threshold_bytes == 0 {
                return Err(Error::Config("fallback.threshold_bytes must be > 0".into()));
            }
        }
        if self.async_cache.max_parallel == 0 {
            return Err(Error::Config("async_cache.max_parallel must be > 0".into()));
        }
        if self.batcher.max_parallel_lookups == 0 {
            return Err(Error::Config("batcher.max_parallel_lookups must be > 0".into()));
        }
        if self.batcher.max_batch_size == 0 {
            return Err(Error::Config("batcher.max_batch_size must be > 0".into()));
        }
        if self.write_through.as_ref().and_then(|w| w.cache1_size_limit) == Some(0) {
            return Err(Error::Config("write_through.cache1_size_limit must be > 0".into()));
        }
        Ok(())
    }

    /// Whether any cohort lives in the secondary tier
    pub fn has_secondary_cohorts(&self) -> bool {
        self.cohorts.iter().any(|c| c.tier == CohortTier::Secondary)
    }

    pub fn cohorts_in(&self, tier: CohortTier) -> impl Iterator<Item = &CohortConfig> {
        self.cohorts.iter().filter(move |c| c.tier == tier)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PropertyCacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.mutations_per_1000_writes_threshold, 300);
        assert_eq!(config.key_prefix, "prop_page/");
        assert_eq!(config.lru.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.async_cache.max_parallel, 100);
        assert_eq!(config.batcher.max_queue_size, 1000);
        assert!(config.fallback.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
mutations_per_1000_writes_threshold: 250
lru:
  max_bytes: 4096
fallback:
  threshold_bytes: 512
batcher:
  max_queue_size: 10
write_through:
  cache1_size_limit: 1024
cohorts:
  - name: dom
    tier: primary
  - name: beacon
    tier: secondary
  - name: misc
"#;
        let config = PropertyCacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.mutations_per_1000_writes_threshold, 250);
        assert_eq!(config.lru.max_bytes, 4096);
        assert_eq!(config.fallback, Some(FallbackConfig { threshold_bytes: 512 }));
        assert_eq!(config.batcher.max_queue_size, 10);
        assert_eq!(config.batcher.max_batch_size, 1000);
        assert_eq!(config.write_through.as_ref().unwrap().cache1_size_limit, Some(1024));
        assert_eq!(config.cohorts[2].tier, CohortTier::Default);
        assert!(config.has_secondary_cohorts());
        let primary: Vec<_> = config.cohorts_in(CohortTier::Primary).map(|c| c.name.as_str()).collect();
        assert_eq!(primary, vec!["dom"]);
    }

    #[test]
    fn test_validate_rejects_bad_cohorts() {
        for yaml in [
            "cohorts: [{name: ''}]",
            "cohorts: [{name: 'a@b'}]",
            "cohorts: [{name: dom}, {name: dom, tier: secondary}]",
        ] {
            assert_matches!(PropertyCacheConfig::from_yaml_str(yaml), Err(Error::Config(_)), "{}", yaml);
        }
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        for yaml in [
            "lru: {max_bytes: 0}",
            "fallback: {threshold_bytes: 0}",
            "async_cache: {max_parallel: 0}",
            "batcher: {max_parallel_lookups: 0}",
            "write_through: {cache1_size_limit: 0}",
        ] {
            assert_matches!(PropertyCacheConfig::from_yaml_str(yaml), Err(Error::Config(_)), "{}", yaml);
        }
    }

    #[test]
    fn test_malformed_yaml() {
        assert_matches!(PropertyCacheConfig::from_yaml_str("lru: ["), Err(Error::Yaml(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "enabled: false\nkey_prefix: pp/\ncohorts: [{{name: dom}}]").unwrap();
        let config = PropertyCacheConfig::from_file(file.path()).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.key_prefix, "pp/");
        assert_eq!(config.cohorts.len(), 1);

        assert_matches!(
            PropertyCacheConfig::from_file("/nonexistent/pcache.yaml"),
            Err(Error::Io(_))
        );
    }
}
