use serde::{Deserialize, Serialize};

use ks_domain::config::{CacheConfig, LockConfig, RateLimiterConfig};

/// Top-level configuration for a [`crate::Keystone`] instance.
///
/// `rate_limiters` is a map rather than a single struct since, unlike
/// the cache and lock engines, a process typically wants several
/// independently configured limiters (e.g. one per route).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub rate_limiters: std::collections::HashMap<String, RateLimiterConfig>,
    #[serde(default)]
    pub namespace: NamespaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default = "default_root")]
    pub root: Vec<String>,
    #[serde(default = "default_root_id")]
    pub root_id: String,
}

fn default_root() -> Vec<String> {
    vec!["keystone".to_owned()]
}

fn default_root_id() -> String {
    "default".to_owned()
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            root_id: default_root_id(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            lock: LockConfig::default(),
            rate_limiters: std::collections::HashMap::new(),
            namespace: NamespaceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> ks_domain::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| ks_domain::Error::Config(err.to_string()))?;
        toml::from_str(&content).map_err(|err| ks_domain::Error::Config(err.to_string()))
    }

    /// Load from file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_default()
    }
}
