//! Configuration management for Authlimit.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{AuthLimitError, Result};
use crate::ratelimit::{AuthAction, LimitLayer, PolicyConfig, PolicyRegistry};

/// Main configuration for the rate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// General settings (sweep cadence, store bound, bypass list)
    #[serde(default)]
    pub general: LimiterSettings,

    /// Per-action, per-layer policy overrides, applied on top of the
    /// built-in defaults
    #[serde(default)]
    pub policies: HashMap<AuthAction, HashMap<LimitLayer, PolicyConfig>>,
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Minimum interval between amortized store sweeps, in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Maximum number of counter entries kept in the store
    #[serde(default = "default_max_store_size")]
    pub max_store_size: usize,

    /// Client IPs that are never rate limited
    #[serde(default)]
    pub bypass: Vec<String>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_store_size: default_max_store_size(),
            bypass: Vec::new(),
        }
    }
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_max_store_size() -> usize {
    10_000
}

impl LimiterSettings {
    /// The sweep gate interval as a duration.
    pub fn cleanup_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cleanup_interval_secs as i64)
    }

    /// Whether the given client IP is on the bypass list.
    pub fn is_bypassed(&self, ip: &str) -> bool {
        self.bypass.iter().any(|b| b == ip)
    }
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AuthLimitError::Config(format!("Failed to parse rate limit config: {}", e)))
    }

    /// Build the policy registry: built-in defaults with any configured
    /// overrides applied per (action, layer) pair.
    pub fn registry(&self) -> PolicyRegistry {
        let mut registry = PolicyRegistry::with_defaults();
        for (action, layers) in &self.policies {
            for (layer, policy) in layers {
                registry.insert(*action, *layer, policy.clone().into());
            }
        }
        registry
    }
}
