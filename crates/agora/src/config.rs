//! # Node Configuration
//!
//! Tunables for one node, loadable from TOML. Every field has a documented
//! default so an empty config is valid.

use crate::queue::ServingPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default grace period during which a migrated-away address forwards
/// straggling requests to the new location: 30 seconds.
pub const DEFAULT_FORWARDING_GRACE_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// How long, in milliseconds, the forwarding shim at a migrated body's
    /// old address keeps redirecting stale-location requests. After expiry
    /// such requests fail with a target-terminated error.
    pub forwarding_grace_ms: u64,

    /// Ordering policy applied to bodies created without an explicit one.
    pub default_policy: ServingPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            forwarding_grace_ms: DEFAULT_FORWARDING_GRACE_MS,
            default_policy: ServingPolicy::Fifo,
        }
    }
}

impl NodeConfig {
    pub fn forwarding_grace(&self) -> Duration {
        Duration::from_millis(self.forwarding_grace_ms)
    }

    /// Load a config from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading node config from {}", path.display()))?;
        Self::from_toml(&raw)
    }

    /// Parse a config from a TOML string.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parsing node config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_config_uses_defaults() {
        let config = NodeConfig::from_toml("").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.forwarding_grace(), Duration::from_secs(30));
    }

    #[test]
    fn overrides_parse() {
        let config = NodeConfig::from_toml(
            r#"
            forwarding_grace_ms = 1500
            default_policy = "newest-first"
            "#,
        )
        .unwrap();
        assert_eq!(config.forwarding_grace_ms, 1500);
        assert_eq!(config.default_policy, ServingPolicy::NewestFirst);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(NodeConfig::from_toml("grace = 10").is_err());
    }
}
