//! Tunables for the journal and migration subsystem.
//!
//! Loading these from a file, environment, or CLI flags is the embedding
//! binary's job; this module only owns the in-process defaults and the
//! global snapshot that components read when a [`Config`] isn't threaded
//! through explicitly.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Process-wide tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long `join`/`stop` will wait for flows to quiesce before giving up.
    pub migration_finalization_timeout_ms: u64,
    /// Maximum number of entries retained in a slice's ring buffer.
    pub ring_buffer_max_entries: usize,
    /// Maximum aggregate byte size retained in a slice's ring buffer.
    pub ring_buffer_max_bytes: usize,
    /// How long a paused flow sleeps between checks, and the per-iteration
    /// wait granularity used by `join`/`stop`.
    pub pause_poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            migration_finalization_timeout_ms: 30_000,
            ring_buffer_max_entries: 4096,
            ring_buffer_max_bytes: 16 * 1024 * 1024,
            pause_poll_interval_ms: 100,
        }
    }
}

impl Config {
    pub fn finalization_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_finalization_timeout_ms)
    }

    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }

    /// Parse from TOML, e.g. the embedding binary's config file.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

/// Current global configuration snapshot.
pub fn config() -> Arc<Config> {
    CONFIG.load_full()
}

/// Replace the global configuration snapshot.
pub fn set(config: Config) {
    CONFIG.store(Arc::new(config));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = Config::default();
        let s = toml::to_string(&cfg).unwrap();
        let back = Config::from_toml(&s).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = Config::from_toml("ring_buffer_max_entries = 10").unwrap();
        assert_eq!(cfg.ring_buffer_max_entries, 10);
        assert_eq!(cfg.migration_finalization_timeout_ms, 30_000);
    }

    #[test]
    fn global_snapshot_updates() {
        set(Config {
            ring_buffer_max_entries: 7,
            ..Config::default()
        });
        assert_eq!(config().ring_buffer_max_entries, 7);
        set(Config::default());
    }
}
