//! Runtime configuration.
//!
//! Modeled on naia's `ServerConfig`/`ConnectionConfig`: a plain, `Clone`
//! struct with a `Default` impl, populated by the embedding program's CLI
//! layer (spec §6) and handed to [`crate::runtime::Runtime::new`]. The core
//! never reads environment variables or argv itself.

use std::path::PathBuf;

use crate::types::Tag;

/// Location-manager routing configuration (spec §4.5, §9 Open Questions:
/// "the hop-limit constant... is configurable but no single canonical
/// value is documented").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationConfig {
    /// Hop count at which a cached route is abandoned in favor of
    /// re-routing through the entity's home rank.
    pub cache_hop_bound: u32,
    /// Hop count at which routing gives up entirely and returns an error
    /// to the original sender.
    pub max_hops: u32,
}

impl Default for LocationConfig {
    fn default() -> Self {
        LocationConfig {
            cache_hop_bound: 2,
            max_hops: 16,
        }
    }
}

/// Event-system progress configuration (spec §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventConfig {
    /// Maximum number of ready-candidate events tested per scheduler tick.
    pub max_tested_per_tick: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        EventConfig {
            max_tested_per_tick: 64,
        }
    }
}

/// Pool allocator configuration (spec §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub small_class_bytes: usize,
    pub medium_class_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            small_class_bytes: 256,
            medium_class_bytes: 4096,
        }
    }
}

/// Top-level runtime configuration, analogous to naia's `ServerConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub location: LocationConfig,
    pub event: EventConfig,
    pub pool: PoolConfig,
    /// First tag available for user code; tags below this are reserved for
    /// internal bookkeeping (spec §6).
    pub user_tag_offset: Tag,
    /// Where to write the per-rank stats file (spec §6), if at all.
    pub stats_path: Option<PathBuf>,
    /// Where to write the per-rank gzip trace (spec §6), if at all.
    pub trace_path: Option<PathBuf>,
    /// Debug verbosity forwarded from the CLI layer; the core only uses
    /// this to decide how chatty its own `log::debug!` calls should be
    /// considered by callers wiring up a logger, it does not configure a
    /// logger itself.
    pub debug_verbosity: u8,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            location: LocationConfig::default(),
            event: EventConfig::default(),
            pool: PoolConfig::default(),
            user_tag_offset: crate::types::DEFAULT_USER_TAG_OFFSET,
            stats_path: None,
            trace_path: None,
            debug_verbosity: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn with_location(mut self, location: LocationConfig) -> Self {
        self.location = location;
        self
    }

    pub fn with_stats_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stats_path = Some(path.into());
        self
    }

    pub fn with_trace_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_path = Some(path.into());
        self
    }
}
