//! Coordinator-wide and per-store configuration.

use std::time::Duration;

use btx_core::limits::{clamp_max_duration, DEFAULT_MAX_DURATION};

/// Settings that apply to every transaction the coordinator opens.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Default `maxDuration` applied when a caller doesn't specify one,
    /// already clamped to `[default=15m, max=1h]`.
    pub default_max_duration: Duration,
    /// TTL used for the `DTrollbk` process-coordination lock in the
    /// sector-timeout handler.
    pub sector_timeout_lock_ttl: Duration,
}

impl CoordinatorConfig {
    pub fn new(default_max_duration: Option<Duration>) -> Self {
        Self {
            default_max_duration: clamp_max_duration(default_max_duration),
            sector_timeout_lock_ttl: Duration::from_secs(30),
        }
    }

    pub fn resolve_max_duration(&self, requested: Option<Duration>) -> Duration {
        if requested.is_some() {
            clamp_max_duration(requested)
        } else {
            self.default_max_duration
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::new(Some(DEFAULT_MAX_DURATION))
    }
}

/// Per-store cache and persistence policy, mirroring the flags on
/// `StoreInfo` but exposed as a builder surface for `new_store`.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub slot_length: usize,
    pub value_in_node_segment: bool,
    pub value_actively_persisted: bool,
    pub value_globally_cached: bool,
    pub value_cache_ttl: Option<Duration>,
}

impl StoreOptions {
    pub fn new(slot_length: usize) -> Self {
        Self {
            slot_length,
            value_in_node_segment: true,
            value_actively_persisted: false,
            value_globally_cached: false,
            value_cache_ttl: None,
        }
    }

    pub fn with_externalized_values(mut self) -> Self {
        self.value_in_node_segment = false;
        self
    }

    pub fn with_active_persistence(mut self) -> Self {
        self.value_actively_persisted = true;
        self
    }

    pub fn with_global_cache(mut self, ttl: Option<Duration>) -> Self {
        self.value_globally_cached = true;
        self.value_cache_ttl = ttl;
        self
    }
}
