//! # Hive Configuration Module
//!
//! This module centralizes all configuration for the hive engine. Constants
//! are grouped by their functional area and interdependencies are documented
//! and enforced through compile-time assertions; the runtime-selectable knobs
//! live in [`HiveConfig`].
//!
//! ## Why Centralization?
//!
//! Scattered constants across multiple files led to bugs where interdependent
//! values became mismatched (the view size, block size and big-data chunk
//! size all constrain each other). By co-locating these constants and adding
//! compile-time checks, we prevent such issues.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;

/// Runtime-selectable hive configuration.
///
/// Everything here is a policy knob, not a format parameter: two hives with
/// different `HiveConfig`s are still byte-compatible on disk.
#[derive(Debug, Clone)]
pub struct HiveConfig {
    /// Hard cap on stable storage growth. Allocation past the cap fails
    /// with `HiveError::QuotaExceeded`.
    pub storage_quota: u64,

    /// Cap on the write-ahead log budget; bin growth that would push the
    /// dirty footprint past it fails with `HiveError::NoLogSpace`.
    pub log_quota: u64,

    /// Number of views the cache keeps mapped.
    pub view_capacity: usize,

    /// When false the allocator never reuses discarded free bins and only
    /// grows at the end of storage. Compaction sets this on its scratch
    /// hive so shifted cells land at predictable offsets.
    pub allow_free_bin_reuse: bool,

    /// When true, the consistency checker repairs what it can in place
    /// and records the hive as self-healed instead of failing the check.
    pub self_heal: bool,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            storage_quota: DEFAULT_STORAGE_QUOTA,
            log_quota: DEFAULT_LOG_QUOTA,
            view_capacity: DEFAULT_VIEW_CAPACITY,
            allow_free_bin_reuse: true,
            self_heal: false,
        }
    }
}

impl HiveConfig {
    /// Grow-only configuration used for compaction targets.
    pub fn grow_only() -> Self {
        Self {
            allow_free_bin_reuse: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_allows_bin_reuse() {
        let cfg = HiveConfig::default();

        assert!(cfg.allow_free_bin_reuse);
        assert!(!cfg.self_heal);
        assert_eq!(cfg.storage_quota, DEFAULT_STORAGE_QUOTA);
    }

    #[test]
    fn grow_only_config_disables_bin_reuse() {
        let cfg = HiveConfig::grow_only();

        assert!(!cfg.allow_free_bin_reuse);
    }
}
