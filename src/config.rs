//! Index configuration.
//!
//! Defaults match the generic-malloc index as it ships; every knob can be
//! overridden from the environment with [`IndexConfig::from_env()`]:
//!
//! - `HEAPMETA_PROMOTION_THRESHOLD`: caller-visible size (bytes) above which a
//!   chunk is promoted to a big-allocation record instead of a bitmap bit.
//! - `HEAPMETA_RECENTLY_FREED`: capacity of the recently-freed ring used to
//!   report double frees. `0` turns the check off.
//! - `HEAPMETA_UNBOUNDED_SCAN`: any value other than `0` disables the bound
//!   that the high-water mark places on the backward bitmap scan.

use std::env;

/// Default glibc lower mmap threshold: 128 kB.
pub const DEFAULT_PROMOTION_THRESHOLD: usize = 131072;

/// Ring size for double-free detection when it is enabled.
pub const DEFAULT_RECENTLY_FREED: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConfig {
    /// Chunks whose caller-visible size is strictly greater than this are
    /// promoted.
    pub promotion_threshold: usize,
    /// Capacity of the recently-freed ring, `0` disables double-free reports.
    pub recently_freed: usize,
    /// Bound the backward scan by `biggest_unpromoted_object`.
    pub bound_backward_scan: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
            recently_freed: if cfg!(any(debug_assertions, feature = "trace-index")) {
                DEFAULT_RECENTLY_FREED
            } else {
                0
            },
            bound_backward_scan: true,
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {name}={raw:?}: not an unsigned integer");
            None
        }
    }
}

impl IndexConfig {
    /// Defaults, overridden by whatever `HEAPMETA_*` variables are set.
    ///
    /// This reads the environment, which allocates: call it before the index
    /// is installed in front of the allocator it is indexing.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(threshold) = env_usize("HEAPMETA_PROMOTION_THRESHOLD") {
            config.promotion_threshold = threshold;
        }
        if let Some(capacity) = env_usize("HEAPMETA_RECENTLY_FREED") {
            config.recently_freed = capacity;
        }
        if let Ok(raw) = env::var("HEAPMETA_UNBOUNDED_SCAN") {
            config.bound_backward_scan = raw.trim() == "0";
        }
        config
    }

    pub const fn with_promotion_threshold(mut self, threshold: usize) -> Self {
        self.promotion_threshold = threshold;
        self
    }

    pub const fn with_recently_freed(mut self, capacity: usize) -> Self {
        self.recently_freed = capacity;
        self
    }

    pub const fn with_bound_backward_scan(mut self, bound: bool) -> Self {
        self.bound_backward_scan = bound;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_mmap_threshold() {
        let config = IndexConfig::default();
        assert_eq!(config.promotion_threshold, 131072);
        assert!(config.bound_backward_scan);
    }

    #[test]
    fn builders_override_fields() {
        let config = IndexConfig::default()
            .with_promotion_threshold(4096)
            .with_recently_freed(0)
            .with_bound_backward_scan(false);
        assert_eq!(config.promotion_threshold, 4096);
        assert_eq!(config.recently_freed, 0);
        assert!(!config.bound_backward_scan);
    }
}
