//! Cache configuration.
//!
//! Bounds each cache space; filled from the `[cache]` settings section.

use std::num::NonZeroUsize;

use serde::Deserialize;

const DEFAULT_SPACE_LIMIT: usize = 500;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries per cache space before least-recently-written eviction.
    pub space_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            space_limit: DEFAULT_SPACE_LIMIT,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            space_limit: settings.space_limit.get(),
        }
    }
}

impl CacheConfig {
    /// Returns the space limit as NonZeroUsize, clamping to 1 if zero.
    pub fn space_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.space_limit).unwrap_or(NonZeroUsize::MIN)
    }
}
