//! Response cache.
//!
//! Settlements are stored per cache space (`"GET_/users/:id"`) and cache key
//! (`"GET_/users/1?expand=true"`). Writes are gated by a structural
//! comparator so unchanged responses do not notify subscribers.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! space_limit = 500
//! ```

mod config;
mod equality;
mod events;
mod store;

pub use config::CacheConfig;
pub use equality::{Comparator, DeepEqual, MAX_COMPARE_DEPTH, deep_equal, default_comparator};
pub use events::CacheEvent;
pub use store::{CacheEntry, CacheInput, CacheStore};

pub(crate) use store::{METRIC_CACHE_EVICTED, METRIC_CACHE_NOOP, METRIC_CACHE_WRITE};
