//! Cache notifications.

use super::store::CacheEntry;

/// Published synchronously by [`CacheStore`](super::CacheStore) before the
/// mutating call returns.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// An entry was written. Not emitted for deep-equal writes.
    Set {
        space: String,
        key: String,
        entry: CacheEntry,
    },
    /// A space was cleared and its consumers should refetch.
    Revalidate { space: String },
}

impl CacheEvent {
    pub fn space(&self) -> &str {
        match self {
            CacheEvent::Set { space, .. } | CacheEvent::Revalidate { space } => space,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CacheEvent::Set { .. } => "set",
            CacheEvent::Revalidate { .. } => "revalidate",
        }
    }
}
