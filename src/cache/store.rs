//! Response cache storage.
//!
//! Two-level map: cache space (one per command identity) to an LRU of cache
//! key to [`CacheEntry`]. Locks are held only for the map mutation; events
//! are published after the guard is dropped so subscribers may read back.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use crate::events::{EventBus, SubscriptionId};
use crate::lock::{rw_read, rw_write};
use crate::transport::ClientResponse;

use super::config::CacheConfig;
use super::equality::{Comparator, DeepEqual, default_comparator, responses_equal};
use super::events::CacheEvent;

const SOURCE: &str = "cache::store";

pub(crate) const METRIC_CACHE_WRITE: &str = "courier_cache_write_total";
pub(crate) const METRIC_CACHE_NOOP: &str = "courier_cache_noop_total";
pub(crate) const METRIC_CACHE_EVICTED: &str = "courier_cache_evicted_total";

/// Last settlement stored for one cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Last good response, or the latest failure when there never was one.
    pub response: ClientResponse,
    pub retries: u32,
    /// Failure of a background refresh, kept beside the preserved data.
    pub refresh_error: Option<Value>,
    /// Failure after at least one retry, kept beside the preserved data.
    pub retry_error: Option<Value>,
    pub is_refreshed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        let elapsed = OffsetDateTime::now_utc() - self.timestamp;
        Duration::try_from(elapsed).unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, cache_time: Duration) -> bool {
        self.age() >= cache_time
    }

    /// Latest failure regardless of which slot recorded it.
    pub fn error(&self) -> Option<&Value> {
        self.refresh_error
            .as_ref()
            .or(self.retry_error.as_ref())
            .or_else(|| self.response.error())
    }
}

/// Arguments to [`CacheStore::set`].
#[derive(Debug, Clone)]
pub struct CacheInput {
    pub response: ClientResponse,
    pub retries: u32,
    pub is_refreshed: bool,
    /// Skip the write when the response is deep-equal to the cached one.
    pub compare: bool,
    /// Replaces the store comparator for this write.
    pub comparator: Option<Comparator>,
    pub timestamp: Option<OffsetDateTime>,
}

impl CacheInput {
    pub fn new(response: ClientResponse) -> Self {
        Self {
            response,
            retries: 0,
            is_refreshed: false,
            compare: true,
            comparator: None,
            timestamp: None,
        }
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn refreshed(mut self, is_refreshed: bool) -> Self {
        self.is_refreshed = is_refreshed;
        self
    }

    pub fn compare(mut self, compare: bool) -> Self {
        self.compare = compare;
        self
    }

    pub fn comparator(mut self, comparator: Option<Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn at(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

type Space = LruCache<String, CacheEntry>;

pub struct CacheStore {
    spaces: RwLock<HashMap<String, Space>>,
    events: EventBus<CacheEvent>,
    comparator: DeepEqual,
    config: CacheConfig,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_comparator(config, default_comparator())
    }

    pub fn with_comparator(config: &CacheConfig, comparator: DeepEqual) -> Self {
        Self {
            spaces: RwLock::new(HashMap::new()),
            events: EventBus::new("cache"),
            comparator,
            config: config.clone(),
        }
    }

    pub fn events(&self) -> &EventBus<CacheEvent> {
        &self.events
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Create the space if it does not exist yet.
    pub fn ensure_space(&self, space: &str) {
        let mut spaces = rw_write(&self.spaces, SOURCE, "ensure_space");
        if !spaces.contains_key(space) {
            spaces.insert(
                space.to_string(),
                LruCache::new(self.config.space_limit_non_zero()),
            );
        }
    }

    /// Store a settlement. Returns whether the entry changed.
    ///
    /// A failed refresh or retry never replaces a previously successful
    /// response: the good payload is kept and the failure goes into
    /// `refresh_error` / `retry_error`.
    pub fn set(&self, space: &str, key: &str, input: CacheInput) -> bool {
        let entry = {
            let mut spaces = rw_write(&self.spaces, SOURCE, "set");
            let entries = spaces
                .entry(space.to_string())
                .or_insert_with(|| LruCache::new(self.config.space_limit_non_zero()));
            let previous = entries.peek(key);

            let failure = input.response.error().cloned();
            let refresh_error = failure.clone().filter(|_| input.is_refreshed);
            let retry_error = failure.filter(|_| input.retries > 0);

            // An unchanged payload still has to land when it clears an error slot.
            let comparator = input
                .comparator
                .as_ref()
                .map_or(&self.comparator, Comparator::as_deep_equal);
            if input.compare
                && let Some(previous) = previous
                && previous.refresh_error == refresh_error
                && previous.retry_error == retry_error
                && responses_equal(comparator, &previous.response, &input.response)
            {
                counter!(METRIC_CACHE_NOOP).increment(1);
                debug!(space, key, "Cache write skipped; response unchanged");
                return false;
            }

            let response = match previous {
                Some(previous)
                    if previous.response.is_success()
                        && (refresh_error.is_some() || retry_error.is_some()) =>
                {
                    previous.response.clone()
                }
                _ => input.response,
            };

            let entry = CacheEntry {
                response,
                retries: input.retries,
                refresh_error,
                retry_error,
                is_refreshed: input.is_refreshed,
                timestamp: input.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
            };

            if let Some((evicted, _)) = entries.push(key.to_string(), entry.clone())
                && evicted != key
            {
                counter!(METRIC_CACHE_EVICTED).increment(1);
                debug!(space, evicted = %evicted, "Cache entry evicted");
            }
            entry
        };

        counter!(METRIC_CACHE_WRITE).increment(1);
        self.events.emit(&CacheEvent::Set {
            space: space.to_string(),
            key: key.to_string(),
            entry,
        });
        true
    }

    pub fn get(&self, space: &str, key: &str) -> Option<CacheEntry> {
        rw_read(&self.spaces, SOURCE, "get")
            .get(space)
            .and_then(|entries| entries.peek(key).cloned())
    }

    /// Empty a space and ask its consumers to revalidate.
    ///
    /// The notification goes out even when the space held nothing.
    pub fn delete(&self, space: &str) {
        if let Some(entries) = rw_write(&self.spaces, SOURCE, "delete").get_mut(space) {
            entries.clear();
        }
        debug!(space, "Cache space revalidated");
        self.events.emit(&CacheEvent::Revalidate {
            space: space.to_string(),
        });
    }

    /// Drop every space. Subscribers stay attached.
    pub fn clear(&self) {
        rw_write(&self.spaces, SOURCE, "clear").clear();
    }

    /// Every cache key currently held, across spaces.
    pub fn keys(&self) -> Vec<String> {
        rw_read(&self.spaces, SOURCE, "keys")
            .values()
            .flat_map(|entries| entries.iter().map(|(key, _)| key.clone()))
            .collect()
    }

    pub fn spaces(&self) -> Vec<String> {
        rw_read(&self.spaces, SOURCE, "spaces")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.spaces, SOURCE, "len")
            .values()
            .map(LruCache::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
