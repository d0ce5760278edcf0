//! Read dispatch: one live execution per request key.
//!
//! A non-cancelable add joins the live execution for its key. A cancelable
//! add replaces it, cancelling the old one. Every execution re-checks, after
//! the transport settles, that it is still the registered entry for its key;
//! only then does it touch the cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{CacheInput, CacheStore};
use crate::command::Command;
use crate::error::DispatchError;
use crate::events::{EventBus, SubscriptionId};
use crate::transport::{CancelSignal, ClientResponse, Transport};

use super::events::{QueueEvent, RunningRequest};
use super::retry::{execute_with_retries, into_settlement};

pub(crate) const METRIC_FETCH_SUPERSEDED: &str = "courier_fetch_superseded_total";
pub(crate) const METRIC_FETCH_DEDUPLICATED: &str = "courier_fetch_deduplicated_total";

type Settlement = Result<ClientResponse, DispatchError>;

struct FetchEntry {
    id: Uuid,
    command: Command,
    cancel: CancelSignal,
    retries: Arc<AtomicU32>,
    started_at: OffsetDateTime,
    settlement: Shared<BoxFuture<'static, Settlement>>,
}

impl FetchEntry {
    fn snapshot(&self, key: &str) -> RunningRequest {
        RunningRequest {
            key: key.to_string(),
            id: self.id,
            endpoint: self.command.endpoint.clone(),
            method: self.command.method,
            retries: self.retries.load(Ordering::SeqCst),
            started_at: self.started_at,
        }
    }
}

/// Settlement kept for the deduplication window of the command that made it.
struct Recent {
    landed: Instant,
    window: Duration,
    settlement: Settlement,
}

impl Recent {
    fn is_live(&self) -> bool {
        self.landed.elapsed() < self.window
    }
}

struct Inner {
    entries: DashMap<String, FetchEntry>,
    recent: DashMap<String, Recent>,
    events: EventBus<QueueEvent>,
    cache: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
}

/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct FetchQueue {
    inner: Arc<Inner>,
}

impl FetchQueue {
    pub fn new(cache: Arc<CacheStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                recent: DashMap::new(),
                events: EventBus::new("fetch_queue"),
                cache,
                transport,
            }),
        }
    }

    pub fn events(&self) -> &EventBus<QueueEvent> {
        &self.inner.events
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Execute `command`, or join the execution already live for its key.
    pub async fn add(&self, command: Command) -> Settlement {
        let key = command.request_key();

        if command.policy.deduplicate
            && let Some(settlement) = self.recent(&key, command.policy.deduplicate_time)
        {
            counter!(METRIC_FETCH_DEDUPLICATED).increment(1);
            debug!(request_key = %key, "Fetch served from deduplication window");
            return settlement;
        }

        let cancelable = command.policy.cancelable;
        let (settlement, started) = match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(occupied) if !cancelable => {
                counter!(METRIC_FETCH_DEDUPLICATED).increment(1);
                debug!(request_key = %key, id = %occupied.get().id, "Fetch joined live execution");
                (occupied.get().settlement.clone(), None)
            }
            Entry::Occupied(mut occupied) => {
                let entry = self.start(key.clone(), command);
                let settlement = entry.settlement.clone();
                let id = entry.id;
                let replaced = occupied.insert(entry);
                replaced.cancel.cancel();
                (settlement, Some((id, Some(replaced.id))))
            }
            Entry::Vacant(vacant) => {
                let entry = self.start(key.clone(), command);
                let settlement = entry.settlement.clone();
                let id = entry.id;
                vacant.insert(entry);
                (settlement, Some((id, None)))
            }
        };

        if let Some((id, replaced)) = started {
            if let Some(replaced) = replaced {
                counter!(METRIC_FETCH_SUPERSEDED).increment(1);
                info!(request_key = %key, superseded = %replaced, by = %id, "Fetch superseded");
                self.inner.events.emit(&QueueEvent::Superseded {
                    key: key.clone(),
                    id: replaced,
                });
            }
            self.inner.events.emit(&QueueEvent::Loading {
                key: key.clone(),
                loading: true,
            });
            tokio::spawn(settlement.clone());
        }

        settlement.await
    }

    fn start(&self, key: String, command: Command) -> FetchEntry {
        let id = Uuid::new_v4();
        let cancel = CancelSignal::new();
        let retries = Arc::new(AtomicU32::new(0));
        let settlement = run(
            Arc::clone(&self.inner),
            key,
            id,
            command.clone(),
            cancel.clone(),
            Arc::clone(&retries),
        )
        .boxed()
        .shared();

        FetchEntry {
            id,
            command,
            cancel,
            retries,
            started_at: OffsetDateTime::now_utc(),
            settlement,
        }
    }

    fn recent(&self, key: &str, window: Duration) -> Option<Settlement> {
        let hit = self.inner.recent.get(key).and_then(|recent| {
            (recent.landed.elapsed() < window).then(|| recent.settlement.clone())
        });
        if hit.is_none() {
            self.inner
                .recent
                .remove_if(key, |_, recent| recent.landed.elapsed() >= window);
        }
        hit
    }

    pub fn get(&self, key: &str) -> Option<RunningRequest> {
        self.inner.entries.get(key).map(|entry| entry.snapshot(key))
    }

    /// Cancel and drop the live entry for `key`. Its result is discarded.
    pub fn delete(&self, key: &str) -> bool {
        let Some((key, entry)) = self.inner.entries.remove(key) else {
            return false;
        };
        entry.cancel.cancel();
        self.inner.events.emit(&QueueEvent::Removed {
            key: key.clone(),
            id: entry.id,
        });
        self.inner.events.emit(&QueueEvent::Loading {
            key,
            loading: false,
        });
        true
    }

    /// Cancel every live entry and forget recent settlements.
    pub fn destroy(&self) {
        let keys: Vec<String> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.delete(&key);
        }
        self.inner.recent.clear();
    }

    pub fn get_all_running_requests(&self) -> Vec<RunningRequest> {
        let mut running: Vec<_> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.snapshot(entry.key()))
            .collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        running
    }
}

async fn run(
    inner: Arc<Inner>,
    key: String,
    id: Uuid,
    command: Command,
    cancel: CancelSignal,
    retries: Arc<AtomicU32>,
) -> Settlement {
    let attempt = execute_with_retries(inner.transport.as_ref(), &command, &cancel, 0, |retry| {
        retries.store(retry, Ordering::SeqCst);
        inner.events.emit(&QueueEvent::Retrying {
            key: key.clone(),
            id,
            attempt: retry,
        });
        async {}
    })
    .await;

    if inner
        .entries
        .remove_if(&key, |_, entry| entry.id == id)
        .is_none()
    {
        debug!(request_key = %key, %id, "Discarding result of superseded fetch");
        return Err(DispatchError::Superseded);
    }

    inner.events.emit(&QueueEvent::Loading {
        key: key.clone(),
        loading: false,
    });

    if command.policy.cache {
        inner.cache.set(
            &command.cache_space(),
            &command.cache_key(),
            CacheInput::new(attempt.response.clone())
                .retries(attempt.retries)
                .refreshed(command.refreshed)
                .compare(command.policy.deep_equal)
                .comparator(command.compare_with.clone()),
        );
    }

    let success = attempt.response.is_success();
    let settlement = into_settlement(attempt);
    if command.policy.deduplicate {
        inner.recent.retain(|_, recent| recent.is_live());
        inner.recent.insert(
            key.clone(),
            Recent {
                landed: Instant::now(),
                window: command.policy.deduplicate_time,
                settlement: settlement.clone(),
            },
        );
    }

    inner.events.emit(&QueueEvent::Settled { key, id, success });
    settlement
}
