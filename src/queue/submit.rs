//! Write dispatch: strict FIFO lanes, one executing head per queue key.
//!
//! A lane exists while it holds entries. Its driver task executes the head,
//! retries it in place, settles it, and only then moves to the next entry.
//! Offline-eligible entries are mirrored into [`QueueStorage`] from enqueue
//! until settlement and are restored on the first `add` or `flush_all`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use metrics::gauge;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheInput, CacheStore};
use crate::command::Command;
use crate::error::DispatchError;
use crate::events::{EventBus, SubscriptionId};
use crate::lock::mutex_lock;
use crate::transport::{CancelSignal, ClientResponse, Transport};

use super::events::{QueueEvent, RunningRequest};
use super::retry::{execute_with_retries, into_settlement};
use super::storage::{PersistedEntry, QueueStorage, StorageError};

const SOURCE: &str = "queue::submit";

pub(crate) const METRIC_SUBMIT_PENDING: &str = "courier_submit_pending";

type Settlement = Result<ClientResponse, DispatchError>;

struct SubmitEntry {
    id: Uuid,
    command: Command,
    retries: u32,
    enqueued_at: OffsetDateTime,
    durable: bool,
    /// Absent for entries restored from storage; nobody is waiting on them.
    reply: Option<oneshot::Sender<Settlement>>,
}

impl SubmitEntry {
    fn restored(persisted: PersistedEntry) -> Self {
        Self {
            id: persisted.id,
            command: persisted.command,
            retries: persisted.retries,
            enqueued_at: persisted.enqueued_at,
            durable: true,
            reply: None,
        }
    }

    fn snapshot(&self, key: &str) -> RunningRequest {
        RunningRequest {
            key: key.to_string(),
            id: self.id,
            endpoint: self.command.endpoint.clone(),
            method: self.command.method,
            retries: self.retries,
            started_at: self.enqueued_at,
        }
    }
}

struct Lane {
    generation: u64,
    entries: VecDeque<SubmitEntry>,
    running: bool,
    /// Cancels the head that is currently executing.
    cancel: CancelSignal,
}

struct Head {
    id: Uuid,
    command: Command,
    retries: u32,
    durable: bool,
    cancel: CancelSignal,
}

struct Inner {
    lanes: Mutex<HashMap<String, Lane>>,
    /// Serializes `add`, restoration and `clear` so storage order matches lane order.
    admission: tokio::sync::Mutex<()>,
    storage: Arc<dyn QueueStorage>,
    restored: AtomicBool,
    online: AtomicBool,
    generations: AtomicU64,
    events: EventBus<QueueEvent>,
    cache: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
}

impl Inner {
    fn new_lane(&self) -> Lane {
        Lane {
            generation: self.generations.fetch_add(1, Ordering::SeqCst),
            entries: VecDeque::new(),
            running: false,
            cancel: CancelSignal::new(),
        }
    }
}

/// Resolves when the submitted entry settles.
///
/// Dropping the handle does not cancel the entry.
#[derive(Debug)]
pub struct SubmitHandle {
    id: Uuid,
    queue_key: String,
    receiver: oneshot::Receiver<Settlement>,
}

impl SubmitHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }
}

impl Future for SubmitHandle {
    type Output = Settlement;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(DispatchError::Dropped)))
    }
}

/// Cheap to clone; clones share the same lanes.
#[derive(Clone)]
pub struct SubmitQueue {
    inner: Arc<Inner>,
}

impl SubmitQueue {
    pub fn new(
        cache: Arc<CacheStore>,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn QueueStorage>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                lanes: Mutex::new(HashMap::new()),
                admission: tokio::sync::Mutex::new(()),
                storage,
                restored: AtomicBool::new(false),
                online: AtomicBool::new(true),
                generations: AtomicU64::new(0),
                events: EventBus::new("submit_queue"),
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

    /// Append `command` to the tail of its lane.
    ///
    /// Durable entries are written to storage before the handle is returned;
    /// a storage failure rejects the entry.
    pub async fn add(&self, command: Command) -> Result<SubmitHandle, DispatchError> {
        let _admission = self.inner.admission.lock().await;
        self.restore().await?;

        let key = command.queue_key();
        let id = Uuid::new_v4();
        let enqueued_at = OffsetDateTime::now_utc();
        let durable = command.policy.offline;

        if durable {
            self.inner
                .storage
                .append(&PersistedEntry {
                    id,
                    queue_key: key.clone(),
                    command: command.clone(),
                    retries: 0,
                    enqueued_at,
                })
                .await?;
        }

        let (reply, receiver) = oneshot::channel();
        let start = {
            let mut lanes = mutex_lock(&self.inner.lanes, SOURCE, "add");
            let lane = lanes
                .entry(key.clone())
                .or_insert_with(|| self.inner.new_lane());
            lane.entries.push_back(SubmitEntry {
                id,
                command,
                retries: 0,
                enqueued_at,
                durable,
                reply: Some(reply),
            });
            self.claim(lane)
        };

        gauge!(METRIC_SUBMIT_PENDING).increment(1.0);
        debug!(queue_key = %key, %id, durable, "Submit enqueued");
        self.inner.events.emit(&QueueEvent::Enqueued {
            key: key.clone(),
            id,
        });
        if let Some(generation) = start {
            self.spawn_driver(key.clone(), generation);
        }

        Ok(SubmitHandle {
            id,
            queue_key: key,
            receiver,
        })
    }

    /// Restore durable entries if that has not happened yet, then start
    /// every idle lane.
    pub async fn flush_all(&self) -> Result<(), StorageError> {
        {
            let _admission = self.inner.admission.lock().await;
            self.restore().await?;
        }
        self.start_idle_lanes();
        Ok(())
    }

    /// Pause or resume lane drivers. A paused lane finishes its current head.
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(online, "Submit queue connectivity changed");
        }
        if online {
            self.start_idle_lanes();
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Entries waiting in the lane for `queue_key`, head first.
    pub fn get(&self, queue_key: &str) -> Vec<RunningRequest> {
        mutex_lock(&self.inner.lanes, SOURCE, "get")
            .get(queue_key)
            .map(|lane| {
                lane.entries
                    .iter()
                    .map(|entry| entry.snapshot(queue_key))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Heads that are currently executing, one per running lane.
    pub fn get_all_running_requests(&self) -> Vec<RunningRequest> {
        let mut running: Vec<_> = mutex_lock(&self.inner.lanes, SOURCE, "running")
            .iter()
            .filter(|(_, lane)| lane.running)
            .filter_map(|(key, lane)| lane.entries.front().map(|entry| entry.snapshot(key)))
            .collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        running
    }

    /// Every entry in every lane, in lane order.
    pub fn pending(&self) -> Vec<RunningRequest> {
        let lanes = mutex_lock(&self.inner.lanes, SOURCE, "pending");
        let mut keys: Vec<&String> = lanes.keys().collect();
        keys.sort();
        keys.into_iter()
            .flat_map(|key| lanes[key].entries.iter().map(|entry| entry.snapshot(key)))
            .collect()
    }

    /// Drop one entry. Cancels it when it is the executing head.
    pub async fn delete(&self, queue_key: &str, id: Uuid) -> bool {
        let removed = {
            let mut lanes = mutex_lock(&self.inner.lanes, SOURCE, "delete");
            let Some(lane) = lanes.get_mut(queue_key) else {
                return false;
            };
            let Some(position) = lane.entries.iter().position(|entry| entry.id == id) else {
                return false;
            };
            if position == 0 && lane.running {
                lane.cancel.cancel();
            }
            lane.entries.remove(position)
        };
        let Some(entry) = removed else {
            return false;
        };

        self.forget(queue_key, entry).await;
        true
    }

    /// Drop every lane. Waiting handles resolve with
    /// [`DispatchError::Dropped`].
    ///
    /// Durable storage is left alone so offline writes survive teardown and
    /// are restored by the next queue built on the same storage. Use
    /// [`SubmitQueue::purge_storage`] to discard them.
    pub async fn clear(&self) {
        let _admission = self.inner.admission.lock().await;
        let drained: Vec<(String, Lane)> =
            mutex_lock(&self.inner.lanes, SOURCE, "clear").drain().collect();

        for (key, lane) in drained {
            lane.cancel.cancel();
            for entry in lane.entries {
                gauge!(METRIC_SUBMIT_PENDING).decrement(1.0);
                self.inner.events.emit(&QueueEvent::Removed {
                    key: key.clone(),
                    id: entry.id,
                });
            }
        }
        debug!("Submit queue cleared");
    }

    /// Delete every persisted entry. In-memory lanes are not touched.
    pub async fn purge_storage(&self) -> Result<(), StorageError> {
        let _admission = self.inner.admission.lock().await;
        self.inner.storage.clear().await?;
        info!("Submit queue storage purged");
        Ok(())
    }

    async fn forget(&self, queue_key: &str, entry: SubmitEntry) {
        gauge!(METRIC_SUBMIT_PENDING).decrement(1.0);
        if entry.durable
            && let Err(err) = self.inner.storage.remove(queue_key, entry.id).await
        {
            warn!(queue_key, id = %entry.id, error = %err, "Failed to remove deleted submit entry from storage");
        }
        self.inner.events.emit(&QueueEvent::Removed {
            key: queue_key.to_string(),
            id: entry.id,
        });
    }

    /// Must run with admission held.
    async fn restore(&self) -> Result<(), StorageError> {
        if self.inner.restored.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut stored = Vec::new();
        for key in self.inner.storage.queue_keys().await? {
            let entries = self.inner.storage.list(&key).await?;
            stored.push((key, entries));
        }

        let mut restored = 0_usize;
        {
            let mut lanes = mutex_lock(&self.inner.lanes, SOURCE, "restore");
            for (key, entries) in stored {
                let lane = lanes
                    .entry(key)
                    .or_insert_with(|| self.inner.new_lane());
                for persisted in entries {
                    if lane.entries.iter().any(|entry| entry.id == persisted.id) {
                        continue;
                    }
                    lane.entries.push_back(SubmitEntry::restored(persisted));
                    restored += 1;
                }
            }
            lanes.retain(|_, lane| !lane.entries.is_empty());
        }

        self.inner.restored.store(true, Ordering::SeqCst);
        if restored > 0 {
            gauge!(METRIC_SUBMIT_PENDING).increment(restored as f64);
            info!(restored, "Restored durable submit entries");
        }
        Ok(())
    }

    /// Mark the lane running if it may start. Returns the lane generation
    /// the new driver must carry.
    fn claim(&self, lane: &mut Lane) -> Option<u64> {
        if lane.running || lane.entries.is_empty() || !self.is_online() {
            return None;
        }
        lane.running = true;
        Some(lane.generation)
    }

    fn start_idle_lanes(&self) {
        let claimed: Vec<(String, u64)> = {
            let mut lanes = mutex_lock(&self.inner.lanes, SOURCE, "start_idle_lanes");
            lanes
                .iter_mut()
                .filter_map(|(key, lane)| self.claim(lane).map(|generation| (key.clone(), generation)))
                .collect()
        };
        for (key, generation) in claimed {
            self.spawn_driver(key, generation);
        }
    }

    fn spawn_driver(&self, key: String, generation: u64) {
        tokio::spawn(drive(Arc::clone(&self.inner), key, generation));
    }
}

/// Take the head of a lane, or retire the driver.
fn next_head(inner: &Inner, key: &str, generation: u64) -> Option<Head> {
    let mut lanes = mutex_lock(&inner.lanes, SOURCE, "next_head");
    let lane = lanes.get_mut(key).filter(|lane| lane.generation == generation)?;

    if !inner.online.load(Ordering::SeqCst) {
        lane.running = false;
        debug!(queue_key = key, "Submit lane paused while offline");
        return None;
    }

    let Some(head) = lane.entries.front() else {
        lanes.remove(key);
        return None;
    };
    let head = Head {
        id: head.id,
        command: head.command.clone(),
        retries: head.retries,
        durable: head.durable,
        cancel: CancelSignal::new(),
    };
    lane.cancel = head.cancel.clone();
    Some(head)
}

async fn record_retry(inner: Arc<Inner>, key: String, id: Uuid, retries: u32, durable: bool) {
    {
        let mut lanes = mutex_lock(&inner.lanes, SOURCE, "record_retry");
        if let Some(entry) = lanes
            .get_mut(&key)
            .and_then(|lane| lane.entries.front_mut())
            .filter(|entry| entry.id == id)
        {
            entry.retries = retries;
        }
    }
    if durable
        && let Err(err) = inner.storage.update_retries(&key, id, retries).await
    {
        warn!(queue_key = %key, %id, error = %err, "Failed to persist submit retry count");
    }
    debug!(queue_key = %key, %id, retries, "Submit retrying in place");
    inner.events.emit(&QueueEvent::Retrying {
        key,
        id,
        attempt: retries,
    });
}

async fn drive(inner: Arc<Inner>, key: String, generation: u64) {
    while let Some(head) = next_head(&inner, &key, generation) {
        inner.events.emit(&QueueEvent::Started {
            key: key.clone(),
            id: head.id,
        });

        let attempt = execute_with_retries(
            inner.transport.as_ref(),
            &head.command,
            &head.cancel,
            head.retries,
            |retries| record_retry(Arc::clone(&inner), key.clone(), head.id, retries, head.durable),
        )
        .await;

        // Popping under the lock settles the entry; a concurrent `delete`
        // after this point no longer finds it.
        let settled = {
            let mut lanes = mutex_lock(&inner.lanes, SOURCE, "settle");
            lanes
                .get_mut(&key)
                .filter(|_| !head.cancel.is_cancelled())
                .filter(|lane| lane.generation == generation)
                .filter(|lane| lane.entries.front().is_some_and(|entry| entry.id == head.id))
                .and_then(|lane| lane.entries.pop_front())
        };
        let Some(entry) = settled else {
            debug!(queue_key = %key, id = %head.id, "Discarding result of removed submit entry");
            continue;
        };

        if head.command.policy.cache {
            inner.cache.set(
                &head.command.cache_space(),
                &head.command.cache_key(),
                CacheInput::new(attempt.response.clone())
                    .retries(attempt.retries)
                    .refreshed(head.command.refreshed)
                    .compare(head.command.policy.deep_equal)
                    .comparator(head.command.compare_with.clone()),
            );
        }

        if entry.durable
            && let Err(err) = inner.storage.remove(&key, entry.id).await
        {
            warn!(queue_key = %key, id = %entry.id, error = %err, "Failed to remove settled submit entry from storage");
        }

        gauge!(METRIC_SUBMIT_PENDING).decrement(1.0);
        let success = attempt.response.is_success();
        debug!(queue_key = %key, id = %entry.id, success, retries = attempt.retries, "Submit settled");
        inner.events.emit(&QueueEvent::Settled {
            key: key.clone(),
            id: entry.id,
            success,
        });
        if let Some(reply) = entry.reply {
            // The caller may have dropped its handle.
            let _ = reply.send(into_settlement(attempt));
        }
    }
}
