//! Dispatch coordinator.
//!
//! A [`Builder`] owns one cache store and one pair of queues; nothing is
//! shared between builders. Setup (actions, interceptors) happens before
//! [`Builder::build`], which also restores durable submissions. After that,
//! commands are created with [`Builder::create_command`] and run with
//! [`Builder::dispatch`].

mod actions;
mod interceptors;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::cache::{CacheConfig, CacheEntry, CacheStore, DeepEqual, default_comparator};
use crate::command::{Command, CommandPolicy, HttpMethod, QueueKind};
use crate::config::Settings;
use crate::error::{DispatchError, SetupError};
use crate::lock::{rw_read, rw_write};
use crate::queue::storage::{MemoryQueueStorage, QueueStorage, StorageError};
use crate::queue::{FetchQueue, SubmitHandle, SubmitQueue};
use crate::transport::{ClientResponse, Transport};

pub use actions::Action;
pub use interceptors::{RequestInterceptor, ResponseInterceptor};

use interceptors::{InterceptedTransport, Interceptors};

const SOURCE: &str = "builder";

/// Construction options for a [`Builder`].
#[derive(Clone)]
pub struct BuilderConfig {
    pub cache: CacheConfig,
    /// Policy every created command starts from.
    pub defaults: CommandPolicy,
    pub comparator: DeepEqual,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            defaults: CommandPolicy::default(),
            comparator: default_comparator(),
        }
    }
}

impl From<&Settings> for BuilderConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            cache: CacheConfig::from(&settings.cache),
            defaults: CommandPolicy {
                retry: settings.queue.retry,
                retry_time: settings.queue.retry_time,
                deduplicate_time: settings.queue.deduplicate_time,
                ..CommandPolicy::default()
            },
            comparator: default_comparator(),
        }
    }
}

pub struct Builder {
    cache: Arc<CacheStore>,
    fetch_queue: FetchQueue,
    submit_queue: SubmitQueue,
    interceptors: Arc<Interceptors>,
    actions: RwLock<Vec<Action>>,
    built: AtomicBool,
    defaults: CommandPolicy,
}

impl Builder {
    /// Builder with in-memory submit storage and default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_storage(
            transport,
            Arc::new(MemoryQueueStorage::new()),
            BuilderConfig::default(),
        )
    }

    pub fn with_storage(
        transport: Arc<dyn Transport>,
        storage: Arc<dyn QueueStorage>,
        config: BuilderConfig,
    ) -> Self {
        let cache = Arc::new(CacheStore::with_comparator(&config.cache, config.comparator));
        let interceptors = Arc::new(Interceptors::default());
        let transport: Arc<dyn Transport> = Arc::new(InterceptedTransport::new(
            transport,
            Arc::clone(&interceptors),
        ));

        Self {
            fetch_queue: FetchQueue::new(Arc::clone(&cache), Arc::clone(&transport)),
            submit_queue: SubmitQueue::new(Arc::clone(&cache), transport, storage),
            cache,
            interceptors,
            actions: RwLock::new(Vec::new()),
            built: AtomicBool::new(false),
            defaults: config.defaults,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn fetch_queue(&self) -> &FetchQueue {
        &self.fetch_queue
    }

    pub fn submit_queue(&self) -> &SubmitQueue {
        &self.submit_queue
    }

    pub fn is_built(&self) -> bool {
        self.built.load(Ordering::SeqCst)
    }

    /// Register a request interceptor. Runs before every attempt.
    pub fn on_request<F>(&self, interceptor: F) -> &Self
    where
        F: Fn(Command) -> Command + Send + Sync + 'static,
    {
        self.interceptors.push_request(Arc::new(interceptor));
        self
    }

    /// Register a response interceptor. Runs after every attempt.
    pub fn on_response<F>(&self, interceptor: F) -> &Self
    where
        F: Fn(ClientResponse, &Command) -> ClientResponse + Send + Sync + 'static,
    {
        self.interceptors.push_response(Arc::new(interceptor));
        self
    }

    /// Register named actions. Names must be unique across the builder.
    pub fn add_actions(&self, actions: impl IntoIterator<Item = Action>) -> Result<(), SetupError> {
        if self.is_built() {
            return Err(SetupError::AlreadyBuilt);
        }

        let mut registered = rw_write(&self.actions, SOURCE, "add_actions");
        let mut staged: Vec<Action> = Vec::new();
        for action in actions {
            let taken = registered
                .iter()
                .chain(staged.iter())
                .any(|existing| existing.name() == action.name());
            if taken {
                return Err(SetupError::DuplicateAction {
                    name: action.name().to_string(),
                });
            }
            staged.push(action);
        }
        registered.extend(staged);
        Ok(())
    }

    pub fn remove_action(&self, name: &str) -> bool {
        let mut registered = rw_write(&self.actions, SOURCE, "remove_action");
        let before = registered.len();
        registered.retain(|action| action.name() != name);
        registered.len() != before
    }

    /// Freeze setup and restore durable submissions.
    pub async fn build(&self) -> Result<(), SetupError> {
        self.built.store(true, Ordering::SeqCst);
        self.submit_queue.flush_all().await?;
        info!(
            actions = rw_read(&self.actions, SOURCE, "build").len(),
            "Builder ready"
        );
        Ok(())
    }

    /// New command carrying the builder's default policy.
    pub fn create_command(
        &self,
        method: HttpMethod,
        endpoint: impl Into<String>,
    ) -> Result<Command, SetupError> {
        if !self.is_built() {
            return Err(SetupError::NotBuilt);
        }
        let command = Command::new(method, endpoint, self.defaults.clone());
        self.cache.ensure_space(&command.cache_space());
        Ok(command)
    }

    /// Route `command` to its queue and wait for the settlement.
    pub async fn dispatch(&self, command: Command) -> Result<ClientResponse, DispatchError> {
        let actions = self.actions_for(&command);
        for action in &actions {
            action.started(&command);
        }

        let settlement = match command.route() {
            QueueKind::Fetch => self.fetch_queue.add(command.clone()).await,
            _ => match self.submit_queue.add(command.clone()).await {
                Ok(handle) => handle.await,
                Err(err) => Err(err),
            },
        };

        for action in &actions {
            action.settled(&command, &settlement);
        }
        settlement
    }

    /// Enqueue a write without waiting for it to settle.
    pub async fn submit(&self, command: Command) -> Result<SubmitHandle, DispatchError> {
        self.submit_queue.add(command).await
    }

    /// Cached entry for `command` while it is younger than its `cache_time`.
    pub fn cached(&self, command: &Command) -> Option<CacheEntry> {
        self.cache
            .get(&command.cache_space(), &command.cache_key())
            .filter(|entry| !entry.is_stale(command.policy.cache_time))
    }

    pub fn set_online(&self, online: bool) {
        self.submit_queue.set_online(online);
    }

    pub async fn flush_all(&self) -> Result<(), StorageError> {
        self.submit_queue.flush_all().await
    }

    /// Tear down all in-memory state owned by this builder: live and queued
    /// requests, cached entries, and every subscriber.
    ///
    /// Durable submissions stay in storage for the next builder; see
    /// [`Builder::purge_storage`].
    pub async fn clear(&self) {
        self.fetch_queue.destroy();
        self.submit_queue.clear().await;
        self.cache.clear();

        self.cache.events().remove_all_listeners();
        self.fetch_queue.events().remove_all_listeners();
        self.submit_queue.events().remove_all_listeners();
        debug!("Builder cleared");
    }

    /// Discard every durable submission that has not settled yet.
    pub async fn purge_storage(&self) -> Result<(), StorageError> {
        self.submit_queue.purge_storage().await
    }

    /// Subscriber panics observed across all buses of this builder.
    pub fn subscriber_failures(&self) -> u64 {
        self.cache.events().failures()
            + self.fetch_queue.events().failures()
            + self.submit_queue.events().failures()
    }

    fn actions_for(&self, command: &Command) -> Vec<Action> {
        if command.actions.is_empty() {
            return Vec::new();
        }
        let registered = rw_read(&self.actions, SOURCE, "actions_for");
        command
            .actions
            .iter()
            .filter_map(|name| {
                let found = registered.iter().find(|action| action.name() == name).cloned();
                if found.is_none() {
                    warn!(action = %name, endpoint = %command.endpoint, "Command references unknown action");
                }
                found
            })
            .collect()
    }
}
