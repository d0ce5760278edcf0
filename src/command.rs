//! Declarative request descriptions and the keys derived from them.
//!
//! A [`Command`] names an endpoint template (`/users/:id`), the values that
//! fill it, and the policy flags that decide how the dispatch layer treats
//! it. Commands are plain data: they serialize as-is into the durable
//! submit-queue storage and are rebuilt from it on restart.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::form_urlencoded;

use crate::cache::{Comparator, DeepEqual};

const DEFAULT_DEDUPLICATE_TIME: Duration = Duration::from_millis(10);
const DEFAULT_RETRY_TIME: Duration = Duration::from_millis(500);
const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Methods that only read server state.
    pub fn is_read(self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Head | HttpMethod::Options)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for HttpMethod {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            _ => Err(()),
        }
    }
}

/// Which queue executes a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Reads go to the fetch queue unless `queued`; everything else is submitted.
    #[default]
    Auto,
    Fetch,
    Submit,
}

/// Policy flags consumed by the queues and the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPolicy {
    /// A newer fetch for the same request key cancels this one.
    pub cancelable: bool,
    /// Extra attempts after the first failure.
    pub retry: u32,
    /// Delay between attempts.
    pub retry_time: Duration,
    /// Write settlements into the cache store.
    pub cache: bool,
    /// Age after which a cached entry is considered stale.
    pub cache_time: Duration,
    /// Route through the submit queue and run one at a time per queue key.
    pub queued: bool,
    /// Persist while pending so the entry survives a restart.
    pub offline: bool,
    /// Reuse a settlement that landed less than `deduplicate_time` ago.
    pub deduplicate: bool,
    pub deduplicate_time: Duration,
    /// Skip cache writes whose response is deep-equal to the cached one.
    pub deep_equal: bool,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            cancelable: false,
            retry: 0,
            retry_time: DEFAULT_RETRY_TIME,
            cache: true,
            cache_time: DEFAULT_CACHE_TIME,
            queued: false,
            offline: false,
            deduplicate: false,
            deduplicate_time: DEFAULT_DEDUPLICATE_TIME,
            deep_equal: true,
        }
    }
}

/// Explicit keys that replace the derived ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyOverrides {
    pub cache_key: Option<String>,
    pub queue_key: Option<String>,
    pub request_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub policy: CommandPolicy,
    #[serde(default)]
    pub keys: KeyOverrides,
    /// Names of registered actions to notify about this command.
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub disable_request_interceptors: bool,
    #[serde(default)]
    pub disable_response_interceptors: bool,
    /// Marks a background refresh of data the caller already holds.
    #[serde(default)]
    pub refreshed: bool,
    #[serde(default)]
    pub queue_kind: QueueKind,
    /// Replaces the builder comparator for this command's cache writes.
    /// Not persisted; restored submissions use the builder comparator.
    #[serde(skip)]
    pub compare_with: Option<Comparator>,
}

impl Command {
    pub(crate) fn new(method: HttpMethod, endpoint: impl Into<String>, policy: CommandPolicy) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            params: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            headers: BTreeMap::new(),
            policy,
            keys: KeyOverrides::default(),
            actions: Vec::new(),
            disable_request_interceptors: false,
            disable_response_interceptors: false,
            refreshed: false,
            queue_kind: QueueKind::Auto,
            compare_with: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.insert(name.into(), value.to_string());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn cancelable(mut self, cancelable: bool) -> Self {
        self.policy.cancelable = cancelable;
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.policy.retry = retry;
        self
    }

    pub fn retry_time(mut self, retry_time: Duration) -> Self {
        self.policy.retry_time = retry_time;
        self
    }

    pub fn cache(mut self, cache: bool) -> Self {
        self.policy.cache = cache;
        self
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.policy.cache_time = cache_time;
        self
    }

    pub fn queued(mut self, queued: bool) -> Self {
        self.policy.queued = queued;
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.policy.offline = offline;
        self
    }

    pub fn deduplicate(mut self, deduplicate: bool) -> Self {
        self.policy.deduplicate = deduplicate;
        self
    }

    pub fn deduplicate_time(mut self, window: Duration) -> Self {
        self.policy.deduplicate_time = window;
        self
    }

    pub fn deep_equal(mut self, enabled: bool) -> Self {
        self.policy.deep_equal = enabled;
        self
    }

    /// Compare this command's responses with `comparator` before writing.
    pub fn compare_with(mut self, comparator: DeepEqual) -> Self {
        self.compare_with = Some(Comparator::from(comparator));
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.keys.cache_key = Some(key.into());
        self
    }

    pub fn with_queue_key(mut self, key: impl Into<String>) -> Self {
        self.keys.queue_key = Some(key.into());
        self
    }

    pub fn with_request_key(mut self, key: impl Into<String>) -> Self {
        self.keys.request_key = Some(key.into());
        self
    }

    pub fn action(mut self, name: impl Into<String>) -> Self {
        self.actions.push(name.into());
        self
    }

    pub fn refreshed(mut self, refreshed: bool) -> Self {
        self.refreshed = refreshed;
        self
    }

    pub fn queue_kind(mut self, kind: QueueKind) -> Self {
        self.queue_kind = kind;
        self
    }

    pub fn disable_request_interceptors(mut self, disabled: bool) -> Self {
        self.disable_request_interceptors = disabled;
        self
    }

    pub fn disable_response_interceptors(mut self, disabled: bool) -> Self {
        self.disable_response_interceptors = disabled;
        self
    }

    /// Stable identity of the endpoint family: `"GET_/users/:id"`.
    ///
    /// Used as the cache space and as the default queue key.
    pub fn identity(&self) -> String {
        format!("{}_{}", self.method, self.endpoint)
    }

    /// Endpoint with `:name` segments replaced by their params.
    ///
    /// Values are percent-encoded so a param never adds path segments.
    /// Segments without a matching param are left untouched.
    pub fn resolved_endpoint(&self) -> String {
        self.endpoint
            .split('/')
            .map(|segment| match segment.strip_prefix(':') {
                Some(name) => self
                    .params
                    .get(name)
                    .map(|value| form_urlencoded::byte_serialize(value.as_bytes()).collect())
                    .unwrap_or_else(|| segment.to_string()),
                None => segment.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Query params serialized in key order, without the leading `?`.
    pub fn query_string(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (name, value) in &self.query {
            serializer.append_pair(name, value);
        }
        serializer.finish()
    }

    /// Resolved endpoint plus query string.
    pub fn path_and_query(&self) -> String {
        let query = self.query_string();
        if query.is_empty() {
            self.resolved_endpoint()
        } else {
            format!("{}?{query}", self.resolved_endpoint())
        }
    }

    pub fn cache_space(&self) -> String {
        self.identity()
    }

    pub fn cache_key(&self) -> String {
        self.keys
            .cache_key
            .clone()
            .unwrap_or_else(|| self.parameterized_key())
    }

    pub fn request_key(&self) -> String {
        self.keys
            .request_key
            .clone()
            .unwrap_or_else(|| self.parameterized_key())
    }

    pub fn queue_key(&self) -> String {
        self.keys
            .queue_key
            .clone()
            .unwrap_or_else(|| self.identity())
    }

    /// Resolve [`QueueKind::Auto`] into a concrete queue.
    pub fn route(&self) -> QueueKind {
        match self.queue_kind {
            QueueKind::Auto if self.method.is_read() && !self.policy.queued => QueueKind::Fetch,
            QueueKind::Auto => QueueKind::Submit,
            explicit => explicit,
        }
    }

    fn parameterized_key(&self) -> String {
        format!("{}_{}", self.method, self.path_and_query())
    }
}
