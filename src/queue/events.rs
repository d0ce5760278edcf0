use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::command::HttpMethod;

/// Lifecycle notifications published by both dispatch queues.
///
/// `key` is the request key for the fetch queue and the queue key for the
/// submit queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// Fetch queue only: an execution for `key` started or finished.
    Loading { key: String, loading: bool },
    /// Submit queue only: an entry joined the tail of its lane.
    Enqueued { key: String, id: Uuid },
    /// An entry became the executing head of its lane.
    Started { key: String, id: Uuid },
    /// An attempt failed and the entry will run again in place.
    Retrying { key: String, id: Uuid, attempt: u32 },
    /// A newer execution replaced this one; its result will be discarded.
    Superseded { key: String, id: Uuid },
    /// The entry was dropped by `delete`, `destroy` or `clear`.
    Removed { key: String, id: Uuid },
    /// The entry finished and its result was delivered.
    Settled { key: String, id: Uuid, success: bool },
}

impl QueueEvent {
    pub fn key(&self) -> &str {
        match self {
            QueueEvent::Loading { key, .. }
            | QueueEvent::Enqueued { key, .. }
            | QueueEvent::Started { key, .. }
            | QueueEvent::Retrying { key, .. }
            | QueueEvent::Superseded { key, .. }
            | QueueEvent::Removed { key, .. }
            | QueueEvent::Settled { key, .. } => key,
        }
    }
}

/// Snapshot of one live queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningRequest {
    pub key: String,
    pub id: Uuid,
    pub endpoint: String,
    pub method: HttpMethod,
    pub retries: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}
