//! The seam between the dispatch layer and whatever performs the network call.
//!
//! A [`Transport`] never returns `Err`: every settlement, including a failed
//! connection, is a [`ClientResponse`] whose [`Outcome`] is discriminated
//! into success or failure. Queues decide what to retry from that alone.

mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::command::Command;

pub use http::{HttpTransport, TransportError};

pub(crate) use http::METRIC_TRANSPORT_MS;

/// Discriminated settlement payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Outcome {
    Success(Value),
    Failure(Value),
}

impl Outcome {
    pub fn payload(&self) -> &Value {
        match self {
            Outcome::Success(value) | Outcome::Failure(value) => value,
        }
    }
}

/// When the call started and how long it took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub duration: Duration,
}

impl Timing {
    pub fn starting_now() -> Self {
        Self {
            started_at: OffsetDateTime::now_utc(),
            duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub outcome: Outcome,
    /// HTTP status when the server answered at all.
    pub status: Option<u16>,
    pub timing: Timing,
}

impl ClientResponse {
    pub fn success(data: Value) -> Self {
        Self {
            outcome: Outcome::Success(data),
            status: Some(200),
            timing: Timing::starting_now(),
        }
    }

    pub fn failure(error: Value) -> Self {
        Self {
            outcome: Outcome::Failure(error),
            status: None,
            timing: Timing::starting_now(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    pub fn data(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Failure(value) => Some(value),
            Outcome::Success(_) => None,
        }
    }
}

/// Best-effort cancellation flag shared between a queue and an execution.
///
/// Cloning yields another handle to the same flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Performs one attempt of a command.
///
/// Implementations should stop early when `cancel` fires; the queue treats
/// cancellation as best effort and ignores late results either way.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, command: &Command, cancel: &CancelSignal) -> ClientResponse;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn execute(&self, command: &Command, cancel: &CancelSignal) -> ClientResponse {
        (**self).execute(command, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let signal = CancelSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };

        assert!(!signal.is_cancelled());
        signal.cancel();
        waiter.await.expect("waiter task");
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_resolves_immediately() {
        let signal = CancelSignal::new();
        signal.cancel();
        signal.cancelled().await;
    }

    #[test]
    fn outcome_accessors() {
        let ok = ClientResponse::success(json!({"id": 1}));
        assert!(ok.is_success());
        assert_eq!(ok.data(), Some(&json!({"id": 1})));
        assert!(ok.error().is_none());

        let failed = ClientResponse::failure(json!("boom")).with_status(503);
        assert!(!failed.is_success());
        assert_eq!(failed.error(), Some(&json!("boom")));
        assert_eq!(failed.status, Some(503));
    }
}
