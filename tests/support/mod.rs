//! Scripted transport shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier::Command;
use courier::transport::{CancelSignal, ClientResponse, Transport};
use serde_json::{Value, json};

/// Answers every command with its path, after an optional per-path delay.
///
/// Paths can be scripted to fail a number of times or to answer with a
/// fixed payload. Calls are recorded in the order they started. Delays end
/// early on cancellation unless [`ScriptedTransport::ignore_cancel`] is set.
#[derive(Default)]
pub struct ScriptedTransport {
    calls: Mutex<Vec<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    failures: Mutex<HashMap<String, u32>>,
    payloads: Mutex<HashMap<String, Value>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    ignore_cancel: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(path.to_string(), delay);
    }

    pub fn fail_times(&self, path: &str, times: u32) {
        self.failures.lock().unwrap().insert(path.to_string(), times);
    }

    pub fn respond_with(&self, path: &str, payload: Value) {
        self.payloads.lock().unwrap().insert(path.to_string(), payload);
    }

    /// Run every delay to completion even after the call is cancelled.
    pub fn ignore_cancel(&self) {
        self.ignore_cancel.store(true, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, command: &Command, cancel: &CancelSignal) -> ClientResponse {
        let path = command.path_and_query();
        self.calls.lock().unwrap().push(path.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.lock().unwrap().get(&path).copied();
        if let Some(delay) = delay
            && self.ignore_cancel.load(Ordering::SeqCst)
        {
            tokio::time::sleep(delay).await;
        } else if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&path) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            return ClientResponse::failure(json!({ "path": path, "error": "unavailable" }))
                .with_status(503);
        }

        let payload = self
            .payloads
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .unwrap_or_else(|| json!({ "path": path, "body": command.body }));
        ClientResponse::success(payload)
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
