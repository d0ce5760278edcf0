//! Dispatch queues.
//!
//! - [`FetchQueue`]: reads, at most one live execution per request key.
//! - [`SubmitQueue`]: writes, strict FIFO per queue key, optionally durable.

mod events;
mod fetch;
mod retry;
pub mod storage;
mod submit;

pub use events::{QueueEvent, RunningRequest};
pub use fetch::FetchQueue;
pub use submit::{SubmitHandle, SubmitQueue};

pub(crate) use fetch::{METRIC_FETCH_DEDUPLICATED, METRIC_FETCH_SUPERSEDED};
pub(crate) use submit::METRIC_SUBMIT_PENDING;
