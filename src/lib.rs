//! HTTP command dispatch with deduplicated reads, ordered writes and a
//! structurally-compared response cache.

pub mod builder;
pub mod cache;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub(crate) mod lock;
pub mod queue;
pub mod telemetry;
pub mod transport;

pub use builder::{Action, Builder, BuilderConfig};
pub use command::{Command, CommandPolicy, HttpMethod, QueueKind};
pub use error::{DispatchError, SetupError};
pub use transport::{ClientResponse, Outcome, Transport};
