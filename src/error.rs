use thiserror::Error;

use crate::queue::storage::StorageError;
use crate::transport::ClientResponse;

/// Why a dispatched command did not produce a successful response.
///
/// `Clone` so every caller that joined one execution receives the same error.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("request failed{}", status_suffix(response))]
    Transport { response: ClientResponse },
    #[error("request was superseded before it settled")]
    Superseded,
    #[error("request failed after {attempts} attempts{}", status_suffix(response))]
    RetryExhausted {
        attempts: u32,
        response: ClientResponse,
    },
    #[error("queue storage failed: {0}")]
    Storage(String),
    #[error("queue was cleared before the request settled")]
    Dropped,
}

fn status_suffix(response: &ClientResponse) -> String {
    response
        .status
        .map(|status| format!(" with status {status}"))
        .unwrap_or_default()
}

impl DispatchError {
    /// The failing response, when the transport produced one.
    pub fn response(&self) -> Option<&ClientResponse> {
        match self {
            DispatchError::Transport { response }
            | DispatchError::RetryExhausted { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Transport { .. } => "transport",
            DispatchError::Superseded => "superseded",
            DispatchError::RetryExhausted { .. } => "retry_exhausted",
            DispatchError::Storage(_) => "storage",
            DispatchError::Dropped => "dropped",
        }
    }
}

impl From<StorageError> for DispatchError {
    fn from(err: StorageError) -> Self {
        DispatchError::Storage(err.to_string())
    }
}

/// Builder misuse, reported before anything is dispatched.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("action names must be unique: {name} is already registered")]
    DuplicateAction { name: String },
    #[error("actions cannot be registered after build")]
    AlreadyBuilt,
    #[error("commands cannot be created before build")]
    NotBuilt,
    #[error("failed to rehydrate queued requests: {0}")]
    Storage(#[from] StorageError),
}
