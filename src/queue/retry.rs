use std::future::Future;

use crate::command::Command;
use crate::error::DispatchError;
use crate::transport::{CancelSignal, ClientResponse, Transport};

/// Final response of an execution and how many retries it took.
pub(crate) struct Attempt {
    pub response: ClientResponse,
    pub retries: u32,
}

/// Run `command` until it succeeds, is cancelled, or uses up `policy.retry`.
///
/// `retries` is the count already spent, non-zero for entries restored from
/// storage. `before_retry` runs with the new count before each delay.
pub(crate) async fn execute_with_retries<F, Fut>(
    transport: &dyn Transport,
    command: &Command,
    cancel: &CancelSignal,
    mut retries: u32,
    mut before_retry: F,
) -> Attempt
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let response = transport.execute(command, cancel).await;
        if response.is_success() || retries >= command.policy.retry || cancel.is_cancelled() {
            return Attempt { response, retries };
        }

        retries += 1;
        before_retry(retries).await;
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Attempt { response, retries },
            () = tokio::time::sleep(command.policy.retry_time) => {}
        }
    }
}

pub(crate) fn into_settlement(attempt: Attempt) -> Result<ClientResponse, DispatchError> {
    let Attempt { response, retries } = attempt;
    if response.is_success() {
        Ok(response)
    } else if retries == 0 {
        Err(DispatchError::Transport { response })
    } else {
        Err(DispatchError::RetryExhausted {
            attempts: retries + 1,
            response,
        })
    }
}
