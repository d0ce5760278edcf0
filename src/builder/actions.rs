//! Named side-effect handlers that commands opt into by name.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::warn;

use crate::command::Command;
use crate::error::DispatchError;
use crate::transport::ClientResponse;

type StartHook = Arc<dyn Fn(&Command) + Send + Sync>;
type SuccessHook = Arc<dyn Fn(&Command, &ClientResponse) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&Command, &DispatchError) + Send + Sync>;

#[derive(Clone)]
pub struct Action {
    name: String,
    on_start: Option<StartHook>,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").field("name", &self.name).finish()
    }
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_start: None,
            on_success: None,
            on_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Command) + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Command, &ClientResponse) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Command, &DispatchError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub(crate) fn started(&self, command: &Command) {
        if let Some(hook) = &self.on_start {
            self.guarded("on_start", || hook(command));
        }
    }

    pub(crate) fn settled(&self, command: &Command, settlement: &Result<ClientResponse, DispatchError>) {
        match settlement {
            Ok(response) => {
                if let Some(hook) = &self.on_success {
                    self.guarded("on_success", || hook(command, response));
                }
            }
            Err(err) => {
                if let Some(hook) = &self.on_error {
                    self.guarded("on_error", || hook(command, err));
                }
            }
        }
    }

    fn guarded(&self, stage: &'static str, hook: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(hook)).is_err() {
            warn!(action = %self.name, stage, "Action handler panicked");
        }
    }
}
