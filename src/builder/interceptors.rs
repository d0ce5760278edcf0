//! Request and response interceptor chains.
//!
//! The chains wrap the configured transport, so every attempt of every
//! queue passes through them. A command can opt out of either chain.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::command::Command;
use crate::lock::{rw_read, rw_write};
use crate::transport::{CancelSignal, ClientResponse, Transport};

const SOURCE: &str = "builder::interceptors";

pub type RequestInterceptor = Arc<dyn Fn(Command) -> Command + Send + Sync>;
pub type ResponseInterceptor = Arc<dyn Fn(ClientResponse, &Command) -> ClientResponse + Send + Sync>;

#[derive(Default)]
pub(crate) struct Interceptors {
    request: RwLock<Vec<RequestInterceptor>>,
    response: RwLock<Vec<ResponseInterceptor>>,
}

impl Interceptors {
    pub(crate) fn push_request(&self, interceptor: RequestInterceptor) {
        rw_write(&self.request, SOURCE, "push_request").push(interceptor);
    }

    pub(crate) fn push_response(&self, interceptor: ResponseInterceptor) {
        rw_write(&self.response, SOURCE, "push_response").push(interceptor);
    }

    fn apply_request(&self, command: &Command) -> Command {
        if command.disable_request_interceptors {
            return command.clone();
        }
        let chain = rw_read(&self.request, SOURCE, "apply_request").clone();
        chain
            .iter()
            .fold(command.clone(), |command, interceptor| interceptor(command))
    }

    fn apply_response(&self, response: ClientResponse, command: &Command) -> ClientResponse {
        if command.disable_response_interceptors {
            return response;
        }
        let chain = rw_read(&self.response, SOURCE, "apply_response").clone();
        chain
            .iter()
            .fold(response, |response, interceptor| interceptor(response, command))
    }
}

/// Transport decorator that runs the interceptor chains around each attempt.
pub(crate) struct InterceptedTransport {
    inner: Arc<dyn Transport>,
    interceptors: Arc<Interceptors>,
}

impl InterceptedTransport {
    pub(crate) fn new(inner: Arc<dyn Transport>, interceptors: Arc<Interceptors>) -> Self {
        Self {
            inner,
            interceptors,
        }
    }
}

#[async_trait]
impl Transport for InterceptedTransport {
    async fn execute(&self, command: &Command, cancel: &CancelSignal) -> ClientResponse {
        let command = self.interceptors.apply_request(command);
        let response = self.inner.execute(&command, cancel).await;
        self.interceptors.apply_response(response, &command)
    }
}
