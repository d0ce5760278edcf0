use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::histogram;
use reqwest::{Client, Method, Url};
use serde_json::{Value, json};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

use crate::command::{Command, HttpMethod};

use super::{CancelSignal, ClientResponse, Outcome, Timing, Transport};

pub(crate) const METRIC_TRANSPORT_MS: &str = "courier_transport_ms";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("request timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request aborted")]
    Aborted,
}

impl TransportError {
    fn kind(&self) -> &'static str {
        match self {
            TransportError::Url(_) => "url",
            TransportError::Timeout => "timeout",
            TransportError::Http(_) => "http",
            TransportError::Aborted => "aborted",
        }
    }

    /// Failure payload handed to the queues in place of a server body.
    pub fn to_payload(&self) -> Value {
        json!({ "kind": self.kind(), "message": self.to_string() })
    }
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Head => Method::HEAD,
            HttpMethod::Options => Method::OPTIONS,
        }
    }
}

/// Reference transport over `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(base: &str, timeout: Option<Duration>) -> Result<Self, TransportError> {
        let mut builder = Client::builder().user_agent(Self::user_agent());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self::with_client(builder.build()?, Url::parse(base)?))
    }

    pub fn with_client(client: Client, mut base: Url) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { client, base }
    }

    pub fn user_agent() -> &'static str {
        concat!("courier/", env!("CARGO_PKG_VERSION"))
    }

    pub fn url(&self, command: &Command) -> Result<Url, TransportError> {
        let endpoint = command.resolved_endpoint();
        let mut url = self.base.join(endpoint.trim_start_matches('/'))?;
        if !command.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &command.query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    async fn send(&self, command: &Command) -> Result<(u16, Value), TransportError> {
        let url = self.url(command)?;
        let mut request = self.client.request(command.method.into(), url);
        for (name, value) in &command.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &command.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Http(err)
            }
        })?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        Ok((status, decode_body(&bytes)))
    }
}

fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, command: &Command, cancel: &CancelSignal) -> ClientResponse {
        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Aborted),
            result = self.send(command) => result,
        };

        let duration = clock.elapsed();
        histogram!(METRIC_TRANSPORT_MS, "method" => command.method.as_str())
            .record(duration.as_secs_f64() * 1000.0);
        let timing = Timing {
            started_at,
            duration,
        };

        let (outcome, status) = match result {
            Ok((status, body)) if (200..300).contains(&status) => {
                (Outcome::Success(body), Some(status))
            }
            Ok((status, body)) => (Outcome::Failure(body), Some(status)),
            Err(err) => {
                debug!(
                    endpoint = %command.endpoint,
                    method = command.method.as_str(),
                    error = %err,
                    "Transport call failed"
                );
                (Outcome::Failure(err.to_payload()), None)
            }
        };

        ClientResponse {
            outcome,
            status,
            timing,
        }
    }
}
