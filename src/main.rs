use std::{path::Path, process, sync::Arc, time::Duration};

use courier::{
    Builder, BuilderConfig, Command, HttpMethod,
    config::{self, RequestArgs},
    error::{DispatchError, SetupError},
    queue::storage::{FileQueueStorage, QueueStorage, StorageError},
    telemetry::{self, TelemetryError},
    transport::{HttpTransport, TransportError},
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let transport = HttpTransport::new(
        settings.transport.base_url.as_str(),
        Some(settings.transport.timeout),
    )?;
    let storage = Arc::new(FileQueueStorage::new(&settings.queue.storage_directory));
    let builder = Builder::with_storage(
        Arc::new(transport),
        storage.clone(),
        BuilderConfig::from(&settings),
    );

    match cli_args.command {
        config::Command::Fetch(args) => run_fetch(&builder, args).await,
        config::Command::Submit(args) => run_submit(&builder, args).await,
        config::Command::Flush => run_flush(&builder).await,
        config::Command::Pending => run_pending(storage.as_ref()).await,
    }
}

async fn run_fetch(builder: &Builder, args: config::FetchArgs) -> Result<(), AppError> {
    builder.build().await?;
    let command = builder.create_command(HttpMethod::Get, args.endpoint)?;
    let command = apply_request_args(command, args.request).cancelable(args.cancelable);

    let response = builder.dispatch(command).await?;
    print_json(&response)
}

async fn run_submit(builder: &Builder, args: config::SubmitArgs) -> Result<(), AppError> {
    let method = HttpMethod::try_from(args.method.as_str())
        .map_err(|_| AppError::validation(format!("unsupported method `{}`", args.method)))?;
    if method.is_read() {
        return Err(AppError::validation("submit requires a write method"));
    }
    let body = read_body(args.body, args.body_file.as_deref()).await?;

    builder.build().await?;
    let mut command = builder
        .create_command(method, args.endpoint)?
        .offline(args.offline);
    command = apply_request_args(command, args.request);
    if let Some(body) = body {
        command = command.body(body);
    }
    if let Some(queue_key) = args.queue_key {
        command = command.with_queue_key(queue_key);
    }

    let response = builder.dispatch(command).await?;
    print_json(&response)
}

async fn run_flush(builder: &Builder) -> Result<(), AppError> {
    builder.build().await?;
    let restored = builder.submit_queue().pending().len();
    info!(restored, "Flushing stored submissions");

    while !builder.submit_queue().pending().is_empty() {
        tokio::time::sleep(FLUSH_POLL_INTERVAL).await;
    }

    info!(flushed = restored, "Stored submissions settled");
    Ok(())
}

async fn run_pending(storage: &FileQueueStorage) -> Result<(), AppError> {
    let mut entries = Vec::new();
    for queue_key in storage.queue_keys().await? {
        entries.extend(storage.list(&queue_key).await?);
    }
    print_json(&entries)
}

fn apply_request_args(mut command: Command, request: RequestArgs) -> Command {
    for (name, value) in request.params {
        command = command.param(name, value);
    }
    for (name, value) in request.query {
        command = command.query(name, value);
    }
    for (name, value) in request.headers {
        command = command.header(name, value);
    }
    if let Some(retry) = request.retry {
        command = command.retry(retry);
    }
    command
}

async fn read_body(inline: Option<String>, file: Option<&Path>) -> Result<Option<Value>, AppError> {
    let raw = match (inline, file) {
        (Some(raw), _) => raw,
        (None, Some(path)) => tokio::fs::read_to_string(path).await.map_err(|err| {
            AppError::validation(format!("failed to read {}: {err}", path.display()))
        })?,
        (None, None) => return Ok(None),
    };

    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| AppError::validation(format!("body is not valid JSON: {err}")))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
