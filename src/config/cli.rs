use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the courier binary.
#[derive(Debug, Parser)]
#[command(
    name = "courier",
    version,
    about = "Dispatch HTTP commands through deduplicating and ordered queues"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "COURIER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: SettingsOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Read a resource through the fetch queue and print the response.
    Fetch(FetchArgs),
    /// Send a write through the submit queue and wait for it to settle.
    Submit(SubmitArgs),
    /// Replay stored offline submissions in their original order.
    Flush,
    /// List stored offline submissions without sending them.
    Pending,
}

#[derive(Debug, Args, Clone)]
pub struct FetchArgs {
    /// Endpoint template, for example `/users/:id`.
    #[arg(value_name = "ENDPOINT")]
    pub endpoint: String,

    #[command(flatten)]
    pub request: RequestArgs,

    /// Cancel an earlier fetch for the same request key.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub cancelable: bool,
}

#[derive(Debug, Args, Clone)]
pub struct SubmitArgs {
    /// Endpoint template, for example `/orders/:id`.
    #[arg(value_name = "ENDPOINT")]
    pub endpoint: String,

    #[command(flatten)]
    pub request: RequestArgs,

    /// HTTP method (POST|PUT|PATCH|DELETE).
    #[arg(long, default_value = "POST", value_name = "METHOD")]
    pub method: String,

    /// JSON request body, inline.
    #[arg(long, value_name = "JSON", conflicts_with = "body_file")]
    pub body: Option<String>,

    /// JSON request body read from a file.
    #[arg(long = "body-file", value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub body_file: Option<PathBuf>,

    /// Lane to serialize this write in; defaults to the endpoint identity.
    #[arg(long = "queue-key", value_name = "KEY")]
    pub queue_key: Option<String>,

    /// Store the submission so it survives a restart until it settles.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub offline: bool,
}

#[derive(Debug, Args, Clone, Default)]
pub struct RequestArgs {
    /// Route parameter as NAME=VALUE; repeatable.
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_pair)]
    pub params: Vec<(String, String)>,

    /// Query parameter as NAME=VALUE; repeatable.
    #[arg(long = "query", value_name = "NAME=VALUE", value_parser = parse_pair)]
    pub query: Vec<(String, String)>,

    /// Header as NAME=VALUE; repeatable.
    #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_pair)]
    pub headers: Vec<(String, String)>,

    /// Override the number of retries after the first failure.
    #[arg(long, value_name = "COUNT")]
    pub retry: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SettingsOverrides {
    /// Override the base URL requests are resolved against.
    #[arg(long = "base-url", value_name = "URL", global = true)]
    pub base_url: Option<String>,

    /// Override the per-request timeout.
    #[arg(long = "timeout-seconds", value_name = "SECONDS", global = true)]
    pub timeout_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the maximum entries per cache space.
    #[arg(long = "cache-space-limit", value_name = "COUNT", global = true)]
    pub cache_space_limit: Option<u64>,

    /// Override the directory holding offline submissions.
    #[arg(long = "storage-dir", value_name = "PATH", value_hint = ValueHint::DirPath, global = true)]
    pub storage_directory: Option<PathBuf>,
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{raw}`"))?;
    if name.is_empty() {
        return Err(format!("missing name in `{raw}`"));
    }
    Ok((name.to_string(), value.to_string()))
}
