//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{CliArgs, Command, FetchArgs, RequestArgs, SettingsOverrides, SubmitArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "courier";
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CACHE_SPACE_LIMIT: u64 = 500;
const DEFAULT_STORAGE_DIR: &str = ".courier";
const DEFAULT_RETRY: u32 = 0;
const DEFAULT_RETRY_TIME_MS: u64 = 500;
const DEFAULT_DEDUPLICATE_TIME_MS: u64 = 10;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub transport: TransportSettings,
    pub cache: CacheSettings,
    pub queue: QueueSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub base_url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub space_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub storage_directory: PathBuf,
    pub retry: u32,
    pub retry_time: Duration,
    pub deduplicate_time: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("COURIER").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    transport: RawTransportSettings,
    cache: RawCacheSettings,
    queue: RawQueueSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &SettingsOverrides) {
        if let Some(url) = overrides.base_url.as_ref() {
            self.transport.base_url = Some(url.clone());
        }
        if let Some(seconds) = overrides.timeout_seconds {
            self.transport.timeout_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(limit) = overrides.cache_space_limit {
            self.cache.space_limit = Some(limit);
        }
        if let Some(directory) = overrides.storage_directory.as_ref() {
            self.queue.storage_directory = Some(directory.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            transport,
            cache,
            queue,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            transport: build_transport_settings(transport)?,
            cache: build_cache_settings(cache)?,
            queue: build_queue_settings(queue)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_transport_settings(
    transport: RawTransportSettings,
) -> Result<TransportSettings, LoadError> {
    let raw_url = transport
        .base_url
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let base_url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("transport.base_url", format!("invalid URL: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "transport.base_url",
            "scheme must be http or https",
        ));
    }

    let timeout_seconds = non_zero_u32(
        transport.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS),
        "transport.timeout_seconds",
    )?;
    let timeout = Duration::from_secs(timeout_seconds.get().into());

    Ok(TransportSettings { base_url, timeout })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let limit = cache.space_limit.unwrap_or(DEFAULT_CACHE_SPACE_LIMIT);
    let limit = usize::try_from(limit).map_err(|_| {
        LoadError::invalid(
            "cache.space_limit",
            "value exceeds supported range for usize",
        )
    })?;
    let space_limit = NonZeroUsize::new(limit)
        .ok_or_else(|| LoadError::invalid("cache.space_limit", "must be greater than zero"))?;
    Ok(CacheSettings { space_limit })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let storage_directory = queue
        .storage_directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));
    if storage_directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "queue.storage_directory",
            "path must not be empty",
        ));
    }

    let retry_time_ms = queue.retry_time_ms.unwrap_or(DEFAULT_RETRY_TIME_MS);
    let deduplicate_time_ms = queue
        .deduplicate_time_ms
        .unwrap_or(DEFAULT_DEDUPLICATE_TIME_MS);

    Ok(QueueSettings {
        storage_directory,
        retry: queue.retry.unwrap_or(DEFAULT_RETRY),
        retry_time: Duration::from_millis(retry_time_ms),
        deduplicate_time: Duration::from_millis(deduplicate_time_ms),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTransportSettings {
    base_url: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    space_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    storage_directory: Option<PathBuf>,
    retry: Option<u32>,
    retry_time_ms: Option<u64>,
    deduplicate_time_ms: Option<u64>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
