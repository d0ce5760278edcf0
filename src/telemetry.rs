use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{METRIC_CACHE_EVICTED, METRIC_CACHE_NOOP, METRIC_CACHE_WRITE};
use crate::config::{LogFormat, LoggingSettings};
use crate::events::METRIC_SUBSCRIBER_PANIC;
use crate::lock::METRIC_LOCK_POISON_RECOVERED;
use crate::queue::{METRIC_FETCH_DEDUPLICATED, METRIC_FETCH_SUPERSEDED, METRIC_SUBMIT_PENDING};
use crate::transport::METRIC_TRANSPORT_MS;

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
#[error("failed to install tracing subscriber: {0}")]
pub struct TelemetryError(String);

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError(err.to_string()))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_WRITE,
            Unit::Count,
            "Total number of cache entries written."
        );
        describe_counter!(
            METRIC_CACHE_NOOP,
            Unit::Count,
            "Total number of cache writes skipped because the response was unchanged."
        );
        describe_counter!(
            METRIC_CACHE_EVICTED,
            Unit::Count,
            "Total number of cache entries evicted due to space capacity."
        );
        describe_counter!(
            METRIC_FETCH_SUPERSEDED,
            Unit::Count,
            "Total number of fetches replaced by a newer cancelable fetch."
        );
        describe_counter!(
            METRIC_FETCH_DEDUPLICATED,
            Unit::Count,
            "Total number of fetches served by a live or recent execution."
        );
        describe_counter!(
            METRIC_SUBSCRIBER_PANIC,
            Unit::Count,
            "Total number of event subscribers that panicked during delivery."
        );
        describe_counter!(
            METRIC_LOCK_POISON_RECOVERED,
            Unit::Count,
            "Total number of poisoned locks recovered."
        );
        describe_gauge!(
            METRIC_SUBMIT_PENDING,
            Unit::Count,
            "Current number of submit entries waiting or executing."
        );
        describe_histogram!(
            METRIC_TRANSPORT_MS,
            Unit::Milliseconds,
            "Reference HTTP transport latency in milliseconds."
        );
    });
}
