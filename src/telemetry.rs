use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::AppError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), AppError> {
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
        .map_err(|err| {
            AppError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "raffica_cache_hit_total",
            Unit::Count,
            "Total number of requests served from the cache."
        );
        describe_counter!(
            "raffica_cache_miss_total",
            Unit::Count,
            "Total number of requests that required an upstream fetch."
        );
        describe_counter!(
            "raffica_conditional_hit_total",
            Unit::Count,
            "Total number of If-None-Match requests answered with 304."
        );
        describe_counter!(
            "raffica_upstream_bytes_total",
            Unit::Bytes,
            "Total response body bytes read from the upstream origin."
        );
        describe_counter!(
            "raffica_client_bytes_total",
            Unit::Bytes,
            "Total response body bytes sent to clients."
        );
    });
}
