use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
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
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "offsite_cache_hit_total",
            Unit::Count,
            "Total number of fast-cache hits."
        );
        describe_counter!(
            "offsite_cache_miss_total",
            Unit::Count,
            "Total number of fast-cache misses, expired entries included."
        );
        describe_counter!(
            "offsite_cache_evict_total",
            Unit::Count,
            "Total number of fast-cache evictions due to capacity."
        );
        describe_counter!(
            "offsite_resolve_total",
            Unit::Count,
            "Resolutions by answering tier and outcome."
        );
        describe_histogram!(
            "offsite_resolve_ms",
            Unit::Milliseconds,
            "End-to-end resolution latency in milliseconds."
        );
        describe_counter!(
            "offsite_watchdog_slow_total",
            Unit::Count,
            "Lookups slower than the watchdog threshold, by tier."
        );
        describe_counter!(
            "offsite_watchdog_evict_total",
            Unit::Count,
            "Watchlist entries evicted to stay within capacity."
        );
        describe_counter!(
            "offsite_offload_enqueued_total",
            Unit::Count,
            "Offload tasks created."
        );
        describe_counter!(
            "offsite_offload_uploaded_total",
            Unit::Count,
            "Offload tasks that completed an upload."
        );
        describe_counter!(
            "offsite_offload_retried_total",
            Unit::Count,
            "Failed upload attempts scheduled for retry."
        );
        describe_counter!(
            "offsite_offload_abandoned_total",
            Unit::Count,
            "Offload tasks abandoned, by error kind."
        );
        describe_counter!(
            "offsite_offload_deferred_total",
            Unit::Count,
            "Due tasks left pending because every upload slot was busy."
        );
        describe_counter!(
            "offsite_offload_local_deleted_total",
            Unit::Count,
            "Local copies removed after a completed upload."
        );
        describe_histogram!(
            "offsite_offload_upload_ms",
            Unit::Milliseconds,
            "Single upload attempt latency in milliseconds."
        );
        describe_histogram!(
            "offsite_offload_tick_ms",
            Unit::Milliseconds,
            "Scheduler tick latency in milliseconds."
        );
        describe_histogram!(
            "offsite_janitor_sweep_ms",
            Unit::Milliseconds,
            "Retention pass latency in milliseconds, by kind."
        );
        describe_counter!(
            "offsite_janitor_errors_total",
            Unit::Count,
            "Retention sub-tasks that failed."
        );
    });
}
