use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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
///
/// `RUST_LOG` directives, when set, refine the configured level.
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

/// Register metric descriptions with the installed recorder. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "leadcache_query_hit_total",
            Unit::Count,
            "Reads served from fresh cached data without fetching."
        );
        describe_counter!(
            "leadcache_query_miss_total",
            Unit::Count,
            "Reads that started a new fetch."
        );
        describe_counter!(
            "leadcache_query_dedup_total",
            Unit::Count,
            "Reads that joined a fetch already in flight."
        );
        describe_counter!(
            "leadcache_query_abort_total",
            Unit::Count,
            "Fetches aborted by a superseding fetch or a cancel."
        );
        describe_counter!(
            "leadcache_query_error_total",
            Unit::Count,
            "Fetches that settled with an error."
        );
        describe_counter!(
            "leadcache_gc_evict_total",
            Unit::Count,
            "Entries evicted after their GC time without subscribers."
        );
        describe_counter!(
            "leadcache_prefetch_total",
            Unit::Count,
            "Prefetch requests run by the prefetch queue, by outcome."
        );
        describe_gauge!(
            "leadcache_prefetch_queue_len",
            Unit::Count,
            "Current number of pending prefetch requests."
        );
        describe_histogram!(
            "leadcache_fetch_ms",
            Unit::Milliseconds,
            "Fetcher latency in milliseconds."
        );
        describe_histogram!(
            "leadcache_prefetch_drain_ms",
            Unit::Milliseconds,
            "Prefetch drain latency in milliseconds."
        );
    });
}
