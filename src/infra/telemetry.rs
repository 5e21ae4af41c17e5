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
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    // stdout carries the table; logs go to stderr.
    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
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

pub(crate) fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tailview_events_received_total",
            Unit::Count,
            "Total number of live events received from subscriptions."
        );
        describe_counter!(
            "tailview_flush_total",
            Unit::Count,
            "Total number of non-empty flushes applied to the live view."
        );
        describe_histogram!(
            "tailview_flush_ms",
            Unit::Milliseconds,
            "Live view flush latency in milliseconds."
        );
        describe_gauge!(
            "tailview_pending_events",
            Unit::Count,
            "Current number of live events waiting for the next flush."
        );
        describe_counter!(
            "tailview_reconnect_total",
            Unit::Count,
            "Total number of subscription reconnect attempts."
        );
        describe_counter!(
            "tailview_subscription_errors_total",
            Unit::Count,
            "Total number of protocol or transport errors seen by subscriptions."
        );
        describe_counter!(
            "tailview_bulk_fetch_pages_total",
            Unit::Count,
            "Total number of list pages fetched over HTTP."
        );
    });
}
