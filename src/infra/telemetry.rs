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
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pressroom_render_total",
            Unit::Count,
            "Completed render runs, labelled by result and failure stage."
        );
        describe_histogram!(
            "pressroom_render_ms",
            Unit::Milliseconds,
            "Wall time of a render run from lock acquisition to terminal status."
        );
        describe_histogram!(
            "pressroom_toolchain_ms",
            Unit::Milliseconds,
            "Wall time of external toolchain and dependency installer invocations."
        );
        describe_histogram!(
            "pressroom_lock_wait_ms",
            Unit::Milliseconds,
            "Time spent waiting for a post's worktree lock."
        );
        describe_histogram!(
            "pressroom_lock_held_ms",
            Unit::Milliseconds,
            "Time a post's worktree lock was held."
        );
        describe_counter!(
            "pressroom_lock_timeout_total",
            Unit::Count,
            "Worktree lock acquisitions that gave up waiting."
        );
        describe_counter!(
            "pressroom_artifact_self_heal_total",
            Unit::Count,
            "Successful revisions demoted to failure because their artifact went missing."
        );
    });
}
