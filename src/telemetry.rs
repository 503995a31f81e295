use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging on stderr. `RUST_LOG` takes precedence
/// over the configured level.
pub fn init_telemetry(settings: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if settings.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    if result.is_ok() {
        tracing::debug!(json = settings.json, "Telemetry initialized");
    }
}

/// Generate a correlation ID for linking the steps of one chain invocation
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

fn host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Span wrapping one trigger invocation of a chain.
pub fn chain_span(chain: &str, run_id: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "chain",
        chain = chain,
        run.id = run_id,
        correlation.id = correlation_id,
        host = %host(),
    )
}

/// Span wrapping one step of a chain.
pub fn step_span(task_id: &str) -> tracing::Span {
    tracing::info_span!("step", task.id = task_id)
}
