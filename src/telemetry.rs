use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize structured logging from the `logging` config section.
///
/// `RUST_LOG` overrides the configured level when set. The `fatal` level has
/// no tracing equivalent and maps to `error`.
pub fn init_telemetry(logging: &LoggingConfig) -> Result<()> {
    let level = match logging.level.as_str() {
        "fatal" => "error",
        other => other,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fixwright={level},warn")));

    let registry = tracing_subscriber::registry().with(filter);

    match &logging.file_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path}"))?;
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Arc::new(file));
            registry.with(layer).init();
        }
        None if logging.pretty => {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact();
            registry.with(layer).init();
        }
        None => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true);
            registry.with(layer).init();
        }
    }

    tracing::debug!(level, pretty = logging.pretty, "telemetry initialized");
    Ok(())
}

/// Generate a correlation id for linking related operations across logs.
pub fn correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Span carrying the common per-bundle attributes.
pub fn bundle_span(bundle_id: &str, stage: &str, attempt: u32) -> tracing::Span {
    tracing::info_span!(
        "bundle_pipeline",
        bundle.id = bundle_id,
        stage = stage,
        attempt = attempt,
    )
}
