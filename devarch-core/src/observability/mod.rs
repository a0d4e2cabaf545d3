//! Observability infrastructure: tracing and metrics.
//!
//! The engine is a library, so it never installs a metrics exporter itself;
//! the embedding process decides where `metrics` and `tracing` output goes.

use crate::config::EngineConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize the global tracing subscriber and describe the engine metrics.
///
/// `default_level` is used when `RUST_LOG` is not set. Returns an error when a
/// global subscriber is already installed.
pub fn init(default_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()?;

    metrics::register_core_metrics();

    tracing::info!("Observability initialized (level: {})", default_level);
    Ok(())
}

/// [`init`] at the configured `log_level`.
pub fn init_from_config(config: &EngineConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init(&config.log_level)
}
