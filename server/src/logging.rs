//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the configured
//! level.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Filter from RUST_LOG if set, otherwise from the configured level.
pub fn filter(config: &LoggingConfig) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    }
}

fn format_layer(config: &LoggingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = fmt::layer()
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => layer.with_ansi(true).boxed(),
        (LogFormat::Pretty, false) => layer.with_ansi(true).without_time().boxed(),
        (LogFormat::Compact, true) => layer.compact().with_ansi(true).boxed(),
        (LogFormat::Compact, false) => layer.compact().with_ansi(true).without_time().boxed(),
        (LogFormat::Json, true) => layer.json().boxed(),
        (LogFormat::Json, false) => layer.json().without_time().boxed(),
    }
}

/// Initialize the global subscriber.
///
/// Fails if a global subscriber is already installed.
///
/// # Example
///
/// ```ignore
/// use rpcchan_server::config::LoggingConfig;
/// use rpcchan_server::logging;
///
/// logging::init(&LoggingConfig::default())?;
/// tracing::info!("server starting");
/// ```
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(format_layer(config).with_filter(filter(config)))
        .try_init()
}
