//! Tracing subscriber setup.

use anyhow::{anyhow, Result};
use fanquery_core::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. Logs go to stderr so stdout stays
/// machine-readable. `RUST_LOG` wins over the configured level, and
/// `verbose` raises it to `debug`.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let directive = match std::env::var("RUST_LOG") {
        Ok(value) => value,
        Err(_) if verbose => "debug".to_string(),
        Err(_) => config.level.clone(),
    };
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| anyhow!("Invalid log filter `{directive}`: {e}"))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}
