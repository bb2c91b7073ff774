//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::error::{AppResult, DaqError};

/// Log output layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Build the filter: `RUST_LOG` when set, otherwise `level` for this crate.
pub fn filter(level: &str) -> AppResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(format!("warn,ivy_daq={}", level))
        .map_err(|e| DaqError::Configuration(format!("Invalid log level '{}': {}", level, e)))
}

/// Install the global subscriber.
///
/// Fails if the level cannot be parsed or a subscriber is already installed.
pub fn init(level: &str, format: LogFormat) -> AppResult<()> {
    let filter = filter(level)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| DaqError::Configuration(format!("Logging already initialised: {}", e)))
}
