//! Tracing subscriber setup.

use std::fs::OpenOptions;
use std::sync::Mutex;

use siteagent::config::LogSettings;
use tracing_subscriber::EnvFilter;

/// The filter for `level`, unless `RUST_LOG` says otherwise.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber: standard error, or appending to the
/// configured log file without colors.
pub fn init(settings: &LogSettings) -> Result<(), Box<dyn std::error::Error>> {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(&settings.level));
    match &settings.file {
        None => builder
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| -> Box<dyn std::error::Error> { e })?,
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("Cannot open log file {}: {e}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| -> Box<dyn std::error::Error> { e })?
        }
    }
    Ok(())
}
