//! Diagnostics setup.
//!
//! All diagnostics go to standard error; standard output carries flag
//! payloads only.

use tracing::Level;

/// Variable selecting the log level.
pub const LOG_ENV: &str = "PBUNDLE_LOG";

/// Parse a level name, case-insensitively.
pub fn parse_level(value: &str) -> Option<Level> {
    match value.trim().to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the stderr subscriber. Safe to call more than once.
pub fn init() {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| parse_level(&value))
        .unwrap_or(Level::WARN);

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .try_init();
}
