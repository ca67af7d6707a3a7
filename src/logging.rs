use std::sync::Once;

use log::LevelFilter;

use crate::errors::{DriverError, Result};

static LOG_ONCE: Once = Once::new();

/// Level taken from `WUBASE_LOG`, then `RUST_LOG`, defaulting to `info`.
pub fn env_level() -> LevelFilter {
    std::env::var("WUBASE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Parse a user supplied level name (`INFO`, `debug`, `Warning`, ...).
///
/// `warning` and `critical` are accepted as aliases of `warn` and `error`.
pub fn parse_level(input: &str) -> Result<LevelFilter> {
    let normalized = input.trim().to_ascii_lowercase();
    let name = match normalized.as_str() {
        "warning" => "warn",
        "critical" | "fatal" => "error",
        other => other,
    };
    name.parse::<LevelFilter>()
        .map_err(|_| DriverError::Config(format!("invalid log level: {input}")))
}

/// Initialize the stderr logger once.
///
/// An explicit level wins; otherwise the level comes from [`env_level`].
pub fn init_logging(level: Option<LevelFilter>) {
    let level = level.unwrap_or_else(env_level);
    LOG_ONCE.call_once(|| {
        env_logger::Builder::new()
            .filter_level(level)
            .format_timestamp_millis()
            .format_module_path(false)
            .format_target(true)
            .init();
        log::debug!("logging at {}", level_to_str(level));
    });
}
