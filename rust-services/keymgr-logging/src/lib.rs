//! Structured logging setup for the key manager and its tools

use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format for the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable lines
    Console,
}

impl LogFormat {
    /// Parse a format name (`json` or `console`), defaulting to console
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Console,
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging in the requested format.
///
/// `RUST_LOG` overrides `default_level` when set. Returns `false` when a
/// global subscriber was already installed, which happens when several
/// tests or tools share one process.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) -> bool {
    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter(default_level))
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init()
            .is_ok(),
        LogFormat::Console => tracing_subscriber::fmt()
            .with_env_filter(env_filter(default_level))
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(service = service_name, format = ?format, "Logging initialized");
    }
    installed
}

/// Initialize JSON logging (for deployed services)
pub fn init_logging(service_name: &str, default_level: &str) -> bool {
    init(service_name, default_level, LogFormat::Json)
}

/// Initialize console logging (for CLI tools and development)
pub fn init_console_logging(service_name: &str, default_level: &str) -> bool {
    init(service_name, default_level, LogFormat::Console)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_name() {
        assert_eq!(LogFormat::from_name("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_name(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::from_name("console"), LogFormat::Console);
        assert_eq!(LogFormat::from_name("anything"), LogFormat::Console);
    }

    #[test]
    fn test_second_init_is_rejected() {
        init_console_logging("keymgr-logging-test", "debug");
        assert!(!init_console_logging("keymgr-logging-test", "debug"));
    }
}
