use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a log level from a string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Resolve the log level from `--log-level` or the `[log]` section of the
/// configuration file, CLI taking precedence.
pub fn get_log_level_from_args() -> Option<LogLevel> {
    let args: Vec<String> = std::env::args().collect();

    let log_level_from_cli = args
        .iter()
        .position(|a| a == "--log-level")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| LogLevel::from_str(s));

    if log_level_from_cli.is_some() {
        return log_level_from_cli;
    }

    args.iter()
        .position(|a| a == "--config-file" || a == "-c")
        .and_then(|i| args.get(i + 1))
        .and_then(|config_path| {
            std::fs::read_to_string(config_path).ok().and_then(|content| {
                toml::from_str::<toml::Value>(&content)
                    .ok()
                    .and_then(|v| v.get("log")?.get("level")?.as_str().map(|s| s.to_string()))
                    .and_then(|s| LogLevel::from_str(&s))
            })
        })
}

pub fn init_logger(log_level: Option<LogLevel>) {
    let filter = if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        let level = log_level.unwrap_or_default();
        EnvFilter::new(format!("forwarder_rs={}", level.as_str()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, trace, warn};

    /// Log a connection lifecycle event
    pub fn connection(con_id: u128, event: &str) {
        info!(con_id = %con_id, event = event, "Connection");
    }

    /// Log a forwarder lifecycle event
    pub fn forwarder(local_port: u16, event: &str) {
        info!(local_port = local_port, event = event, "Forwarder");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_str("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("Warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("bogus"), None);
    }

    #[test]
    fn test_log_level_roundtrip() {
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(LogLevel::from_str(level.as_str()), Some(level));
        }
    }

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }
}
