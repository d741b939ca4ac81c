use std::io;
use thiserror::Error;

/// Unified error type for forwarder setup and configuration.
///
/// Connection-scoped failures (dial errors, handshake errors, timeouts) stay
/// `std::io::Error` all the way to the abort event, so observers see the raw
/// cause; this type covers everything that happens before a connection exists.
#[derive(Error, Debug)]
pub enum ForwarderError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Listener setup error
    #[error("Listen error: {0}")]
    Listen(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ForwarderError>;

impl From<toml::de::Error> for ForwarderError {
    fn from(err: toml::de::Error) -> Self {
        ForwarderError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<rustls::Error> for ForwarderError {
    fn from(err: rustls::Error) -> Self {
        ForwarderError::Tls(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ForwarderError = io_err.into();
        let display = format!("{}", err);
        assert!(display.contains("IO error"));
        assert!(display.contains("file not found"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ForwarderError::Config("invalid port".to_string());
        let display = format!("{}", err);
        assert!(display.contains("Configuration error"));
        assert!(display.contains("invalid port"));
    }

    #[test]
    fn test_tls_error_display() {
        let err = ForwarderError::Tls("certificate expired".to_string());
        let display = format!("{}", err);
        assert!(display.contains("TLS error"));
        assert!(display.contains("certificate expired"));
    }

    #[test]
    fn test_listen_error_display() {
        let err = ForwarderError::Listen("address in use".to_string());
        let display = format!("{}", err);
        assert!(display.contains("Listen error"));
        assert!(display.contains("address in use"));
    }

    #[test]
    fn test_error_debug() {
        let err = ForwarderError::Config("test".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Config"));
        assert!(debug_str.contains("test"));
    }

    #[test]
    fn test_result_type_alias() {
        fn test_fn() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(test_fn().unwrap(), 42);
    }
}
