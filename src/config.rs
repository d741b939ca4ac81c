//! Configuration module for the TCP connection forwarder.
//!
//! CLI arguments select a TOML configuration file that defines any number of
//! forwarder instances. A malformed entry is logged and skipped so that the
//! remaining instances still start.

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logger::log;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Parse a duration where "off" (or a zero duration) disables the feature
fn parse_optional_duration(s: &str) -> std::result::Result<Option<Duration>, String> {
    if s.eq_ignore_ascii_case("off") || s.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let d = parse_duration(s)?;
    if d.is_zero() {
        return Ok(None);
    }
    Ok(Some(d))
}

/// Sentinel remote host requesting randomized loopback bind/connect addresses.
///
/// When a lot of short-lived connections target localhost, reusing the same
/// local/remote endpoint tuple in quick succession violates the TCP reuse
/// rules; drawing both addresses from 127.0.0.0/8 makes collisions unlikely.
pub const LOCALHOST_RANDOM_HOST: &str = "[localhost-random]";

/// CLI arguments for the forwarder daemon
///
/// Supports environment variables with FORWARDER_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "TCP connection forwarder")]
pub struct CliArgs {
    /// TOML configuration file defining the forwarder instances
    #[arg(long = "config-file", short = 'c', env = "FORWARDER_CONFIG_FILE")]
    pub config_file: PathBuf,

    /// Log level: trace, debug, info, warn, error (default: info)
    #[arg(long = "log-level", env = "FORWARDER_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!(
                "Configuration file not found: {}",
                self.config_file.display()
            ));
        }
        Ok(())
    }
}

/// Accepted TLS protocol versions, applied to both handshake roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('.', "").as_str() {
            "tls12" | "12" | "tlsv12" => Some(TlsVersion::Tls12),
            "tls13" | "13" | "tlsv13" => Some(TlsVersion::Tls13),
            _ => None,
        }
    }
}

/// Local TLS identity (certificate + private key), enabling server-side TLS
/// for inbound connections
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Validated runtime configuration for one forwarder instance
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// TCP port the forwarder binds and listens on (dual-stack)
    pub local_port: u16,
    /// Dial target host; may be [`LOCALHOST_RANDOM_HOST`]
    pub remote_host: String,
    /// Dial target port
    pub remote_port: u16,
    /// Admission-control bound on concurrently active connections
    pub max_concurrent_connections: usize,
    /// If set, the outbound connection is upgraded to TLS as a client,
    /// verifying this server name
    pub remote_tls_server_name: Option<String>,
    /// If set, inbound connections are upgraded to TLS as a server
    pub local_tls_identity: Option<TlsIdentity>,
    /// Accepted TLS protocol versions for both roles
    pub tls_versions: Vec<TlsVersion>,
    /// Per-direction idle receive timeout; `None` disables it
    pub receive_timeout: Option<Duration>,
    /// Per-direction send timeout; `None` disables it
    pub send_timeout: Option<Duration>,
    /// TCP connect timeout for the remote dial
    pub connect_timeout: Duration,
    /// TLS handshake timeout for both roles
    pub tls_handshake_timeout: Duration,
    /// Copy buffer size per direction
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY on both sockets
    pub tcp_nodelay: bool,
    /// Seed for the loopback address generator (random if unset)
    pub localhost_rng_seed: Option<u64>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            remote_host: String::new(),
            remote_port: 0,
            max_concurrent_connections: 10_000,
            remote_tls_server_name: None,
            local_tls_identity: None,
            tls_versions: vec![TlsVersion::Tls12, TlsVersion::Tls13],
            receive_timeout: Some(Duration::from_secs(600)),
            send_timeout: Some(Duration::from_secs(120)),
            connect_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(10),
            buffer_size: 64 * 1024,
            tcp_backlog: 1000,
            tcp_nodelay: true,
            localhost_rng_seed: None,
        }
    }
}

/// Raw TOML shape of one `[[forwarders]]` entry
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ForwarderEntry {
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    max_concurrent_connections: Option<usize>,
    remote_tls_server_name: Option<String>,
    local_tls_cert_file: Option<PathBuf>,
    local_tls_key_file: Option<PathBuf>,
    tls_versions: Option<Vec<String>>,
    receive_timeout: Option<String>,
    send_timeout: Option<String>,
    connect_timeout: Option<String>,
    tls_handshake_timeout: Option<String>,
    buffer_size: Option<usize>,
    tcp_backlog: Option<i32>,
    tcp_nodelay: Option<bool>,
    localhost_rng_seed: Option<u64>,
}

impl ForwarderEntry {
    fn into_config(self) -> Result<ForwarderConfig> {
        let defaults = ForwarderConfig::default();

        if self.remote_host.is_empty() {
            return Err(anyhow!("remote_host must not be empty"));
        }

        let local_tls_identity = match (self.local_tls_cert_file, self.local_tls_key_file) {
            (Some(cert_file), Some(key_file)) => {
                if !cert_file.exists() {
                    return Err(anyhow!(
                        "TLS certificate file not found: {}",
                        cert_file.display()
                    ));
                }
                if !key_file.exists() {
                    return Err(anyhow!(
                        "TLS private key file not found: {}",
                        key_file.display()
                    ));
                }
                Some(TlsIdentity {
                    cert_file,
                    key_file,
                })
            }
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "local_tls_cert_file and local_tls_key_file must be set together"
                ));
            }
        };

        let tls_versions = match self.tls_versions {
            Some(names) => {
                let mut versions = Vec::new();
                for name in &names {
                    let version = TlsVersion::from_str(name)
                        .ok_or_else(|| anyhow!("Unknown TLS version '{}'", name))?;
                    if !versions.contains(&version) {
                        versions.push(version);
                    }
                }
                if versions.is_empty() {
                    return Err(anyhow!("tls_versions must not be empty"));
                }
                versions
            }
            None => defaults.tls_versions,
        };

        let receive_timeout = match self.receive_timeout {
            Some(s) => parse_optional_duration(&s).map_err(|e| anyhow!(e))?,
            None => defaults.receive_timeout,
        };
        let send_timeout = match self.send_timeout {
            Some(s) => parse_optional_duration(&s).map_err(|e| anyhow!(e))?,
            None => defaults.send_timeout,
        };
        let connect_timeout = match self.connect_timeout {
            Some(s) => parse_duration(&s).map_err(|e| anyhow!(e))?,
            None => defaults.connect_timeout,
        };
        let tls_handshake_timeout = match self.tls_handshake_timeout {
            Some(s) => parse_duration(&s).map_err(|e| anyhow!(e))?,
            None => defaults.tls_handshake_timeout,
        };

        let buffer_size = self.buffer_size.unwrap_or(defaults.buffer_size);
        if buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }

        let max_concurrent_connections = self
            .max_concurrent_connections
            .unwrap_or(defaults.max_concurrent_connections);
        if max_concurrent_connections == 0 {
            return Err(anyhow!("max_concurrent_connections must be greater than 0"));
        }

        Ok(ForwarderConfig {
            local_port: self.local_port,
            remote_host: self.remote_host,
            remote_port: self.remote_port,
            max_concurrent_connections,
            remote_tls_server_name: self.remote_tls_server_name,
            local_tls_identity,
            tls_versions,
            receive_timeout,
            send_timeout,
            connect_timeout,
            tls_handshake_timeout,
            buffer_size,
            tcp_backlog: self.tcp_backlog.unwrap_or(defaults.tcp_backlog),
            tcp_nodelay: self.tcp_nodelay.unwrap_or(defaults.tcp_nodelay),
            localhost_rng_seed: self.localhost_rng_seed,
        })
    }
}

/// Parse the TOML configuration text into forwarder configs.
///
/// Entry-level errors are logged and the entry is skipped; only a file that
/// cannot be parsed at all is an error.
pub fn parse_config(content: &str) -> crate::error::Result<Vec<ForwarderConfig>> {
    let value: toml::Value = toml::from_str(content)?;

    let entries = match value.get("forwarders") {
        Some(toml::Value::Array(entries)) => entries.clone(),
        Some(_) => {
            return Err(crate::error::ForwarderError::Config(
                "'forwarders' must be an array of tables".to_string(),
            ));
        }
        None => Vec::new(),
    };

    let mut configs = Vec::new();
    for (index, entry) in entries.into_iter().enumerate() {
        let parsed = ForwarderEntry::deserialize(entry)
            .map_err(|e| anyhow!(e))
            .and_then(ForwarderEntry::into_config);
        match parsed {
            Ok(config) => configs.push(config),
            Err(e) => {
                log::error!(entry = index, error = %e, "Skipping invalid forwarder entry");
            }
        }
    }

    Ok(configs)
}

/// Load and parse the configuration file
pub fn load_config_file(path: &Path) -> crate::error::Result<Vec<ForwarderConfig>> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}
