//! TCP connection forwarder
//!
//! Listens on a local port, dials a matching remote endpoint for every
//! accepted client and relays bytes bidirectionally, optionally terminating
//! TLS on the inbound side and originating TLS on the outbound side. The
//! engine enforces admission control over concurrent connections,
//! per-direction idle timeouts, and runtime-adjustable pausing/throttling.
//!
//! Architecture:
//! - `core/`: forwarding engine (forwarder, connection, timeout guard,
//!   observer hooks, supervised tasks)
//! - `config`: CLI arguments and the TOML multi-forwarder configuration
//! - `tls`: rustls server/client config construction
//! - `logger`: tracing setup
//! - `error`: setup/configuration error type

pub mod config;
pub mod core;
pub mod error;
pub mod logger;
pub mod tls;

pub use crate::core::{
    ConnectionId, Direction, Forwarder, ForwarderObserver, LogObserver, NoopObserver,
    TimeoutGuard, TlsSessionInfo,
};
pub use config::{CliArgs, ForwarderConfig, TlsIdentity, TlsVersion, LOCALHOST_RANDOM_HOST};
pub use error::{ForwarderError, Result};
