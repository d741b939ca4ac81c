//! Core forwarding engine
//!
//! This module contains the forwarding functionality:
//! - Admission-controlled accept loop (`Forwarder`)
//! - Per-connection state machine and relay loops (`Connection`)
//! - Idle-timeout enforcement (`TimeoutGuard`)
//! - Observer hook traits for lifecycle/data events
//! - Supervised fire-and-forget task spawning

mod connection;
mod controls;
mod forwarder;
pub mod hooks;
mod stream;
pub mod supervised;
mod timeout;

pub use forwarder::Forwarder;
pub use hooks::{
    ConnectionId, Direction, ForwarderObserver, LogObserver, NoopObserver, TlsSessionInfo,
};
pub use timeout::{AbortCallback, TimeoutGuard};
