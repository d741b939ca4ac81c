//! Hook traits for observing the forwarding engine
//!
//! Lifecycle and data events are delivered through an explicit observer
//! trait instead of multicast callbacks. Events are fire-and-forget and may
//! originate from any task; implementations must not block and must not
//! retain the `data_received` buffer beyond the call.

use std::io;
use std::net::SocketAddr;

use crate::logger::log;

/// Unique connection identifier.
///
/// 128 bits wide so that IDs never repeat within the lifetime of a process,
/// no matter how many connections are accepted.
pub type ConnectionId = u128;

/// One direction of a forwarded connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Data flowing from the accepted client towards the remote endpoint
    ClientToRemote,
    /// Data flowing from the remote endpoint back to the client
    RemoteToClient,
}

impl Direction {
    /// The opposite direction
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::ClientToRemote => Direction::RemoteToClient,
            Direction::RemoteToClient => Direction::ClientToRemote,
        }
    }

    /// Whether this direction reads from the client socket
    pub fn from_client(&self) -> bool {
        matches!(self, Direction::ClientToRemote)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Direction::ClientToRemote => 0,
            Direction::RemoteToClient => 1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToRemote => write!(f, "client->remote"),
            Direction::RemoteToClient => write!(f, "remote->client"),
        }
    }
}

/// Details of a negotiated TLS session
#[derive(Debug, Clone)]
pub struct TlsSessionInfo {
    /// Negotiated protocol version (e.g. "TLSv1_3")
    pub protocol: String,
    /// Negotiated cipher suite name
    pub cipher_suite: String,
    /// Peer certificate in DER form, when the peer presented one
    pub peer_certificate: Option<Vec<u8>>,
}

/// Observer for forwarder and connection lifecycle events
///
/// All methods have empty default implementations so observers only override
/// what they consume.
pub trait ForwarderObserver: Send + Sync {
    /// A client connection was accepted and admitted
    fn connection_accepted(&self, _con_id: ConnectionId, _peer: SocketAddr) {}

    /// The inbound TLS handshake (server role) completed
    fn local_tls_authenticated(&self, _con_id: ConnectionId, _session: &TlsSessionInfo) {}

    /// The remote connection was established
    fn remote_connection_established(
        &self,
        _con_id: ConnectionId,
        _used_ipv6: bool,
        _local: SocketAddr,
        _remote: SocketAddr,
    ) {
    }

    /// The outbound TLS handshake (client role) completed
    fn remote_tls_authenticated(&self, _con_id: ConnectionId, _session: &TlsSessionInfo) {}

    /// The client side reached end-of-stream (half-close)
    fn local_closed(&self, _con_id: ConnectionId) {}

    /// The remote side reached end-of-stream (half-close)
    fn remote_closed(&self, _con_id: ConnectionId) {}

    /// Both directions have shut down; the connection is fully closed
    fn connection_closed(&self, _con_id: ConnectionId) {}

    /// The connection was aborted (dial/handshake failure, I/O error or
    /// timeout). `from_client` attributes the failure to the client-side or
    /// remote-side socket. Raised at most once per connection.
    fn connection_aborted(&self, _con_id: ConnectionId, _from_client: bool, _error: &io::Error) {}

    /// A block of data was read. The buffer is only valid for the duration
    /// of the call; it is reused for the next read.
    fn data_received(&self, _con_id: ConnectionId, _direction: Direction, _data: &[u8]) {}

    /// The previously received block was written to the other side
    fn data_forwarded(&self, _con_id: ConnectionId, _direction: Direction) {}
}

/// Observer that ignores every event
pub struct NoopObserver;

impl ForwarderObserver for NoopObserver {}

/// Observer that logs lifecycle events through the tracing stack.
///
/// Data events are logged at trace level only, they are far too hot for
/// anything else.
pub struct LogObserver;

impl ForwarderObserver for LogObserver {
    fn connection_accepted(&self, con_id: ConnectionId, peer: SocketAddr) {
        log::info!(con_id = %con_id, peer = %peer, "Connection accepted");
    }

    fn local_tls_authenticated(&self, con_id: ConnectionId, session: &TlsSessionInfo) {
        log::info!(
            con_id = %con_id,
            protocol = %session.protocol,
            cipher = %session.cipher_suite,
            "Local TLS authenticated"
        );
    }

    fn remote_connection_established(
        &self,
        con_id: ConnectionId,
        used_ipv6: bool,
        local: SocketAddr,
        remote: SocketAddr,
    ) {
        log::info!(
            con_id = %con_id,
            ipv6 = used_ipv6,
            local = %local,
            remote = %remote,
            "Remote connection established"
        );
    }

    fn remote_tls_authenticated(&self, con_id: ConnectionId, session: &TlsSessionInfo) {
        log::info!(
            con_id = %con_id,
            protocol = %session.protocol,
            cipher = %session.cipher_suite,
            has_peer_cert = session.peer_certificate.is_some(),
            "Remote TLS authenticated"
        );
    }

    fn local_closed(&self, con_id: ConnectionId) {
        log::connection(con_id, "local closed");
    }

    fn remote_closed(&self, con_id: ConnectionId) {
        log::connection(con_id, "remote closed");
    }

    fn connection_closed(&self, con_id: ConnectionId) {
        log::connection(con_id, "closed completely");
    }

    fn connection_aborted(&self, con_id: ConnectionId, from_client: bool, error: &io::Error) {
        log::warn!(
            con_id = %con_id,
            from_client = from_client,
            error = %error,
            "Connection aborted"
        );
    }

    fn data_received(&self, con_id: ConnectionId, direction: Direction, data: &[u8]) {
        log::trace!(con_id = %con_id, direction = %direction, bytes = data.len(), "Data received");
    }

    fn data_forwarded(&self, con_id: ConnectionId, direction: Direction) {
        log::trace!(con_id = %con_id, direction = %direction, "Data forwarded");
    }
}
