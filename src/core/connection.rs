//! Per-connection forwarding state machine
//!
//! A connection owns one accepted client socket and one dialed remote
//! socket. It drives the optional TLS handshake on each side, the IPv6/IPv4
//! dial race, and the two directional copy loops, reporting lifecycle and
//! data events to the observer. The admission permit is held for the whole
//! lifetime and released exactly once when `run` returns, whichever path the
//! state machine took.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{Notify, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;

use super::forwarder::ForwarderShared;
use super::hooks::{ConnectionId, Direction};
use super::stream::RelayStream;
use super::timeout::TimeoutGuard;
use crate::logger::log;

/// Terminal bookkeeping shared between the copy loops and the timeout
/// watchdog callbacks.
pub(crate) struct LifecycleState {
    con_id: ConnectionId,
    shared: Arc<ForwarderShared>,
    /// The aborted-or-closed flag: whichever terminal path gets here first
    /// emits the single terminal event.
    terminal: AtomicBool,
    aborted: AtomicBool,
    cancel: CancellationToken,
}

impl LifecycleState {
    /// Abort the connection: raise the event (once), then cancel everything
    /// so in-flight operations unwind. The event is raised before any socket
    /// is torn down so observers can attribute the failing side.
    pub(crate) fn abort(&self, from_client: bool, error: &io::Error) {
        if !self.terminal.swap(true, Ordering::SeqCst) {
            self.shared
                .observer
                .connection_aborted(self.con_id, from_client, error);
        }
        self.aborted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn close_completely(&self) {
        if !self.terminal.swap(true, Ordering::SeqCst) {
            self.shared.observer.connection_closed(self.con_id);
        }
    }
}

/// One forwarded connection
pub(crate) struct Connection {
    state: Arc<LifecycleState>,
    shared: Arc<ForwarderShared>,
    /// Loopback addresses used only for the local-random remote host
    bind_addr: Option<std::net::IpAddr>,
    connect_addr: Option<std::net::IpAddr>,
    /// Incremented once per direction on half-close; the loop that reaches
    /// two triggers the final disposal
    shutdown_count: AtomicU32,
    bytes: [AtomicU64; 2],
}

impl Connection {
    pub(crate) fn new(
        con_id: ConnectionId,
        shared: Arc<ForwarderShared>,
        bind_addr: Option<std::net::IpAddr>,
        connect_addr: Option<std::net::IpAddr>,
    ) -> Self {
        let state = Arc::new(LifecycleState {
            con_id,
            shared: Arc::clone(&shared),
            terminal: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        Self {
            state,
            shared,
            bind_addr,
            connect_addr,
            shutdown_count: AtomicU32::new(0),
            bytes: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    /// Run the connection to completion. The admission permit is dropped,
    /// and thereby released, exactly once when this returns.
    pub(crate) async fn run(self, client: TcpStream, permit: OwnedSemaphorePermit) {
        let _permit = permit;
        // Original pre-TLS-wrap addresses of the accepted socket.
        let peer = client.peer_addr().ok();
        let local = client.local_addr().ok();
        self.connect_and_relay(client).await;
        log::debug!(
            con_id = %self.state.con_id,
            peer = ?peer,
            local = ?local,
            up = self.bytes[Direction::ClientToRemote.index()].load(Ordering::Relaxed),
            down = self.bytes[Direction::RemoteToClient.index()].load(Ordering::Relaxed),
            aborted = self.state.aborted.load(Ordering::SeqCst),
            "Connection finished"
        );
    }

    async fn connect_and_relay(&self, client: TcpStream) {
        let config = &self.shared.config;
        let observer = &self.shared.observer;

        // Local TLS handshake (server role) precedes everything else; the
        // remote dial is not attempted when it fails.
        let client = match &self.shared.tls_acceptor {
            Some(acceptor) => {
                // A failed or timed-out handshake must reset the peer; the
                // stream is owned by the handshake future by then, so arm the
                // reset up front and restore graceful close on success.
                let _ = socket2::SockRef::from(&client).set_linger(Some(Duration::ZERO));
                match tokio::time::timeout(config.tls_handshake_timeout, acceptor.accept(client))
                    .await
                {
                    Ok(Ok(tls_stream)) => {
                        let stream = RelayStream::ServerTls(Box::new(tls_stream));
                        let _ = socket2::SockRef::from(stream.tcp()).set_linger(None);
                        if let Some(session) = stream.tls_session() {
                            observer.local_tls_authenticated(self.state.con_id, &session);
                        }
                        stream
                    }
                    Ok(Err(e)) => {
                        self.state.abort(true, &e);
                        return;
                    }
                    Err(_) => {
                        let e = io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timeout");
                        self.state.abort(true, &e);
                        return;
                    }
                }
            }
            None => RelayStream::Plain(client),
        };

        // Remote dial, racing IPv6 before IPv4.
        let (remote, used_ipv6) = match self.dial_remote().await {
            Ok(connected) => connected,
            Err(e) => {
                self.state.abort(false, &e);
                let _ = client.set_abortive_close();
                return;
            }
        };

        match (remote.local_addr(), remote.peer_addr()) {
            (Ok(local), Ok(peer)) => {
                observer.remote_connection_established(self.state.con_id, used_ipv6, local, peer);
            }
            _ => {}
        }

        // Remote TLS handshake (client role).
        let remote = match &self.shared.tls_connector {
            Some((connector, server_name)) => {
                let _ = socket2::SockRef::from(&remote).set_linger(Some(Duration::ZERO));
                match tokio::time::timeout(
                    config.tls_handshake_timeout,
                    connector.connect(server_name.clone(), remote),
                )
                .await
                {
                    Ok(Ok(tls_stream)) => {
                        let stream = RelayStream::ClientTls(Box::new(tls_stream));
                        let _ = socket2::SockRef::from(stream.tcp()).set_linger(None);
                        if let Some(session) = stream.tls_session() {
                            observer.remote_tls_authenticated(self.state.con_id, &session);
                        }
                        stream
                    }
                    Ok(Err(e)) => {
                        self.state.abort(false, &e);
                        let _ = client.set_abortive_close();
                        return;
                    }
                    Err(_) => {
                        let e = io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timeout");
                        self.state.abort(false, &e);
                        let _ = client.set_abortive_close();
                        return;
                    }
                }
            }
            None => RelayStream::Plain(remote),
        };

        self.relay(client, remote).await;
    }

    fn family_allowed(&self, v6: bool) -> bool {
        if let Some(ip) = self.bind_addr {
            if ip.is_ipv6() != v6 {
                return false;
            }
        }
        if let Some(ip) = self.connect_addr {
            if ip.is_ipv6() != v6 {
                return false;
            }
        }
        true
    }

    /// Try IPv6 first, then IPv4, skipping families excluded by the
    /// bind/connect address constraints. The first family to connect wins.
    async fn dial_remote(&self) -> io::Result<(TcpStream, bool)> {
        let mut last_err: Option<io::Error> = None;

        for v6 in [true, false] {
            if !self.family_allowed(v6) {
                continue;
            }
            match self.dial_family(v6).await {
                Ok(stream) => return Ok((stream, v6)),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no usable address family for the remote endpoint",
            )
        }))
    }

    async fn dial_family(&self, v6: bool) -> io::Result<TcpStream> {
        let config = &self.shared.config;

        let connect = async {
            let target: SocketAddr = match self.connect_addr {
                Some(ip) => SocketAddr::new(ip, config.remote_port),
                None => {
                    tokio::net::lookup_host((config.remote_host.as_str(), config.remote_port))
                        .await?
                        .find(|addr| addr.is_ipv6() == v6)
                        .ok_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::AddrNotAvailable,
                                if v6 {
                                    "remote host has no IPv6 address"
                                } else {
                                    "remote host has no IPv4 address"
                                },
                            )
                        })?
                }
            };

            match self.bind_addr {
                Some(bind_ip) => {
                    let socket = if v6 {
                        TcpSocket::new_v6()?
                    } else {
                        TcpSocket::new_v4()?
                    };
                    socket.bind(SocketAddr::new(bind_ip, 0))?;
                    socket.connect(target).await
                }
                None => TcpStream::connect(target).await,
            }
        };

        let stream = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TCP connect timeout"))??;

        if config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        Ok(stream)
    }

    async fn relay(&self, client: RelayStream, remote: RelayStream) {
        let config = &self.shared.config;

        let abort_callback = |from_client: bool| {
            let state = Arc::clone(&self.state);
            Box::new(move |err: io::Error| state.abort(from_client, &err))
        };

        // The receive timeout only detects a vanished peer: as long as the
        // opposite direction can still write, the peer is alive, so every
        // successful write resets the other side's receive window.
        let client_receive = TimeoutGuard::new(config.receive_timeout, "read", abort_callback(true));
        let client_send = TimeoutGuard::new(config.send_timeout, "write", abort_callback(true));
        let remote_receive =
            TimeoutGuard::new(config.receive_timeout, "read", abort_callback(false));
        let remote_send = TimeoutGuard::new(config.send_timeout, "write", abort_callback(false));

        let (client_rd, client_wr) = tokio::io::split(client);
        let (remote_rd, remote_wr) = tokio::io::split(remote);

        let client_to_remote = self.copy_direction(
            Direction::ClientToRemote,
            client_rd,
            remote_wr,
            &client_receive,
            &remote_send,
            &remote_receive,
        );
        let remote_to_client = self.copy_direction(
            Direction::RemoteToClient,
            remote_rd,
            client_wr,
            &remote_receive,
            &client_send,
            &client_receive,
        );

        let ((client_rd, remote_wr), (remote_rd, client_wr)) =
            tokio::join!(client_to_remote, remote_to_client);

        // Both loops have exited; stop the watchdogs before touching the
        // streams so no callback can run mid-teardown.
        client_receive.shutdown().await;
        client_send.shutdown().await;
        remote_receive.shutdown().await;
        remote_send.shutdown().await;

        let client = client_rd.unsplit(client_wr);
        let remote = remote_rd.unsplit(remote_wr);

        if self.state.aborted.load(Ordering::SeqCst) {
            // Reset instead of FIN so anything still pending on the peers
            // unblocks immediately.
            let _ = client.set_abortive_close();
            let _ = remote.set_abortive_close();
        }
    }

    async fn copy_direction(
        &self,
        direction: Direction,
        mut rd: ReadHalf<RelayStream>,
        mut wr: WriteHalf<RelayStream>,
        receive_guard: &TimeoutGuard,
        send_guard: &TimeoutGuard,
        opposite_receive_guard: &TimeoutGuard,
    ) -> (ReadHalf<RelayStream>, WriteHalf<RelayStream>) {
        let controls = &self.shared.controls;
        let observer = &self.shared.observer;
        let state = &self.state;
        let cancel = &state.cancel;
        let waiter = Arc::new(Notify::new());
        let mut buf = vec![0u8; self.shared.config.buffer_size];

        loop {
            let read_result = tokio::select! {
                result = receive_guard.run(rd.read(&mut buf)) => Some(result),
                _ = cancel.cancelled() => None,
            };

            let n = match read_result {
                // Aborted from the other loop or a timeout watchdog; the
                // event was already raised there.
                None => return (rd, wr),
                Some(Err(e)) => {
                    // Honor a pause even on the error path so the other side
                    // is not shut down while this direction is held.
                    controls.wait_if_paused(direction, &waiter, cancel).await;
                    state.abort(direction.from_client(), &e);
                    return (rd, wr);
                }
                Some(Ok(0)) => break,
                Some(Ok(n)) => n,
            };

            controls.wait_if_paused(direction, &waiter, cancel).await;
            if cancel.is_cancelled() {
                return (rd, wr);
            }

            controls.throttle_delay(direction, n, cancel).await;
            if cancel.is_cancelled() {
                return (rd, wr);
            }

            observer.data_received(state.con_id, direction, &buf[..n]);

            let write_result = tokio::select! {
                result = send_guard.run(async {
                    wr.write_all(&buf[..n]).await?;
                    wr.flush().await
                }) => Some(result),
                _ = cancel.cancelled() => None,
            };

            match write_result {
                None => return (rd, wr),
                Some(Err(e)) => {
                    // A failed write usually means the opposite socket's
                    // peer reset the connection; attribute the abort to the
                    // socket the write targeted.
                    state.abort(!direction.from_client(), &e);
                    return (rd, wr);
                }
                Some(Ok(())) => {}
            }

            // Proof the opposite peer link is alive even if that direction
            // is otherwise idle.
            opposite_receive_guard.reset();

            observer.data_forwarded(state.con_id, direction);
            self.bytes[direction.index()].fetch_add(n as u64, Ordering::Relaxed);
        }

        // Clean end-of-stream. A pause set for this direction also holds
        // back the half-close propagation.
        controls.wait_if_paused(direction, &waiter, cancel).await;

        if direction.from_client() {
            observer.local_closed(state.con_id);
        } else {
            observer.remote_closed(state.con_id);
        }

        // Propagate the half-close with a send-shutdown on the opposite
        // socket. An error here usually means the connection was already
        // reset and the other loop will observe it on its next read.
        if let Err(e) = wr.shutdown().await {
            log::debug!(con_id = %state.con_id, direction = %direction, error = %e, "Send-shutdown failed");
        }

        let closed_directions = self.shutdown_count.fetch_add(1, Ordering::SeqCst) + 1;
        if closed_directions == 2 {
            state.close_completely();
        }

        (rd, wr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwarderConfig;
    use crate::core::controls::TrafficControls;
    use crate::core::hooks::{ForwarderObserver, NoopObserver};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::sync::Mutex;

    fn shared_for(config: ForwarderConfig) -> Arc<ForwarderShared> {
        Arc::new(ForwarderShared {
            config,
            controls: TrafficControls::new(),
            observer: Arc::new(NoopObserver),
            tls_acceptor: None,
            tls_connector: None,
        })
    }

    fn test_config() -> ForwarderConfig {
        ForwarderConfig {
            remote_host: "127.0.0.1".to_string(),
            remote_port: 9,
            ..ForwarderConfig::default()
        }
    }

    #[test]
    fn test_family_allowed_unconstrained() {
        let connection = Connection::new(1, shared_for(test_config()), None, None);
        assert!(connection.family_allowed(true));
        assert!(connection.family_allowed(false));
    }

    #[test]
    fn test_family_allowed_v4_constraint() {
        let bind = Some(IpAddr::V4(Ipv4Addr::new(127, 1, 2, 3)));
        let connect = Some(IpAddr::V4(Ipv4Addr::new(127, 4, 5, 6)));
        let connection = Connection::new(1, shared_for(test_config()), bind, connect);
        assert!(!connection.family_allowed(true));
        assert!(connection.family_allowed(false));
    }

    #[test]
    fn test_family_allowed_mixed_constraint_excludes_both() {
        let bind = Some(IpAddr::V6(Ipv6Addr::LOCALHOST));
        let connect = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let connection = Connection::new(1, shared_for(test_config()), bind, connect);
        assert!(!connection.family_allowed(true));
        assert!(!connection.family_allowed(false));
    }

    struct AbortRecorder {
        aborts: Mutex<Vec<(bool, String)>>,
        closed: Mutex<usize>,
    }

    impl ForwarderObserver for AbortRecorder {
        fn connection_aborted(&self, _con_id: ConnectionId, from_client: bool, error: &io::Error) {
            self.aborts
                .lock()
                .unwrap()
                .push((from_client, error.to_string()));
        }

        fn connection_closed(&self, _con_id: ConnectionId) {
            *self.closed.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn test_abort_event_raised_once() {
        let recorder = Arc::new(AbortRecorder {
            aborts: Mutex::new(Vec::new()),
            closed: Mutex::new(0),
        });
        let shared = Arc::new(ForwarderShared {
            config: test_config(),
            controls: TrafficControls::new(),
            observer: recorder.clone() as Arc<dyn ForwarderObserver>,
            tls_acceptor: None,
            tls_connector: None,
        });
        let connection = Connection::new(7, shared, None, None);

        let err1 = io::Error::new(io::ErrorKind::TimedOut, "first");
        let err2 = io::Error::new(io::ErrorKind::BrokenPipe, "second");
        connection.state.abort(true, &err1);
        connection.state.abort(false, &err2);
        connection.state.close_completely();

        let aborts = recorder.aborts.lock().unwrap();
        assert_eq!(aborts.len(), 1);
        assert!(aborts[0].0);
        assert!(aborts[0].1.contains("first"));
        assert_eq!(*recorder.closed.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abort_cancels_token() {
        let connection = Connection::new(1, shared_for(test_config()), None, None);
        assert!(!connection.state.cancel.is_cancelled());
        let err = io::Error::new(io::ErrorKind::Other, "boom");
        connection.state.abort(false, &err);
        assert!(connection.state.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_dial_remote_all_families_fail() {
        // Port 1 on localhost is almost certainly closed; the dial must
        // surface the last connect error rather than hang.
        let mut config = test_config();
        config.remote_host = "127.0.0.1".to_string();
        config.remote_port = 1;
        config.connect_timeout = Duration::from_secs(2);
        let connection = Connection::new(1, shared_for(config), None, None);

        let result = connection.dial_remote().await;
        assert!(result.is_err());
    }
}
