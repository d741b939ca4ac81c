//! Forwarder: listener, admission control and connection spawning
//!
//! One forwarder owns one listening socket. The accept loop acquires an
//! admission permit before accepting, so at most `max_concurrent_connections`
//! connections are in flight; the permit travels into the connection task and
//! is released when it completes. Pause/throttle state lives here and is
//! shared by every connection.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::controls::TrafficControls;
use super::hooks::{ConnectionId, Direction, ForwarderObserver};
use super::supervised;
use crate::config::{ForwarderConfig, LOCALHOST_RANDOM_HOST};
use crate::error::{ForwarderError, Result};
use crate::logger::log;
use crate::tls;

/// TCP keepalive interval for accepted sockets.
/// Dead peers are detected in ~45s (3 probes × 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// State shared between the forwarder and its connections
pub(crate) struct ForwarderShared {
    pub(crate) config: ForwarderConfig,
    pub(crate) controls: TrafficControls,
    pub(crate) observer: Arc<dyn ForwarderObserver>,
    pub(crate) tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    pub(crate) tls_connector: Option<(
        tokio_rustls::TlsConnector,
        rustls::pki_types::ServerName<'static>,
    )>,
}

/// One listening configuration: accepts clients and forwards each to the
/// configured remote endpoint
pub struct Forwarder {
    shared: Arc<ForwarderShared>,
    admission: Arc<Semaphore>,
    next_con_id: Mutex<u128>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    loopback_rng: Mutex<StdRng>,
}

impl Forwarder {
    /// Bind the listener and prepare the TLS configurations.
    ///
    /// The socket is bound here so that bind errors surface at configuration
    /// time and `local_addr` is known before `run` is called.
    pub fn new(config: ForwarderConfig, observer: Arc<dyn ForwarderObserver>) -> Result<Self> {
        let tls_acceptor = match &config.local_tls_identity {
            Some(identity) => {
                let server_config = tls::load_server_config(
                    &identity.cert_file,
                    &identity.key_file,
                    &config.tls_versions,
                )?;
                Some(tokio_rustls::TlsAcceptor::from(server_config))
            }
            None => None,
        };

        let tls_connector = match &config.remote_tls_server_name {
            Some(name) => {
                let client_config = tls::build_client_config(&config.tls_versions)?;
                let server_name = rustls::pki_types::ServerName::try_from(name.clone())
                    .map_err(|e| {
                        ForwarderError::Tls(format!("invalid TLS server name '{}': {}", name, e))
                    })?;
                Some((
                    tokio_rustls::TlsConnector::from(client_config),
                    server_name,
                ))
            }
            None => None,
        };

        let listener = bind_dual_stack(config.local_port, config.tcp_backlog)?;
        let local_addr = listener.local_addr()?;

        let loopback_rng = match config.localhost_rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let admission = Arc::new(Semaphore::new(config.max_concurrent_connections));

        Ok(Self {
            shared: Arc::new(ForwarderShared {
                config,
                controls: TrafficControls::new(),
                observer,
                tls_acceptor,
                tls_connector,
            }),
            admission,
            next_con_id: Mutex::new(0),
            listener: Mutex::new(Some(listener)),
            local_addr,
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            loopback_rng: Mutex::new(loopback_rng),
        })
    }

    /// The bound listening address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until `stop` is called.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ForwarderError::Other("forwarder is already running".to_string()))?;

        log::forwarder(self.local_addr.port(), "listening");

        loop {
            // Admission first: only accept when a connection slot is free.
            let permit = tokio::select! {
                permit = Arc::clone(&self.admission).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        // Transient accept failures (EMFILE, aborted
                        // handshakes) must not kill the loop.
                        log::error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            };

            if self.shared.config.tcp_nodelay {
                let _ = stream.set_nodelay(true);
            }
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
                .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
            let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

            let con_id = self.next_connection_id();

            let (bind_addr, connect_addr) =
                if self.shared.config.remote_host == LOCALHOST_RANDOM_HOST {
                    let mut rng = self.loopback_rng.lock().unwrap();
                    (
                        Some(IpAddr::V4(random_loopback_addr(&mut rng))),
                        Some(IpAddr::V4(random_loopback_addr(&mut rng))),
                    )
                } else {
                    (None, None)
                };

            let connection = Connection::new(con_id, Arc::clone(&self.shared), bind_addr, connect_addr);

            self.shared.observer.connection_accepted(con_id, peer);
            log::connection(con_id, "accepted");

            // Fire-and-forget, but supervised: a panic in a connection task
            // terminates the process instead of disappearing.
            supervised::spawn(connection.run(stream, permit));
        }

        log::forwarder(self.local_addr.port(), "stopped");
        Ok(())
    }

    /// Stop the accept loop.
    ///
    /// Releases one spare admission unit so an acquire blocked at capacity
    /// unblocks instead of deadlocking the shutdown. Connections that were
    /// already accepted keep running to completion.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.admission.add_permits(1);
    }

    /// Pause or resume one direction across all connections
    pub fn set_paused(&self, direction: Direction, paused: bool) {
        self.shared.controls.set_paused(direction, paused);
    }

    pub fn is_paused(&self, direction: Direction) -> bool {
        self.shared.controls.is_paused(direction)
    }

    /// Enable or disable throttling for one direction, in bytes per second
    pub fn set_throttle(&self, direction: Direction, enabled: bool, bytes_per_second: u64) {
        self.shared
            .controls
            .set_throttle(direction, enabled, bytes_per_second);
    }

    /// Milliseconds since this forwarder started; shared by all connections
    /// for throttle rate math
    pub fn elapsed_millis(&self) -> u64 {
        self.shared.controls.elapsed_millis()
    }

    fn next_connection_id(&self) -> ConnectionId {
        let mut next = self.next_con_id.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }
}

/// Bind a dual-mode listener on `[::]` so both IPv6 and IPv4 clients can
/// connect; fall back to plain IPv4 when IPv6 is unavailable.
fn bind_dual_stack(port: u16, backlog: i32) -> Result<TcpListener> {
    fn attempt(domain: Domain, addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if domain == Domain::IPV6 {
            socket.set_only_v6(false)?;
        }
        // Allow immediate rebind after restart (skip TIME_WAIT)
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        TcpListener::from_std(socket.into())
    }

    let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    match attempt(Domain::IPV6, v6, backlog) {
        Ok(listener) => Ok(listener),
        Err(_) => {
            let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
            attempt(Domain::IPV4, v4, backlog)
                .map_err(|e| ForwarderError::Listen(e.to_string()))
        }
    }
}

/// Draw a random address in 127.0.0.0/8 (last octet 1-254).
///
/// Used for the local-random remote host so rapidly churning connections do
/// not reuse a local/remote endpoint tuple within the TCP reuse interval.
fn random_loopback_addr(rng: &mut StdRng) -> Ipv4Addr {
    Ipv4Addr::new(
        127,
        rng.gen_range(0..=255),
        rng.gen_range(0..=255),
        rng.gen_range(1..=254),
    )
}
