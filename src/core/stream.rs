//! Unified relay stream
//!
//! A connection leg is either a plain TCP stream or a TLS-upgraded one. The
//! enum keeps the underlying `TcpStream` reachable, which the abort path
//! needs: an abortive close sets SO_LINGER(0) so the drop resets the
//! connection and unblocks whatever the peer had pending.

use socket2::SockRef;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

use super::hooks::TlsSessionInfo;

pub enum RelayStream {
    /// Plain TCP
    Plain(TcpStream),
    /// Inbound leg upgraded with a server-role handshake
    ServerTls(Box<server::TlsStream<TcpStream>>),
    /// Outbound leg upgraded with a client-role handshake
    ClientTls(Box<client::TlsStream<TcpStream>>),
}

fn session_info(
    protocol: Option<rustls::ProtocolVersion>,
    cipher: Option<rustls::SupportedCipherSuite>,
    peer_certificate: Option<Vec<u8>>,
) -> TlsSessionInfo {
    TlsSessionInfo {
        protocol: protocol
            .map(|p| format!("{:?}", p))
            .unwrap_or_else(|| "unknown".to_string()),
        cipher_suite: cipher
            .map(|c| format!("{:?}", c.suite()))
            .unwrap_or_else(|| "unknown".to_string()),
        peer_certificate,
    }
}

impl RelayStream {
    /// The underlying TCP stream
    pub fn tcp(&self) -> &TcpStream {
        match self {
            RelayStream::Plain(s) => s,
            RelayStream::ServerTls(s) => s.get_ref().0,
            RelayStream::ClientTls(s) => s.get_ref().0,
        }
    }

    /// Arrange for the next drop to reset the connection instead of closing
    /// it gracefully (SO_LINGER with a zero timeout).
    pub fn set_abortive_close(&self) -> io::Result<()> {
        SockRef::from(self.tcp()).set_linger(Some(Duration::ZERO))
    }

    /// Details of the negotiated TLS session, if this leg is TLS
    pub fn tls_session(&self) -> Option<TlsSessionInfo> {
        match self {
            RelayStream::Plain(_) => None,
            RelayStream::ServerTls(s) => {
                let (_, conn) = s.get_ref();
                Some(session_info(
                    conn.protocol_version(),
                    conn.negotiated_cipher_suite(),
                    conn.peer_certificates()
                        .and_then(|certs| certs.first())
                        .map(|c| c.as_ref().to_vec()),
                ))
            }
            RelayStream::ClientTls(s) => {
                let (_, conn) = s.get_ref();
                Some(session_info(
                    conn.protocol_version(),
                    conn.negotiated_cipher_suite(),
                    conn.peer_certificates()
                        .and_then(|certs| certs.first())
                        .map(|c| c.as_ref().to_vec()),
                ))
            }
        }
    }
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            RelayStream::ServerTls(s) => Pin::new(s).poll_read(cx, buf),
            RelayStream::ClientTls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RelayStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            RelayStream::ServerTls(s) => Pin::new(s).poll_write(cx, buf),
            RelayStream::ClientTls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Plain(s) => Pin::new(s).poll_flush(cx),
            RelayStream::ServerTls(s) => Pin::new(s).poll_flush(cx),
            RelayStream::ClientTls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            RelayStream::ServerTls(s) => Pin::new(s).poll_shutdown(cx),
            RelayStream::ClientTls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_plain_stream_roundtrip() {
        let (client, server) = tcp_pair().await;
        let mut relay = RelayStream::Plain(server);
        let mut client = client;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        relay.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        relay.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_plain_stream_has_no_tls_session() {
        let (_client, server) = tcp_pair().await;
        let relay = RelayStream::Plain(server);
        assert!(relay.tls_session().is_none());
    }

    #[tokio::test]
    async fn test_abortive_close_resets_peer() {
        let (mut client, server) = tcp_pair().await;
        let relay = RelayStream::Plain(server);
        relay.set_abortive_close().unwrap();
        drop(relay);

        // The peer observes a reset (or an immediate close), not a clean
        // stream that stays open.
        let mut buf = [0u8; 16];
        match client.read(&mut buf).await {
            Ok(0) => {}
            Ok(_) => panic!("no data was ever sent"),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
    }

    #[tokio::test]
    async fn test_shutdown_sends_eof() {
        let (mut client, server) = tcp_pair().await;
        let mut relay = RelayStream::Plain(server);
        relay.shutdown().await.unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_session_info_unknown_fields() {
        let info = session_info(None, None, None);
        assert_eq!(info.protocol, "unknown");
        assert_eq!(info.cipher_suite, "unknown");
        assert!(info.peer_certificate.is_none());
    }
}
