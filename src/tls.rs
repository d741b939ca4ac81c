//! TLS configuration utilities
//!
//! Builds the rustls server config (inbound TLS termination) and client
//! config (outbound TLS origination) with the configured protocol versions.

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::config::TlsVersion;
use crate::error::{ForwarderError, Result};

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn protocol_versions(
    versions: &[TlsVersion],
) -> Vec<&'static rustls::SupportedProtocolVersion> {
    versions
        .iter()
        .map(|v| match v {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        })
        .collect()
}

/// Create a server TLS config from certificate and key files
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
    versions: &[TlsVersion],
) -> Result<Arc<ServerConfig>> {
    // Load certificates
    let cert_file = File::open(cert_path)?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .filter_map(|r| r.ok())
        .collect();

    if certs.is_empty() {
        return Err(ForwarderError::Tls(
            "No certificates found in cert file".to_string(),
        ));
    }

    // Load private key
    let key_file = File::open(key_path)?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| ForwarderError::Tls("No private key found".to_string()))?;

    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&protocol_versions(versions))?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // Enable TLS session tickets for faster reconnection.
    // Clients that reconnect skip the full handshake, saving ~1 RTT.
    // Keys are automatically rotated by rustls's TicketSwitcher.
    if let Ok(ticketer) = rustls::crypto::ring::Ticketer::new() {
        config.ticketer = ticketer;
    }

    Ok(Arc::new(config))
}

/// Create a client TLS config with the webpki root store
pub fn build_client_config(versions: &[TlsVersion]) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&protocol_versions(versions))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}
