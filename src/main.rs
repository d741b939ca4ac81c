//! TCP connection forwarder daemon
//!
//! Reads a TOML configuration file defining any number of forwarder
//! instances, starts each of them, and runs until SIGINT/SIGTERM.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Result};
use std::sync::Arc;

use forwarder_rs::config::{self, CliArgs};
use forwarder_rs::core::{supervised, Forwarder, ForwarderObserver, LogObserver};
use forwarder_rs::logger::{self, log};

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default crypto provider for rustls.
    // This must be done before any TLS operations.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = CliArgs::parse_args();
    cli.validate()?;

    let level = cli
        .log_level
        .as_deref()
        .and_then(logger::LogLevel::from_str)
        .or_else(logger::get_log_level_from_args);
    logger::init_logger(level);

    log::info!(config_file = %cli.config_file.display(), "Starting TCP connection forwarder");

    let configs = config::load_config_file(&cli.config_file)?;

    let observer = Arc::new(LogObserver);
    let mut forwarders = Vec::new();
    for entry in configs {
        let local_port = entry.local_port;
        // A broken entry must not prevent the other instances from starting.
        match Forwarder::new(entry, Arc::clone(&observer) as Arc<dyn ForwarderObserver>) {
            Ok(forwarder) => {
                log::info!(
                    local = %forwarder.local_addr(),
                    "Forwarder created"
                );
                forwarders.push(Arc::new(forwarder));
            }
            Err(e) => {
                log::error!(local_port = local_port, error = %e, "Skipping forwarder");
            }
        }
    }

    if forwarders.is_empty() {
        return Err(anyhow!("no usable forwarder entries in the configuration"));
    }
    log::info!(count = forwarders.len(), "Forwarders started");

    let mut tasks = Vec::new();
    for forwarder in &forwarders {
        let forwarder = Arc::clone(forwarder);
        tasks.push(supervised::spawn(async move {
            if let Err(e) = forwarder.run().await {
                log::error!(error = %e, "Forwarder terminated with error");
            }
        }));
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT");
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Shutdown signal received...");
    }

    for forwarder in &forwarders {
        forwarder.stop();
    }
    for task in tasks {
        let _ = task.await;
    }

    log::info!("Shutdown complete");
    Ok(())
}
