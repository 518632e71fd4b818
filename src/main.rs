//! Signaling Relay Server
//!
//! WebSocket relay for bootstrapping peer-to-peer connections. Assigns each
//! client an identifier, forwards targeted signal envelopes (WebRTC
//! offer/answer/ICE), and broadcasts text messages to all other peers.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use signal_relay::server::{RelayServer, ServerConfig};

/// Signaling Relay Server
///
/// WebSocket relay for peer-to-peer connection bootstrap
#[derive(Parser, Debug)]
#[command(name = "signal-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8000, env = "PORT")]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Signaling relay v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::new(args.bind, args.port);

    let server = Arc::new(RelayServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
