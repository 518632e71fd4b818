//! WebSocket server implementation
//!
//! Listens on a configurable port, upgrades incoming streams to WebSocket,
//! and drives one session task per connection: register, relay frames via
//! the router, and guarantee cleanup on every exit path.

use std::net::SocketAddr;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::registry::{ClientId, ClientRegistry, PeerHandle};
use crate::router::Router;

/// Configuration for the relay server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self { bind, port }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket relay server
pub struct RelayServer {
    config: ServerConfig,
    router: Router,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            router: Router::new(ClientRegistry::new()),
            shutdown_tx,
        }
    }

    /// The router backing this server
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Signaling relay listening on ws://{}", addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener
    ///
    /// Accepts until a shutdown signal arrives, running one session task per
    /// connection. On shutdown the listener is released first, then every
    /// session is awaited: each one gets the shutdown signal, delivers its
    /// Close frame, and runs its cleanup before this returns.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut sessions: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let router = self.router.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            sessions.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, router, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished sessions so the set does not grow unbounded
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        // Stop accepting, then let in-flight sessions settle: every task
        // still needs to flush its Close frame, unregister, and announce its
        // departure before the server can report completion.
        drop(listener);
        if !sessions.is_empty() {
            info!("Waiting for {} active connections to close...", sessions.len());
        }
        while sessions.join_next().await.is_some() {}

        Ok(())
    }
}

/// Handle a single WebSocket connection
///
/// Runs the full lifecycle: upgrade, register + id envelope, receive loop,
/// then cleanup. Cleanup (unregister + departure announcement) sits after the
/// loop in straight-line code so it runs exactly once no matter which path
/// ended the session.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Router,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // The writer task owns the sink; everything else reaches this peer
    // through the queue handle, including the session's own loop.
    let (handle, mut outbound_rx) = PeerHandle::channel();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let (client_id, welcome_delivered) = router.connect(handle.clone()).await;
    info!("Client {} registered from {}", client_id, peer_addr);

    if welcome_delivered {
        receive_loop(&client_id, &handle, &router, &mut ws_receiver, &mut shutdown_rx).await;
    } else {
        warn!("Client {} unreachable before welcome, closing", client_id);
    }

    // Guaranteed cleanup: unregister, then announce to whoever is left.
    if let Err(e) = router.disconnect(&client_id).await {
        error!("Failed to announce departure of {}: {}", client_id, e);
    }
    drop(handle);
    let _ = writer.await;

    info!("Connection from {} closed", peer_addr);
    Ok(())
}

/// Receive frames from one active connection until it closes
///
/// Malformed frames and routing misses are per-message events handled inside
/// the router; only channel-level closure or error ends the loop.
async fn receive_loop(
    client_id: &ClientId,
    handle: &PeerHandle,
    router: &Router,
    ws_receiver: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received frame from {}: {}", client_id, text);
                        if let Err(e) = router.dispatch(client_id, handle, &text).await {
                            error!("Failed to route frame from {}: {}", client_id, e);
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", client_id, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if !handle.send_raw(Message::Pong(data)).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pong messages
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", client_id);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frame, ignore
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", client_id, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", client_id);
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection of {}", client_id);
                let _ = handle.send_raw(Message::Close(None)).await;
                break;
            }
        }
    }
}
