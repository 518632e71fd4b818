//! Message router
//!
//! Classifies inbound frames and moves them between connections: directed
//! signal forwarding, all-but-sender broadcast, and departure fan-out. The
//! router is a stateless relay over the registry; no frame outlives the
//! dispatch call that produced it.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::registry::{ClientId, ClientRegistry, PeerHandle};
use crate::server::{ClientFrame, ProtocolResult, ServerFrame, TARGET_OFFLINE_MESSAGE};

/// Routes frames between registered connections
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<ClientRegistry>,
}

impl Router {
    /// Create a router over the given registry
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this router operates on
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Register a new connection and send it its identifier
    ///
    /// Registration queues the `id` envelope before the entry becomes
    /// visible to routing, so the client always sees its own identifier
    /// before any forwarded or broadcast frame. Returns the assigned
    /// identifier and whether the envelope was accepted; a `false` means the
    /// connection is already dead and the caller should go straight to
    /// cleanup. The entry stays registered until [`Router::disconnect`] runs.
    pub async fn connect(&self, handle: PeerHandle) -> (ClientId, bool) {
        self.registry.register(handle).await
    }

    /// Dispatch one raw inbound frame from an active connection
    ///
    /// Malformed input is logged and dropped; it never closes the connection
    /// and never reaches any peer. Unrecognized `type` values are a silent
    /// no-op.
    pub async fn dispatch(
        &self,
        sender_id: &ClientId,
        sender: &PeerHandle,
        raw: &str,
    ) -> ProtocolResult<()> {
        let frame = match ClientFrame::from_json(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed frame from {}: {}", sender_id, e);
                return Ok(());
            }
        };

        match frame {
            ClientFrame::Signal { target, payload } => {
                match self.registry.lookup(&target).await {
                    Some(recipient) => {
                        debug!("Forwarding signal from {} to {}", sender_id, target);
                        let forwarded = ServerFrame::signal(sender_id, payload);
                        if !recipient.send(&forwarded).await? {
                            // Target died between lookup and send. Best-effort
                            // relay: the sender is not told.
                            debug!("Signal for {} dropped, connection gone", target);
                        }
                    }
                    None => {
                        debug!("Signal target {} not found", target);
                        sender.send(&ServerFrame::error(TARGET_OFFLINE_MESSAGE)).await?;
                    }
                }
            }
            ClientFrame::TextMessage { text } => {
                let frame = ServerFrame::text_message(sender_id, text);
                self.fan_out(&frame, Some(sender_id)).await?;
            }
            ClientFrame::Unknown => {
                debug!("Ignoring frame with unrecognized type from {}", sender_id);
            }
        }

        Ok(())
    }

    /// Tear down a connection's registration and announce its departure
    ///
    /// Only the call that actually removes the entry announces; running this
    /// twice for the same connection (duplicate closure events) is harmless.
    pub async fn disconnect(&self, id: &ClientId) -> ProtocolResult<()> {
        if !self.registry.unregister(id).await {
            return Ok(());
        }
        // Snapshot is taken after removal, so the departing peer is excluded
        // without any explicit filtering.
        self.fan_out(&ServerFrame::user_disconnected(id), None).await?;
        Ok(())
    }

    /// Deliver a frame to every registered connection except `exclude`
    ///
    /// Sends are issued concurrently and joined; a failure to reach one
    /// recipient is logged and does not affect the others.
    async fn fan_out(&self, frame: &ServerFrame, exclude: Option<&str>) -> ProtocolResult<()> {
        let message = frame.to_message()?;
        let recipients = self.registry.snapshot().await;

        let sends = recipients
            .into_iter()
            .filter(|(id, _)| exclude != Some(id.as_str()))
            .map(|(id, handle)| {
                let message = message.clone();
                async move {
                    if !handle.send_raw(message).await {
                        debug!("Fan-out delivery to {} failed, connection gone", id);
                    }
                }
            });

        join_all(sends).await;
        Ok(())
    }
}
