//! Wire protocol definitions
//!
//! Defines the JSON message envelopes exchanged between peers and the relay.
//! Every frame carries a `type` discriminant; the relay never inspects the
//! `payload` of a signal beyond parsing it as JSON, so it is kept as an
//! opaque [`serde_json::Value`] and passed through unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

/// Error message sent back to a sender whose signal named an offline target.
pub const TARGET_OFFLINE_MESSAGE: &str = "Target user is not online.";

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Frames
// ============================================================================

/// Frames sent from a connected peer to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Directed signaling envelope (offer/answer/ICE) for a named peer
    #[serde(rename_all = "camelCase")]
    Signal {
        /// Identifier of the peer this signal is addressed to
        target: String,
        /// Opaque signaling payload, relayed without interpretation
        payload: Value,
    },

    /// Chat text, fanned out to every other connected peer
    TextMessage {
        /// The message body
        text: String,
    },

    /// Any unrecognized `type` value. Accepted and dropped rather than
    /// treated as a protocol violation.
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    /// Parse a client frame from raw JSON text
    pub fn from_json(raw: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Create a Signal frame
    pub fn signal(target: impl Into<String>, payload: Value) -> Self {
        ClientFrame::Signal {
            target: target.into(),
            payload,
        }
    }

    /// Create a TextMessage frame
    pub fn text_message(text: impl Into<String>) -> Self {
        ClientFrame::TextMessage { text: text.into() }
    }
}

// ============================================================================
// Server Frames
// ============================================================================

/// Frames sent from the relay to a connected peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Identifier assignment, sent once right after registration
    #[serde(rename_all = "camelCase")]
    Id {
        /// The identifier the relay will route by for this connection
        user_id: String,
    },

    /// A signal forwarded from another peer, stamped with its origin
    #[serde(rename_all = "camelCase")]
    Signal {
        /// Identifier of the peer that sent the signal
        source: String,
        /// The sender's payload, untouched
        payload: Value,
    },

    /// A broadcast chat message from another peer
    #[serde(rename_all = "camelCase")]
    TextMessage {
        /// Identifier of the peer that sent the message
        user_id: String,
        /// The message body
        text: String,
    },

    /// Routing failure reported back to the offending sender only
    Error {
        /// Human-readable description
        message: String,
    },

    /// Departure notice, fanned out to every remaining peer
    #[serde(rename_all = "camelCase")]
    UserDisconnected {
        /// Identifier of the peer that left
        user_id: String,
    },
}

impl ServerFrame {
    /// Create an Id frame
    pub fn id(user_id: impl Into<String>) -> Self {
        ServerFrame::Id {
            user_id: user_id.into(),
        }
    }

    /// Create a forwarded Signal frame
    pub fn signal(source: impl Into<String>, payload: Value) -> Self {
        ServerFrame::Signal {
            source: source.into(),
            payload,
        }
    }

    /// Create a forwarded TextMessage frame
    pub fn text_message(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        ServerFrame::TextMessage {
            user_id: user_id.into(),
            text: text.into(),
        }
    }

    /// Create an Error frame
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    /// Create a UserDisconnected frame
    pub fn user_disconnected(user_id: impl Into<String>) -> Self {
        ServerFrame::UserDisconnected {
            user_id: user_id.into(),
        }
    }

    /// Serialize the frame to JSON text
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize the frame into a WebSocket text message
    pub fn to_message(&self) -> ProtocolResult<Message> {
        Ok(Message::Text(self.to_json()?))
    }
}

// ============================================================================
// Tests
// ============================================================================
