//! Signaling relay library
//!
//! Core of the relay: the connection registry, the message router, and the
//! WebSocket server that drives them. The binary in `main.rs` is a thin
//! wrapper over [`server::RelayServer`].

pub mod registry;
pub mod router;
pub mod server;
