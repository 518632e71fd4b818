//! WebSocket server module
//!
//! Accepts client connections, upgrades them to WebSocket, and runs one
//! session per connection on top of the registry and router.

mod protocol;
mod websocket;

pub use protocol::*;
pub use websocket::*;
