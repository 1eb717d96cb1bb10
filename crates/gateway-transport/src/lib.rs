//! Transport layer for the agent session gateway.
//!
//! Provides:
//! - Wire protocol for live connections (JSON, tagged by `type`)
//! - WebSocket endpoint with resync
//! - HTTP session API
//! - Origin blocklist applied before any session lookup

pub mod api;
pub mod defense;
pub mod protocol;
pub mod websocket;

pub use api::{ApiError, AppState, router};
pub use defense::StaticBlocklist;
pub use protocol::{ClientMessage, ServerMessage};
pub use websocket::Connection;
