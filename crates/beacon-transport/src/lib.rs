//! # beacon-transport
//!
//! Client transport abstraction layer for Beacon.
//!
//! This crate provides a unified interface for opening the persistent
//! channel to the server:
//!
//! - **WebSocket** - The production transport
//! - **Memory** - In-process channel pair for tests and embedding
//!
//! ## Transport Abstraction
//!
//! All transports implement the `Transport` and `Connection` traits,
//! allowing the connection manager to be protocol-agnostic.
//!
//! ```rust,ignore
//! use beacon_transport::{Connection, Transport};
//!
//! async fn run(transport: &dyn Transport) {
//!     let mut conn = transport.connect(Some("token")).await?;
//!     while let Ok(Some(frame)) = conn.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryConnection, MemoryPeer, MemoryServer, MemoryTransport};
pub use traits::{Connection, ConnectionId, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
