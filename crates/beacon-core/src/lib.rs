//! # beacon-core
//!
//! Shared state and event plumbing for the Beacon connectivity client.
//!
//! This crate provides the transport-independent building blocks:
//!
//! - **Bus** - Typed publish/subscribe hub every component reports through
//! - **Presence** - Reconcile pushed and polled user status
//! - **Typing** - Typing indicators with automatic expiry
//! - **Delivery** - Track outbound messages until acknowledged or failed
//! - **Cache** - Short-lived cache for backend responses
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   inbound    ┌─────────────┐   presence-change
//! │  Connection │─────────────▶│  Presence   │──────────────────┐
//! │   Manager   │──────┐       └─────────────┘                  ▼
//! └─────────────┘      │       ┌─────────────┐   typing-change ┌─────┐
//!        ▲             ├──────▶│   Typing    │────────────────▶│ Bus │──▶ UI
//!        │  outbound   │       └─────────────┘                 └─────┘
//!        │             │       ┌─────────────┐  delivery-change   ▲
//!        └─────────────┴──────▶│  Delivery   │────────────────────┘
//!                              └─────────────┘
//! ```

pub mod bus;
pub mod cache;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod message;
pub mod presence;
pub mod typing;

pub use bus::{Event, EventBus, Subscription, Topic, DEFAULT_TOPIC_CAPACITY};
pub use cache::ResponseCache;
pub use connection::{ConnectionState, ConnectionStateChange};
pub use delivery::{
    DeliveryChange, DeliveryError, DeliveryRecord, DeliveryState, DeliveryTracker,
    DEFAULT_ACK_TIMEOUT, DEFAULT_RETENTION,
};
pub use error::ConnectivityError;
pub use message::{generate_client_message_id, ClientMessageId, InboundMessage, OutboundReceipt};
pub use presence::{PresenceChange, PresenceRecord, PresenceSource, PresenceTracker};
pub use typing::{sweep_interval_for, TypingChange, TypingEntry, TypingManager, DEFAULT_TYPING_TTL};
