//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon connectivity core.
//!
//! This crate defines the JSON frames exchanged over the persistent channel
//! and the roster format returned by the users-listing endpoint.
//!
//! ## Frame Types
//!
//! - `ping` / `pong` - Keepalive
//! - `user_status_change` - Pushed presence updates
//! - `typing` - Typing start/stop signals
//! - `delivery_ack` - Acknowledgments for outbound messages
//! - `message` - Outbound chat messages
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, Frame, MessageKind};
//!
//! let frame = codec::decode(r#"{"type":"ping","timestamp":1}"#).unwrap();
//! assert_eq!(frame.kind(), MessageKind::PingPong);
//!
//! let encoded = codec::encode(&Frame::pong(Some(1))).unwrap();
//! assert_eq!(encoded, r#"{"type":"pong","timestamp":1}"#);
//! ```

pub mod codec;
pub mod frames;
pub mod roster;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{AckState, Frame, MessageKind, TypingAction, UserStatus};
pub use roster::{parse_roster, RosterEntry};
