//! # beacon-client
//!
//! The runtime half of Beacon: everything that talks to the network.
//!
//! - **Connection** - Actor owning the persistent channel and its reconnect loop
//! - **Heartbeat** - Periodic presence refresh that follows page visibility
//! - **Poller** - Roster polling reconciled into the presence tracker
//! - **Session** - Per-login bundle of components, supervised by [`Client`]
//!
//! ```rust,ignore
//! use beacon_client::{AuthState, Client, Config, HttpPresenceApi};
//! use beacon_transport::{WebSocketConfig, WebSocketTransport};
//!
//! let config = Config::load()?;
//! let transport = WebSocketTransport::new(WebSocketConfig::new(&config.server.ws_url));
//! let api = HttpPresenceApi::new(&config.server)?;
//! let client = Client::new(config, Arc::new(transport), Arc::new(api), AuthState::new());
//! client.login(token).await;
//! ```

pub mod api;
pub mod auth;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod heartbeat;
pub mod metrics;
pub mod poller;
pub mod session;

pub use api::{ApiError, HttpPresenceApi, PresenceApi};
pub use auth::{AuthState, CredentialProvider};
pub use backoff::Backoff;
pub use config::Config;
pub use connection::{ConnectionManager, SendOutcome};
pub use heartbeat::HeartbeatDriver;
pub use poller::{PresencePoller, RosterCache};
pub use session::{Client, ClientError, Session};
