//! Failure taxonomy shared by every connectivity component.
//!
//! Components never let these escape as panics or unhandled errors; they are
//! logged and, where a consumer needs to know, carried on bus events.

use thiserror::Error;

/// A categorized connectivity failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectivityError {
    /// Channel drop, failed heartbeat or failed poll. Recovered locally.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Malformed frame or an acknowledgment that matches nothing.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Automatic reconnection gave up. Requires an explicit connect.
    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ExhaustedReconnect {
        /// Number of failed attempts.
        attempts: u32,
    },

    /// No acknowledgment arrived for a message in time.
    #[error("No acknowledgment for {client_message_id} within {timeout_ms} ms")]
    DeliveryTimeout {
        /// The message that timed out.
        client_message_id: String,
        /// The configured acknowledgment timeout.
        timeout_ms: u64,
    },
}

impl ConnectivityError {
    /// Whether the component that raised this recovers without caller action.
    #[must_use]
    pub fn is_recovered_locally(&self) -> bool {
        matches!(
            self,
            ConnectivityError::TransientNetwork(_) | ConnectivityError::Protocol(_)
        )
    }
}
