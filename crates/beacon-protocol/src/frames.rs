//! Frame types for the Beacon protocol.
//!
//! Frames are JSON objects carrying a `type` discriminator. Inbound frames the
//! client does not recognize decode to [`Frame::Unknown`] instead of failing.

use serde::{Deserialize, Deserializer, Serialize};

/// Classification of an inbound frame, used to tag messages on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Presence,
    Typing,
    DeliveryAck,
    PingPong,
    Unknown,
}

impl MessageKind {
    /// Stable label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Presence => "presence",
            MessageKind::Typing => "typing",
            MessageKind::DeliveryAck => "delivery_ack",
            MessageKind::PingPong => "ping_pong",
            MessageKind::Unknown => "unknown",
        }
    }
}

/// Online status of a user.
///
/// Unrecognized status strings decode as `Offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Away,
    #[default]
    #[serde(other)]
    Offline,
}

impl UserStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Away => "away",
            UserStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typing signal carried by a `typing` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingAction {
    Start,
    Stop,
}

/// State reported by a `delivery_ack` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckState {
    /// The server accepted the message for delivery.
    Delivered,
    /// A recipient has read the message. Implies delivery.
    Read,
    /// The server refused the message.
    Rejected,
    /// Any state this client does not understand.
    #[serde(other)]
    Unrecognized,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong, echoing the ping timestamp.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// A remote user's presence changed.
    UserStatusChange {
        #[serde(deserialize_with = "string_or_number")]
        user_id: String,
        #[serde(default, deserialize_with = "status_or_offline")]
        status: UserStatus,
        /// Server-side time of the change, in milliseconds since the epoch.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// A user started or stopped typing in a conversation.
    Typing {
        #[serde(deserialize_with = "string_or_number")]
        conversation_id: String,
        #[serde(deserialize_with = "string_or_number")]
        user_id: String,
        action: TypingAction,
    },

    /// Server confirmation for an outbound message.
    DeliveryAck {
        client_message_id: String,
        state: AckState,
    },

    /// Outbound chat message.
    Message {
        client_message_id: String,
        #[serde(deserialize_with = "string_or_number")]
        conversation_id: String,
        content: serde_json::Value,
    },

    /// Any frame type this client does not recognize.
    #[serde(other)]
    Unknown,
}

impl Frame {
    /// Get the bus classification of this frame.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Frame::Ping { .. } | Frame::Pong { .. } => MessageKind::PingPong,
            Frame::UserStatusChange { .. } => MessageKind::Presence,
            Frame::Typing { .. } => MessageKind::Typing,
            Frame::DeliveryAck { .. } => MessageKind::DeliveryAck,
            Frame::Message { .. } | Frame::Unknown => MessageKind::Unknown,
        }
    }

    /// Get the wire name of this frame's type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::UserStatusChange { .. } => "user_status_change",
            Frame::Typing { .. } => "typing",
            Frame::DeliveryAck { .. } => "delivery_ack",
            Frame::Message { .. } => "message",
            Frame::Unknown => "unknown",
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        Frame::Ping { timestamp }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new UserStatusChange frame.
    #[must_use]
    pub fn user_status_change(
        user_id: impl Into<String>,
        status: UserStatus,
        timestamp: Option<u64>,
    ) -> Self {
        Frame::UserStatusChange {
            user_id: user_id.into(),
            status,
            timestamp,
        }
    }

    /// Create a new Typing frame.
    #[must_use]
    pub fn typing(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        action: TypingAction,
    ) -> Self {
        Frame::Typing {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            action,
        }
    }

    /// Create a new DeliveryAck frame.
    #[must_use]
    pub fn delivery_ack(client_message_id: impl Into<String>, state: AckState) -> Self {
        Frame::DeliveryAck {
            client_message_id: client_message_id.into(),
            state,
        }
    }

    /// Create a new outbound Message frame.
    #[must_use]
    pub fn message(
        client_message_id: impl Into<String>,
        conversation_id: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Frame::Message {
            client_message_id: client_message_id.into(),
            conversation_id: conversation_id.into(),
            content,
        }
    }

    /// The client message id carried by this frame, if any.
    #[must_use]
    pub fn client_message_id(&self) -> Option<&str> {
        match self {
            Frame::Message {
                client_message_id, ..
            }
            | Frame::DeliveryAck {
                client_message_id, ..
            } => Some(client_message_id),
            _ => None,
        }
    }
}

/// Accept identifiers sent either as JSON strings or integers.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Signed(n) => n.to_string(),
        Id::Unsigned(n) => n.to_string(),
    })
}

/// Read a status that may be missing, null or unrecognized as `Offline`.
pub(crate) fn status_or_offline<'de, D>(deserializer: D) -> Result<UserStatus, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<UserStatus>::deserialize(deserializer)?.unwrap_or_default())
}
