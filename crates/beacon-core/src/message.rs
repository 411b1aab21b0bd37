//! Messages carried on the inbound and outbound bus topics.

use beacon_protocol::{Frame, MessageKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Client-generated identifier correlating an outbound message with its acks.
pub type ClientMessageId = String;

/// Atomic counter for ensuring unique IDs even within the same millisecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique client message ID.
#[must_use]
pub fn generate_client_message_id() -> ClientMessageId {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("msg_{millis:x}_{counter:x}")
}

/// A parsed inbound frame, tagged with its kind.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Arrival order within one connection manager, starting at 1.
    pub sequence: u64,
    pub kind: MessageKind,
    pub frame: Frame,
    pub received_at: Instant,
}

impl InboundMessage {
    /// Wrap a frame received now.
    #[must_use]
    pub fn new(sequence: u64, frame: Frame) -> Self {
        Self {
            sequence,
            kind: frame.kind(),
            frame,
            received_at: Instant::now(),
        }
    }
}

/// Confirmation that a queued frame was written to an open channel.
#[derive(Debug, Clone)]
pub struct OutboundReceipt {
    pub client_message_id: Option<ClientMessageId>,
    pub frame_type: &'static str,
    pub written_at: Instant,
}

impl OutboundReceipt {
    /// Receipt for a frame written now.
    #[must_use]
    pub fn for_frame(frame: &Frame) -> Self {
        Self {
            client_message_id: frame.client_message_id().map(str::to_owned),
            frame_type: frame.type_name(),
            written_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_protocol::UserStatus;

    #[test]
    fn test_unique_client_message_ids() {
        let id1 = generate_client_message_id();
        let id2 = generate_client_message_id();
        assert_ne!(id1, id2);
        assert!(id1.starts_with("msg_"));
    }

    #[test]
    fn test_inbound_message_kind() {
        let msg = InboundMessage::new(1, Frame::user_status_change("u1", UserStatus::Online, None));
        assert_eq!(msg.kind, MessageKind::Presence);
        assert_eq!(msg.sequence, 1);
    }

    #[test]
    fn test_receipt_carries_message_id() {
        let receipt = OutboundReceipt::for_frame(&Frame::message(
            "msg_1",
            "c1",
            serde_json::Value::Null,
        ));
        assert_eq!(receipt.client_message_id.as_deref(), Some("msg_1"));
        assert_eq!(receipt.frame_type, "message");

        let receipt = OutboundReceipt::for_frame(&Frame::ping(None));
        assert!(receipt.client_message_id.is_none());
    }
}
