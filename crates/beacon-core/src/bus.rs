//! Typed publish/subscribe hub.
//!
//! Every component reports what it observed by publishing an [`Event`]. Each
//! [`Topic`] has its own broadcast channel, so a slow consumer of one topic
//! never delays another, and publishing never blocks: a subscriber that falls
//! more than the channel capacity behind skips the oldest events.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::connection::ConnectionStateChange;
use crate::delivery::DeliveryChange;
use crate::message::{InboundMessage, OutboundReceipt};
use crate::presence::PresenceChange;
use crate::typing::TypingChange;

/// Default broadcast capacity per topic.
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Number of topics on the bus.
const TOPIC_COUNT: usize = 6;

/// Bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Connection state transitions.
    ConnectionState,
    /// Parsed inbound frames, in arrival order.
    Inbound,
    /// Write receipts for outbound frames.
    Outbound,
    /// Resolved presence changes.
    PresenceChange,
    /// Typing started/stopped.
    TypingChange,
    /// Delivery state transitions.
    DeliveryChange,
}

impl Topic {
    /// All topics.
    pub const ALL: [Topic; TOPIC_COUNT] = [
        Topic::ConnectionState,
        Topic::Inbound,
        Topic::Outbound,
        Topic::PresenceChange,
        Topic::TypingChange,
        Topic::DeliveryChange,
    ];

    /// Topic name as exposed to UI consumers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ConnectionState => "connection-state",
            Topic::Inbound => "inbound",
            Topic::Outbound => "outbound",
            Topic::PresenceChange => "presence-change",
            Topic::TypingChange => "typing-change",
            Topic::DeliveryChange => "delivery-change",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// An event published on the bus.
#[derive(Debug, Clone)]
pub enum Event {
    ConnectionState(ConnectionStateChange),
    Inbound(InboundMessage),
    Outbound(OutboundReceipt),
    Presence(PresenceChange),
    Typing(TypingChange),
    Delivery(DeliveryChange),
}

impl Event {
    /// The topic this event is published on.
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Event::ConnectionState(_) => Topic::ConnectionState,
            Event::Inbound(_) => Topic::Inbound,
            Event::Outbound(_) => Topic::Outbound,
            Event::Presence(_) => Topic::PresenceChange,
            Event::Typing(_) => Topic::TypingChange,
            Event::Delivery(_) => Topic::DeliveryChange,
        }
    }
}

/// The event bus. Cloning yields another handle to the same topics.
#[derive(Debug, Clone)]
pub struct EventBus {
    senders: Arc<[broadcast::Sender<Arc<Event>>; TOPIC_COUNT]>,
    capacity: usize,
}

impl EventBus {
    /// Create a new bus with the default per-topic capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a new bus with a specific per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let senders = std::array::from_fn(|_| broadcast::channel(capacity).0);
        Self {
            senders: Arc::new(senders),
            capacity,
        }
    }

    /// Publish an event on its topic.
    ///
    /// Returns the number of subscribers that will receive it.
    pub fn publish(&self, event: Event) -> usize {
        let topic = event.topic();
        let count = self.senders[topic.index()]
            .send(Arc::new(event))
            .unwrap_or_default();
        trace!(topic = topic.as_str(), recipients = count, "Published event");
        count
    }

    /// Subscribe to every future event on a topic.
    #[must_use]
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription {
            topic,
            receiver: self.senders[topic.index()].subscribe(),
        }
    }

    /// Get the number of live subscriptions on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.senders[topic.index()].receiver_count()
    }

    /// Get the per-topic capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver for one topic.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    receiver: broadcast::Receiver<Arc<Event>>,
}

impl Subscription {
    /// The subscribed topic.
    #[must_use]
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once every bus handle has been dropped.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = self.topic.as_str(), skipped, "Subscriber lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is ready.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(topic = self.topic.as_str(), skipped, "Subscriber lagged, events skipped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Take every event that is ready.
    pub fn drain(&mut self) -> Vec<Arc<Event>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::typing::TypingChange;

    fn state_change(current: ConnectionState) -> Event {
        Event::ConnectionState(ConnectionStateChange {
            previous: ConnectionState::Disconnected,
            current,
            reason: None,
        })
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::ConnectionState.as_str(), "connection-state");
        assert_eq!(Topic::PresenceChange.as_str(), "presence-change");
        assert_eq!(Topic::TypingChange.as_str(), "typing-change");
        assert_eq!(Topic::DeliveryChange.as_str(), "delivery-change");
        for (i, topic) in Topic::ALL.iter().enumerate() {
            assert_eq!(topic.index(), i);
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(state_change(ConnectionState::Connecting)), 0);
    }

    #[test]
    fn test_publish_reaches_only_its_topic() {
        let bus = EventBus::new();
        let mut states = bus.subscribe(Topic::ConnectionState);
        let mut typing = bus.subscribe(Topic::TypingChange);

        assert_eq!(bus.publish(state_change(ConnectionState::Connecting)), 1);

        assert!(matches!(
            states.try_recv().as_deref(),
            Some(Event::ConnectionState(_))
        ));
        assert!(typing.try_recv().is_none());
    }

    #[test]
    fn test_publish_order_is_preserved() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Topic::TypingChange);

        for i in 0..5 {
            bus.publish(Event::Typing(TypingChange {
                conversation_id: "c1".into(),
                user_id: format!("u{i}"),
                typing: true,
            }));
        }

        let users: Vec<String> = rx
            .drain()
            .iter()
            .filter_map(|e| match e.as_ref() {
                Event::Typing(change) => Some(change.user_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(users, vec!["u0", "u1", "u2", "u3", "u4"]);
    }

    #[test]
    fn test_lagging_subscriber_skips_oldest() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe(Topic::ConnectionState);

        bus.publish(state_change(ConnectionState::Connecting));
        bus.publish(state_change(ConnectionState::Connected));
        bus.publish(state_change(ConnectionState::Reconnecting));

        let events = rx.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1].as_ref(),
            Event::ConnectionState(ConnectionStateChange {
                current: ConnectionState::Reconnecting,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_subscription_recv() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Topic::ConnectionState);
        assert_eq!(bus.subscriber_count(Topic::ConnectionState), 1);

        bus.publish(state_change(ConnectionState::Connected));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic(), Topic::ConnectionState);
    }
}
