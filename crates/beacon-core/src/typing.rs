//! Typing indicator lifetimes.
//!
//! One entry per (conversation, user) pair. Entries expire `ttl` after their
//! last refresh unless an explicit stop removes them first.

use beacon_protocol::{Frame, TypingAction};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::bus::{Event, EventBus, Topic};

/// Default time a typing signal stays valid.
pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(5);

/// Smallest sweep interval the manager will run with.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

type EntryKey = (String, String);

/// A user currently typing in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub conversation_id: String,
    pub user_id: String,
    pub expires_at: Instant,
}

/// A published typing start or stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingChange {
    pub conversation_id: String,
    pub user_id: String,
    pub typing: bool,
}

/// Clamp a requested sweep interval to at most half the TTL.
#[must_use]
pub fn sweep_interval_for(ttl: Duration, requested: Duration) -> Duration {
    requested.min(ttl / 2).max(MIN_SWEEP_INTERVAL)
}

/// Typing indicator manager.
#[derive(Debug)]
pub struct TypingManager {
    entries: DashMap<EntryKey, Instant>,
    ttl: Duration,
    bus: EventBus,
}

impl TypingManager {
    /// Create a new manager with the given TTL.
    #[must_use]
    pub fn new(bus: EventBus, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            bus,
        }
    }

    /// Get the entry TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record a "start typing" signal received at `now`.
    ///
    /// Returns `true` if the user was not already typing, in which case
    /// "typing started" is published. Otherwise only the expiry is extended.
    pub fn start(&self, conversation_id: &str, user_id: &str, now: Instant) -> bool {
        let expires_at = now + self.ttl;
        let started = match self
            .entries
            .entry((conversation_id.to_string(), user_id.to_string()))
        {
            Entry::Occupied(mut occupied) => {
                occupied.insert(expires_at);
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(expires_at);
                true
            }
        };

        if started {
            debug!(conversation = %conversation_id, user = %user_id, "Typing started");
            self.publish(conversation_id, user_id, true);
        }
        started
    }

    /// Record an explicit "stop typing" signal.
    ///
    /// Returns `true` if an entry was removed, in which case "typing stopped"
    /// is published.
    pub fn stop(&self, conversation_id: &str, user_id: &str) -> bool {
        let removed = self
            .entries
            .remove(&(conversation_id.to_string(), user_id.to_string()))
            .is_some();

        if removed {
            debug!(conversation = %conversation_id, user = %user_id, "Typing stopped");
            self.publish(conversation_id, user_id, false);
        }
        removed
    }

    /// Remove every entry that expired at or before `now`.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<EntryKey> = self
            .entries
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            // A refresh between the scan and the removal keeps the entry.
            if self
                .entries
                .remove_if(&key, |_, expires_at| *expires_at <= now)
                .is_some()
            {
                debug!(conversation = %key.0, user = %key.1, "Typing expired");
                self.publish(&key.0, &key.1, false);
                removed += 1;
            }
        }
        removed
    }

    /// Check if a user is typing in a conversation.
    #[must_use]
    pub fn is_typing(&self, conversation_id: &str, user_id: &str) -> bool {
        self.entries
            .contains_key(&(conversation_id.to_string(), user_id.to_string()))
    }

    /// Get the users typing in a conversation, ordered by user ID.
    #[must_use]
    pub fn typing_in(&self, conversation_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == conversation_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        users.sort();
        users
    }

    /// Get the entry for a pair.
    #[must_use]
    pub fn entry(&self, conversation_id: &str, user_id: &str) -> Option<TypingEntry> {
        self.entries
            .get(&(conversation_id.to_string(), user_id.to_string()))
            .map(|expires_at| TypingEntry {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                expires_at: *expires_at,
            })
    }

    /// Get the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nobody is typing anywhere.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn publish(&self, conversation_id: &str, user_id: &str, typing: bool) {
        self.bus.publish(Event::Typing(TypingChange {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            typing,
        }));
    }

    /// Feed inbound typing frames into the manager and sweep expired entries.
    ///
    /// `sweep_interval` is clamped to at most half the TTL.
    pub fn spawn(self: &Arc<Self>, sweep_interval: Duration) -> JoinHandle<()> {
        let mut inbound = self.bus.subscribe(Topic::Inbound);
        let manager = Arc::clone(self);
        let period = sweep_interval_for(self.ttl, sweep_interval);

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(period);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = inbound.recv() => {
                        let Some(event) = event else { break };
                        if let Event::Inbound(message) = event.as_ref() {
                            if let Frame::Typing { conversation_id, user_id, action } = &message.frame {
                                match action {
                                    TypingAction::Start => {
                                        manager.start(conversation_id, user_id, message.received_at);
                                    }
                                    TypingAction::Stop => {
                                        manager.stop(conversation_id, user_id);
                                    }
                                }
                            }
                        }
                    }
                    _ = sweep.tick() => {
                        manager.sweep(Instant::now());
                    }
                }
            }
        })
    }
}
