//! Presence tracking for Beacon.
//!
//! The tracker keeps one record per remote user, fed by pushed
//! `user_status_change` frames and by periodic roster polls. The two sources
//! are reconciled by recency: an update is accepted only if it was observed
//! no earlier than the record it would replace.

use beacon_protocol::{Frame, RosterEntry, UserStatus};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bus::{Event, EventBus, Topic};

/// Where a presence observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceSource {
    Push,
    Poll,
}

/// Presence state for a single user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: UserStatus,
    /// Observation time of the update currently reflected by `status`.
    pub last_updated: Instant,
    pub source: PresenceSource,
}

impl PresenceRecord {
    /// Check if this record has not been observed for longer than `max_age`.
    #[must_use]
    pub fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.last_updated) > max_age
    }
}

/// A published change of a user's resolved status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: String,
    /// `None` the first time a user is seen.
    pub previous: Option<UserStatus>,
    pub current: UserStatus,
    pub source: PresenceSource,
}

/// Presence tracker. The only writer of the presence mapping.
#[derive(Debug)]
pub struct PresenceTracker {
    records: DashMap<String, PresenceRecord>,
    bus: EventBus,
}

impl PresenceTracker {
    /// Create a new tracker publishing on `bus`.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self {
            records: DashMap::new(),
            bus,
        }
    }

    /// Apply a pushed status change observed at `observed_at`.
    ///
    /// Returns `true` if the user's resolved status changed.
    pub fn apply_push(&self, user_id: &str, status: UserStatus, observed_at: Instant) -> bool {
        self.apply(user_id, status, observed_at, PresenceSource::Push)
    }

    /// Apply a roster poll whose request was issued at `observed_at`.
    ///
    /// Returns the number of users whose resolved status changed.
    pub fn apply_poll(&self, roster: &[RosterEntry], observed_at: Instant) -> usize {
        let changed = roster
            .iter()
            .filter(|entry| {
                self.apply(
                    &entry.id,
                    entry.online_status,
                    observed_at,
                    PresenceSource::Poll,
                )
            })
            .count();

        debug!(users = roster.len(), changed, "Presence: poll applied");
        changed
    }

    fn apply(
        &self,
        user_id: &str,
        status: UserStatus,
        observed_at: Instant,
        source: PresenceSource,
    ) -> bool {
        let change = match self.records.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if observed_at < record.last_updated {
                    trace!(user = %user_id, ?source, "Presence: older observation ignored");
                    return false;
                }

                let previous = record.status;
                record.status = status;
                record.last_updated = observed_at;
                record.source = source;

                (previous != status).then(|| PresenceChange {
                    user_id: user_id.to_string(),
                    previous: Some(previous),
                    current: status,
                    source,
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PresenceRecord {
                    user_id: user_id.to_string(),
                    status,
                    last_updated: observed_at,
                    source,
                });
                Some(PresenceChange {
                    user_id: user_id.to_string(),
                    previous: None,
                    current: status,
                    source,
                })
            }
        };

        match change {
            Some(change) => {
                debug!(user = %user_id, status = %status, ?source, "Presence: status changed");
                self.bus.publish(Event::Presence(change));
                true
            }
            None => false,
        }
    }

    /// Demote users not observed for longer than `max_age` to offline.
    ///
    /// The record keeps its observation time, so any later genuine update
    /// overrides the demotion. Returns the demoted user IDs.
    pub fn expire_stale(&self, now: Instant, max_age: Duration) -> Vec<String> {
        let mut changes = Vec::new();

        for mut record in self.records.iter_mut() {
            if record.status != UserStatus::Offline && record.is_stale(now, max_age) {
                let previous = record.status;
                record.status = UserStatus::Offline;
                changes.push(PresenceChange {
                    user_id: record.user_id.clone(),
                    previous: Some(previous),
                    current: UserStatus::Offline,
                    source: record.source,
                });
            }
        }

        changes
            .into_iter()
            .map(|change| {
                debug!(user = %change.user_id, "Presence: stale record expired");
                let user_id = change.user_id.clone();
                self.bus.publish(Event::Presence(change));
                user_id
            })
            .collect()
    }

    /// Get the record for a user.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<PresenceRecord> {
        self.records.get(user_id).map(|r| r.clone())
    }

    /// Get the resolved status for a user.
    #[must_use]
    pub fn status_of(&self, user_id: &str) -> Option<UserStatus> {
        self.records.get(user_id).map(|r| r.status)
    }

    /// Get every record, ordered by user ID.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }

    /// Get the number of tracked users.
    #[must_use]
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Check if no users are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Feed pushed presence frames from the inbound topic into the tracker.
    ///
    /// The subscription is taken before this returns, so no frame published
    /// afterwards is missed.
    pub fn spawn_push_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut inbound = self.bus.subscribe(Topic::Inbound);
        let tracker = Arc::clone(self);

        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                if let Event::Inbound(message) = event.as_ref() {
                    if let Frame::UserStatusChange {
                        user_id, status, ..
                    } = &message.frame
                    {
                        tracker.apply_push(user_id, *status, message.received_at);
                    }
                }
            }
        })
    }
}
