//! Delivery acknowledgment tracking.
//!
//! Each outbound message gets a record that moves through
//! `pending → sent → delivered`, or ends in `failed` when the server rejects
//! it, it is evicted from the send queue, or no acknowledgment arrives within
//! the timeout. Terminal records never transition again; retrying a failed
//! message is the caller's decision and starts a fresh record. Settled
//! records are forgotten once they are older than the retention window.

use beacon_protocol::{AckState, Frame};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus, Topic};
use crate::error::ConnectivityError;
use crate::message::ClientMessageId;

/// Default time to wait for an acknowledgment.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Default time a terminal record stays queryable.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// Delivery state of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryState {
    /// Whether no further transitions are allowed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::Failed)
    }

    /// Whether `self → next` is a permitted transition.
    #[must_use]
    pub fn can_transition_to(&self, next: DeliveryState) -> bool {
        use DeliveryState::{Delivered, Failed, Pending, Sent};
        matches!(
            (self, next),
            (Pending, Sent | Delivered | Failed) | (Sent, Delivered | Failed)
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sent => "sent",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery record for one outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub client_message_id: ClientMessageId,
    pub state: DeliveryState,
    pub created_at: Instant,
    pub last_transition_at: Instant,
    /// Set when the record failed.
    pub failure: Option<ConnectivityError>,
    /// Whether the caller may retry a failed record.
    pub retryable: bool,
}

/// A published delivery transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryChange {
    pub client_message_id: ClientMessageId,
    /// `None` when the record was created.
    pub previous: Option<DeliveryState>,
    pub current: DeliveryState,
    /// Offered to the caller on failure; retries are never automatic.
    pub retryable: bool,
    pub reason: Option<ConnectivityError>,
}

/// Delivery tracker errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// A non-terminal record already exists for this ID.
    #[error("Message already in flight: {0}")]
    AlreadyTracked(ClientMessageId),

    /// No record exists for this ID.
    #[error("Unknown message: {0}")]
    UnknownMessage(ClientMessageId),

    /// The acknowledgment carried a state this client does not know.
    #[error("Unrecognized acknowledgment state for {0}")]
    UnrecognizedAck(ClientMessageId),

    /// The record cannot move to the requested state.
    #[error("Message {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: ClientMessageId,
        from: DeliveryState,
        to: DeliveryState,
    },
}

/// Delivery tracker.
#[derive(Debug)]
pub struct DeliveryTracker {
    records: DashMap<ClientMessageId, DeliveryRecord>,
    timeout: Duration,
    retention: Duration,
    bus: EventBus,
}

impl DeliveryTracker {
    /// Create a new tracker with the given acknowledgment timeout.
    #[must_use]
    pub fn new(bus: EventBus, timeout: Duration) -> Self {
        Self {
            records: DashMap::new(),
            timeout,
            retention: DEFAULT_RETENTION,
            bus,
        }
    }

    /// Keep terminal records for `retention` after their last transition.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Get the acknowledgment timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start tracking a message handed to the connection manager at `now`.
    ///
    /// A terminal record under the same ID is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if a non-terminal record already exists.
    pub fn track(&self, id: &str, now: Instant) -> Result<(), DeliveryError> {
        let record = DeliveryRecord {
            client_message_id: id.to_string(),
            state: DeliveryState::Pending,
            created_at: now,
            last_transition_at: now,
            failure: None,
            retryable: false,
        };

        match self.records.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().state.is_terminal() {
                    return Err(DeliveryError::AlreadyTracked(id.to_string()));
                }
                occupied.insert(record);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
            }
        }

        debug!(message = %id, "Delivery: tracking");
        self.bus.publish(Event::Delivery(DeliveryChange {
            client_message_id: id.to_string(),
            previous: None,
            current: DeliveryState::Pending,
            retryable: false,
            reason: None,
        }));
        Ok(())
    }

    /// Record that the message was written to an open channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is unknown or no longer pending.
    pub fn mark_sent(&self, id: &str, now: Instant) -> Result<(), DeliveryError> {
        self.transition(id, DeliveryState::Sent, now, None, false)
    }

    /// Apply a server acknowledgment.
    ///
    /// Returns the resulting state.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown IDs, terminal records, and unrecognized
    /// acknowledgment states.
    pub fn acknowledge(
        &self,
        id: &str,
        state: AckState,
        now: Instant,
    ) -> Result<DeliveryState, DeliveryError> {
        match state {
            AckState::Delivered | AckState::Read => {
                self.transition(id, DeliveryState::Delivered, now, None, false)?;
                Ok(DeliveryState::Delivered)
            }
            AckState::Rejected => {
                let reason = ConnectivityError::Protocol("rejected by server".into());
                self.transition(id, DeliveryState::Failed, now, Some(reason), false)?;
                Ok(DeliveryState::Failed)
            }
            AckState::Unrecognized => Err(DeliveryError::UnrecognizedAck(id.to_string())),
        }
    }

    /// Fail a message for a caller-supplied reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is unknown or already terminal.
    pub fn fail(
        &self,
        id: &str,
        reason: ConnectivityError,
        retryable: bool,
        now: Instant,
    ) -> Result<(), DeliveryError> {
        self.transition(id, DeliveryState::Failed, now, Some(reason), retryable)
    }

    /// Fail every non-terminal record created more than `timeout` ago.
    ///
    /// Returns the failed IDs.
    pub fn expire(&self, now: Instant) -> Vec<ClientMessageId> {
        let overdue: Vec<ClientMessageId> = self
            .records
            .iter()
            .filter(|r| {
                !r.state.is_terminal() && now.saturating_duration_since(r.created_at) >= self.timeout
            })
            .map(|r| r.client_message_id.clone())
            .collect();

        let timeout_ms = self.timeout.as_millis() as u64;
        overdue
            .into_iter()
            .filter(|id| {
                let reason = ConnectivityError::DeliveryTimeout {
                    client_message_id: id.clone(),
                    timeout_ms,
                };
                self.transition(id, DeliveryState::Failed, now, Some(reason), true)
                    .is_ok()
            })
            .collect()
    }

    fn transition(
        &self,
        id: &str,
        next: DeliveryState,
        now: Instant,
        reason: Option<ConnectivityError>,
        retryable: bool,
    ) -> Result<(), DeliveryError> {
        let previous = {
            let mut record = self
                .records
                .get_mut(id)
                .ok_or_else(|| DeliveryError::UnknownMessage(id.to_string()))?;

            if !record.state.can_transition_to(next) {
                return Err(DeliveryError::InvalidTransition {
                    id: id.to_string(),
                    from: record.state,
                    to: next,
                });
            }

            let previous = record.state;
            record.state = next;
            record.last_transition_at = now;
            record.failure = reason.clone();
            record.retryable = retryable;
            previous
        };

        if next == DeliveryState::Failed {
            info!(message = %id, from = %previous, retryable, reason = ?reason, "Delivery: failed");
        } else {
            debug!(message = %id, from = %previous, to = %next, "Delivery: transition");
        }

        self.bus.publish(Event::Delivery(DeliveryChange {
            client_message_id: id.to_string(),
            previous: Some(previous),
            current: next,
            retryable,
            reason,
        }));
        Ok(())
    }

    /// Get the record for a message.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<DeliveryRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Get the state of a message.
    #[must_use]
    pub fn state_of(&self, id: &str) -> Option<DeliveryState> {
        self.records.get(id).map(|r| r.state)
    }

    /// Get the number of records held, settled ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get the number of records awaiting a terminal state.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    /// Drop a terminal record. Returns `true` if one was removed.
    pub fn forget(&self, id: &str) -> bool {
        self.records
            .remove_if(id, |_, record| record.state.is_terminal())
            .is_some()
    }

    /// Forget terminal records settled more than the retention window ago.
    ///
    /// Returns the number of records removed.
    pub fn prune(&self, now: Instant) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| {
            !record.state.is_terminal()
                || now.saturating_duration_since(record.last_transition_at) < self.retention
        });
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed, "Delivery: settled records forgotten");
        }
        removed
    }

    /// Follow write receipts and acknowledgments, and expire overdue records.
    pub fn spawn(self: &Arc<Self>, sweep_interval: Duration) -> JoinHandle<()> {
        let mut inbound = self.bus.subscribe(Topic::Inbound);
        let mut outbound = self.bus.subscribe(Topic::Outbound);
        let tracker = Arc::clone(self);

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = outbound.recv() => {
                        let Some(event) = event else { break };
                        if let Event::Outbound(receipt) = event.as_ref() {
                            if let Some(id) = &receipt.client_message_id {
                                if let Err(e) = tracker.mark_sent(id, receipt.written_at) {
                                    debug!(message = %id, error = %e, "Delivery: write receipt ignored");
                                }
                            }
                        }
                    }
                    event = inbound.recv() => {
                        let Some(event) = event else { break };
                        if let Event::Inbound(message) = event.as_ref() {
                            if let Frame::DeliveryAck { client_message_id, state } = &message.frame {
                                if let Err(e) = tracker.acknowledge(client_message_id, *state, message.received_at) {
                                    warn!(message = %client_message_id, ack = ?state, error = %e, "Delivery: acknowledgment dropped");
                                }
                            }
                        }
                    }
                    _ = sweep.tick() => {
                        let now = Instant::now();
                        tracker.expire(now);
                        tracker.prune(now);
                    }
                }
            }
        })
    }
}
