//! Roster poller.
//!
//! Fetches the full user roster every `poll_interval` and reconciles it into
//! the presence tracker. The observation time of a poll is the moment its
//! request was issued, so a push that arrives while the request is in flight
//! is never overwritten by the older roster.

use beacon_core::{PresenceTracker, ResponseCache};
use beacon_protocol::RosterEntry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::api::PresenceApi;
use crate::auth::CredentialProvider;
use crate::config::PresenceConfig;
use crate::metrics;

/// Shared cache of the last roster response.
pub type RosterCache = ResponseCache<Vec<RosterEntry>>;

pub struct PresencePoller {
    api: Arc<dyn PresenceApi>,
    credentials: Arc<dyn CredentialProvider>,
    tracker: Arc<PresenceTracker>,
    cache: Arc<RosterCache>,
    config: PresenceConfig,
    active: Arc<AtomicBool>,
}

impl PresencePoller {
    #[must_use]
    pub fn new(
        api: Arc<dyn PresenceApi>,
        credentials: Arc<dyn CredentialProvider>,
        tracker: Arc<PresenceTracker>,
        cache: Arc<RosterCache>,
        config: PresenceConfig,
        active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            api,
            credentials,
            tracker,
            cache,
            config,
            active,
        }
    }

    /// Run one poll.
    ///
    /// Returns the number of users whose status changed, or `None` if the
    /// poll was skipped or failed. Stale records are expired either way.
    pub async fn poll_once(&self) -> Option<usize> {
        let changed = self.fetch().await;

        if let Some(max_age) = self.config.stale_after() {
            if self.active.load(Ordering::SeqCst) {
                self.tracker.expire_stale(Instant::now(), max_age);
            }
        }

        changed
    }

    async fn fetch(&self) -> Option<usize> {
        let Some(credential) = self.credentials.credential() else {
            debug!("Roster poll skipped, no credential");
            return None;
        };

        let observed_at = Instant::now();
        let timeout = self.config.request_timeout();

        match tokio::time::timeout(timeout, self.api.fetch_roster(&credential)).await {
            Ok(Ok(roster)) => {
                if !self.active.load(Ordering::SeqCst) {
                    debug!("Roster discarded after logout");
                    return None;
                }
                let changed = self.tracker.apply_poll(&roster, observed_at);
                self.cache.put(roster, observed_at);
                Some(changed)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Roster poll failed");
                metrics::record_poll_failure();
                None
            }
            Err(_) => {
                warn!(?timeout, "Roster poll timed out");
                metrics::record_poll_failure();
                None
            }
        }
    }

    /// Poll on a fixed schedule, starting now.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                if !self.active.load(Ordering::SeqCst) {
                    break;
                }
                self.poll_once().await;
            }
            debug!("Roster poller stopped");
        })
    }
}
