//! Heartbeat driver.
//!
//! While the session is logged in and the page is visible, tells the server
//! every `interval` that the local user is online. Hiding the page pauses the
//! schedule; showing it fires one heartbeat immediately and restarts the
//! schedule from that moment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::api::PresenceApi;
use crate::auth::CredentialProvider;
use crate::config::HeartbeatConfig;
use crate::metrics;

#[derive(Debug)]
struct HeartbeatState {
    last_sent: Mutex<Option<Instant>>,
    active: AtomicBool,
}

/// Periodic presence refresh.
///
/// Dropping the driver stops it.
#[derive(Debug)]
pub struct HeartbeatDriver {
    visible: watch::Sender<bool>,
    state: Arc<HeartbeatState>,
    task: JoinHandle<()>,
}

impl HeartbeatDriver {
    /// Start the driver. When `visible`, the first heartbeat is sent at once.
    pub fn start(
        api: Arc<dyn PresenceApi>,
        credentials: Arc<dyn CredentialProvider>,
        config: HeartbeatConfig,
        visible: bool,
    ) -> Self {
        let (visible_tx, visible_rx) = watch::channel(visible);
        let state = Arc::new(HeartbeatState {
            last_sent: Mutex::new(None),
            active: AtomicBool::new(true),
        });

        let beat = Beat {
            api,
            credentials,
            timeout: config.request_timeout(),
            state: Arc::clone(&state),
        };
        let task = tokio::spawn(run(beat, config.interval(), visible_rx));

        Self {
            visible: visible_tx,
            state,
            task,
        }
    }

    /// Report page visibility.
    pub fn set_visible(&self, visible: bool) {
        self.visible.send_if_modified(|current| {
            if *current == visible {
                return false;
            }
            *current = visible;
            true
        });
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        *self.visible.borrow()
    }

    /// When the last heartbeat was accepted.
    #[must_use]
    pub fn last_sent(&self) -> Option<Instant> {
        *self
            .state
            .last_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Cancel the timer. A request already in flight no longer updates state.
    pub fn stop(&self) {
        if self.state.active.swap(false, Ordering::SeqCst) {
            debug!("Heartbeat stopped");
        }
        self.task.abort();
    }
}

impl Drop for HeartbeatDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Beat {
    api: Arc<dyn PresenceApi>,
    credentials: Arc<dyn CredentialProvider>,
    timeout: Duration,
    state: Arc<HeartbeatState>,
}

impl Beat {
    async fn send(&self) {
        let Some(credential) = self.credentials.credential() else {
            debug!("Heartbeat skipped, no credential");
            return;
        };

        match tokio::time::timeout(self.timeout, self.api.heartbeat(&credential)).await {
            Ok(Ok(())) => {
                if self.state.active.load(Ordering::SeqCst) {
                    *self
                        .state
                        .last_sent
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                    trace!("Heartbeat sent");
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Heartbeat failed");
                metrics::record_heartbeat_failure();
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Heartbeat timed out");
                metrics::record_heartbeat_failure();
            }
        }
    }
}

async fn run(beat: Beat, period: Duration, mut visible: watch::Receiver<bool>) {
    loop {
        if !*visible.borrow_and_update() {
            debug!("Heartbeat paused");
            if visible.wait_for(|v| *v).await.is_err() {
                return;
            }
            debug!("Heartbeat resumed");
        }

        // The first tick completes immediately.
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => beat.send().await,
                changed = visible.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !*visible.borrow_and_update() {
                        break;
                    }
                }
            }
        }
    }
}
