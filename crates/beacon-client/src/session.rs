//! Logged-in session and the client supervisor.
//!
//! A [`Session`] bundles every per-login component: connection manager,
//! presence/typing/delivery trackers and their background tasks, heartbeat
//! driver, roster poller and roster cache. [`Client`] owns the event bus,
//! watches [`AuthState`], and starts or tears down the session as the user
//! logs in and out.

use beacon_core::{
    generate_client_message_id, ClientMessageId, ConnectionState, ConnectivityError,
    DeliveryError, DeliveryRecord, DeliveryState, DeliveryTracker, Event, EventBus,
    PresenceRecord, PresenceTracker, Subscription, Topic, TypingManager,
};
use beacon_protocol::{Frame, ProtocolError, RosterEntry};
use beacon_transport::Transport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::PresenceApi;
use crate::auth::{AuthState, CredentialProvider};
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::heartbeat::HeartbeatDriver;
use crate::poller::{PresencePoller, RosterCache};

/// How long shutdown waits for the channel to close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames of sent messages, by ID, kept for [`Session::resend`].
type Outbox = Arc<Mutex<HashMap<ClientMessageId, Frame>>>;

/// Errors returned by the session API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No session is running.
    #[error("Not logged in")]
    NotLoggedIn,

    /// The message is not in a state that allows a retry.
    #[error("Message {0} cannot be retried")]
    NotRetryable(ClientMessageId),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Components that live from login to logout.
pub struct Session {
    connection: ConnectionManager,
    connection_task: Option<JoinHandle<()>>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingManager>,
    delivery: Arc<DeliveryTracker>,
    heartbeat: HeartbeatDriver,
    roster: Arc<RosterCache>,
    /// Held across track and enqueue so a resend never races the
    /// withdrawal of the failed copy.
    outbox: Outbox,
    active: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Start every session component. The channel stays closed until
    /// [`connect`](Self::connect).
    pub fn start(
        config: &Config,
        bus: EventBus,
        transport: Arc<dyn Transport>,
        api: Arc<dyn PresenceApi>,
        credentials: Arc<dyn CredentialProvider>,
        visible: bool,
    ) -> Self {
        let active = Arc::new(AtomicBool::new(true));

        // Listeners subscribe before the channel can deliver anything.
        let presence = Arc::new(PresenceTracker::new(bus.clone()));
        let typing = Arc::new(TypingManager::new(bus.clone(), config.typing.ttl()));
        let delivery = Arc::new(
            DeliveryTracker::new(bus.clone(), config.delivery.ack_timeout())
                .with_retention(config.delivery.retention()),
        );
        let roster = Arc::new(RosterCache::new(config.presence.cache_ttl()));

        let mut tasks = vec![
            presence.spawn_push_listener(),
            typing.spawn(config.typing.sweep_interval()),
            delivery.spawn(config.delivery.sweep_interval()),
        ];

        let delivery_changes = bus.subscribe(Topic::DeliveryChange);
        let (connection, connection_task) = ConnectionManager::spawn(
            transport,
            Arc::clone(&credentials),
            config.connection.clone(),
            bus,
        );

        let outbox = Outbox::default();
        tasks.push(follow_deliveries(
            delivery_changes,
            connection.clone(),
            Arc::clone(&delivery),
            Arc::clone(&outbox),
            config.delivery.sweep_interval(),
        ));

        let heartbeat = HeartbeatDriver::start(
            Arc::clone(&api),
            Arc::clone(&credentials),
            config.heartbeat.clone(),
            visible,
        );

        tasks.push(
            PresencePoller::new(
                api,
                credentials,
                Arc::clone(&presence),
                Arc::clone(&roster),
                config.presence.clone(),
                Arc::clone(&active),
            )
            .spawn(),
        );

        info!("Session started");

        Self {
            connection,
            connection_task: Some(connection_task),
            presence,
            typing,
            delivery,
            heartbeat,
            roster,
            outbox,
            active,
            tasks,
        }
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    #[must_use]
    pub fn typing(&self) -> &TypingManager {
        &self.typing
    }

    #[must_use]
    pub fn delivery(&self) -> &DeliveryTracker {
        &self.delivery
    }

    /// Roster from the last successful poll, while fresh.
    #[must_use]
    pub fn roster(&self) -> Option<Vec<RosterEntry>> {
        self.roster.get(Instant::now())
    }

    pub fn invalidate_roster(&self) {
        self.roster.invalidate();
    }

    pub fn set_visible(&self, visible: bool) {
        self.heartbeat.set_visible(visible);
    }

    #[must_use]
    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.heartbeat.last_sent()
    }

    /// Send a chat message and start tracking its delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded.
    pub fn send_message(
        &self,
        conversation_id: &str,
        content: serde_json::Value,
    ) -> Result<ClientMessageId, ClientError> {
        let id = generate_client_message_id();
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        self.submit(&mut outbox, &id, Frame::message(&id, conversation_id, content))?;
        Ok(id)
    }

    /// Send a failed message again under the same ID.
    ///
    /// # Errors
    ///
    /// Returns an error unless the message failed and is marked retryable.
    pub fn resend(&self, id: &str) -> Result<(), ClientError> {
        let record = self
            .delivery
            .get(id)
            .ok_or_else(|| DeliveryError::UnknownMessage(id.to_string()))?;
        if record.state != DeliveryState::Failed || !record.retryable {
            return Err(ClientError::NotRetryable(id.to_string()));
        }

        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let frame = outbox
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::NotRetryable(id.to_string()))?;

        // The failed copy may still be queued if the failure is very recent.
        self.connection.cancel(id);
        info!(message = %id, "Resending message");
        self.submit(&mut outbox, id, frame)
    }

    fn submit(
        &self,
        outbox: &mut HashMap<ClientMessageId, Frame>,
        id: &str,
        frame: Frame,
    ) -> Result<(), ClientError> {
        let now = Instant::now();
        self.delivery.track(id, now)?;

        let outcome = match self.connection.send(frame.clone()) {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = ConnectivityError::Protocol(e.to_string());
                if let Err(e) = self.delivery.fail(id, reason, false, now) {
                    debug!(message = %id, error = %e, "Delivery: failure not recorded");
                }
                return Err(e.into());
            }
        };
        outbox.insert(id.to_string(), frame);

        for evicted_id in outcome.evicted.iter().filter_map(Frame::client_message_id) {
            warn!(message = %evicted_id, "Message evicted from full send queue");
            let reason = ConnectivityError::TransientNetwork("evicted from send queue".into());
            if let Err(e) = self.delivery.fail(evicted_id, reason, true, now) {
                debug!(message = %evicted_id, error = %e, "Delivery: eviction not recorded");
            }
        }

        Ok(())
    }

    /// Stop every task and close the channel.
    pub async fn shutdown(mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.heartbeat.stop();
        for task in self.tasks.drain(..) {
            task.abort();
        }

        self.connection.shutdown();
        if let Some(task) = self.connection_task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                warn!("Channel did not close in time");
                abort.abort();
            }
        }

        self.roster.invalidate();
        info!("Session ended");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
        if let Some(task) = &self.connection_task {
            task.abort();
        }
    }
}

/// Withdraw failed messages from the send queue, and drop outbox entries
/// that can no longer be resent.
fn follow_deliveries(
    mut changes: Subscription,
    connection: ConnectionManager,
    delivery: Arc<DeliveryTracker>,
    outbox: Outbox,
    prune_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut prune = tokio::time::interval(prune_interval);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = changes.recv() => {
                    let Some(event) = event else { break };
                    let Event::Delivery(change) = event.as_ref() else { continue };
                    if change.current != DeliveryState::Failed {
                        continue;
                    }
                    let id = &change.client_message_id;
                    let _outbox = outbox.lock().unwrap_or_else(PoisonError::into_inner);
                    // A resend may already have started a new record.
                    if delivery.state_of(id) == Some(DeliveryState::Failed) {
                        connection.cancel(id);
                    }
                }
                _ = prune.tick() => {
                    let mut outbox = outbox.lock().unwrap_or_else(PoisonError::into_inner);
                    outbox.retain(|id, _| {
                        delivery.get(id).is_some_and(|r| match r.state {
                            DeliveryState::Delivered => false,
                            DeliveryState::Failed => r.retryable,
                            DeliveryState::Pending | DeliveryState::Sent => true,
                        })
                    });
                }
            }
        }
    })
}

struct Shared {
    config: Config,
    bus: EventBus,
    transport: Arc<dyn Transport>,
    api: Arc<dyn PresenceApi>,
    auth: AuthState,
    visible: AtomicBool,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl Shared {
    /// Start or stop the session to match the login state.
    async fn sync(&self) {
        let logged_in = self.auth.is_authenticated();
        let mut session = self.session.lock().await;

        match (logged_in, session.is_some()) {
            (true, false) => {
                let started = Session::start(
                    &self.config,
                    self.bus.clone(),
                    Arc::clone(&self.transport),
                    Arc::clone(&self.api),
                    Arc::new(self.auth.clone()),
                    self.visible.load(Ordering::SeqCst),
                );
                started.connect();
                *session = Some(started);
            }
            (false, true) => {
                if let Some(ended) = session.take() {
                    ended.shutdown().await;
                }
            }
            _ => {}
        }
    }
}

/// Entry point for host applications.
pub struct Client {
    shared: Arc<Shared>,
    supervisor: JoinHandle<()>,
}

impl Client {
    /// Create a client and start following `auth`.
    ///
    /// If `auth` is already logged in, a session starts right away.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        api: Arc<dyn PresenceApi>,
        auth: AuthState,
    ) -> Self {
        let mut logins = auth.subscribe();
        let shared = Arc::new(Shared {
            config,
            bus: EventBus::new(),
            transport,
            api,
            auth,
            visible: AtomicBool::new(true),
            session: tokio::sync::Mutex::new(None),
        });

        let supervisor = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    logins.borrow_and_update();
                    shared.sync().await;
                    if logins.changed().await.is_err() {
                        break;
                    }
                }
            })
        };

        Self { shared, supervisor }
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Subscribe to one bus topic.
    #[must_use]
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.shared.bus.subscribe(topic)
    }

    #[must_use]
    pub fn auth(&self) -> &AuthState {
        &self.shared.auth
    }

    /// Log in and wait until the session has started.
    pub async fn login(&self, token: impl Into<String>) {
        self.shared.auth.login(token);
        self.shared.sync().await;
    }

    /// Log out and wait until the session has been torn down.
    pub async fn logout(&self) {
        self.shared.auth.logout();
        self.shared.sync().await;
    }

    async fn with_session<R>(&self, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.shared.session.lock().await.as_ref().map(f)
    }

    /// Send a chat message.
    ///
    /// # Errors
    ///
    /// Returns an error when logged out or if the message cannot be encoded.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: serde_json::Value,
    ) -> Result<ClientMessageId, ClientError> {
        self.with_session(|s| s.send_message(conversation_id, content))
            .await
            .ok_or(ClientError::NotLoggedIn)?
    }

    /// Retry a failed message.
    ///
    /// # Errors
    ///
    /// Returns an error when logged out or if the message is not retryable.
    pub async fn resend(&self, id: &str) -> Result<(), ClientError> {
        self.with_session(|s| s.resend(id))
            .await
            .ok_or(ClientError::NotLoggedIn)?
    }

    /// Report page visibility to the heartbeat driver.
    pub async fn set_visible(&self, visible: bool) {
        self.shared.visible.store(visible, Ordering::SeqCst);
        self.with_session(|s| s.set_visible(visible)).await;
    }

    /// Open the channel, or retry after reconnection gave up.
    ///
    /// # Errors
    ///
    /// Returns an error when logged out.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.with_session(Session::connect)
            .await
            .ok_or(ClientError::NotLoggedIn)
    }

    /// Close the channel and stay disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error when logged out.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.with_session(Session::disconnect)
            .await
            .ok_or(ClientError::NotLoggedIn)
    }

    /// Current connection state; `disconnected` when logged out.
    pub async fn connection_state(&self) -> ConnectionState {
        self.with_session(Session::state).await.unwrap_or_default()
    }

    /// Wait until the channel reaches `target`.
    ///
    /// Returns `false` when logged out or if the session ends first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> bool {
        let Some(connection) = self.with_session(|s| s.connection().clone()).await else {
            return false;
        };
        connection.wait_for(target).await
    }

    /// Every known user's presence, ordered by user ID.
    pub async fn presence(&self) -> Vec<PresenceRecord> {
        self.with_session(|s| s.presence().snapshot())
            .await
            .unwrap_or_default()
    }

    /// Users currently typing in a conversation.
    pub async fn typing_in(&self, conversation_id: &str) -> Vec<String> {
        self.with_session(|s| s.typing().typing_in(conversation_id))
            .await
            .unwrap_or_default()
    }

    /// Delivery record of an outbound message.
    pub async fn delivery(&self, id: &str) -> Option<DeliveryRecord> {
        self.with_session(|s| s.delivery().get(id)).await.flatten()
    }

    /// Cached roster from the last poll, while fresh.
    pub async fn roster(&self) -> Option<Vec<RosterEntry>> {
        self.with_session(Session::roster).await.flatten()
    }

    /// Stop following login changes and end the session.
    pub async fn shutdown(self) {
        self.supervisor.abort();
        if let Some(session) = self.shared.session.lock().await.take() {
            session.shutdown().await;
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeApi;
    use beacon_core::Event;
    use beacon_protocol::{AckState, TypingAction, UserStatus};
    use beacon_transport::{MemoryPeer, MemoryServer, MemoryTransport};
    use serde_json::json;

    fn client() -> (Client, MemoryServer, Arc<FakeApi>) {
        client_with(Config::default())
    }

    fn client_with(config: Config) -> (Client, MemoryServer, Arc<FakeApi>) {
        let (transport, server) = MemoryTransport::new();
        let api = Arc::new(FakeApi::default());
        let client = Client::new(config, Arc::new(transport), api.clone(), AuthState::new());
        (client, server, api)
    }

    async fn outbox_len(client: &Client) -> usize {
        client
            .with_session(|s| s.outbox.lock().unwrap().len())
            .await
            .unwrap()
    }

    /// Next frame from the client that is not a keep-alive.
    async fn next_frame(peer: &mut MemoryPeer) -> Option<Frame> {
        loop {
            match peer.recv().await? {
                Frame::Ping { .. } | Frame::Pong { .. } => continue,
                frame => return Some(frame),
            }
        }
    }

    async fn next_event(rx: &mut Subscription) -> Arc<Event> {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_out_calls_fail() {
        let (client, _server, _api) = client();
        assert!(matches!(
            client.send_message("c1", json!("hi")).await,
            Err(ClientError::NotLoggedIn)
        ));
        assert!(matches!(client.connect().await, Err(ClientError::NotLoggedIn)));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.presence().await.is_empty());
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_connects_with_credential() {
        let (client, mut server, api) = client();
        client.login("token-1").await;

        let peer = server.accept().await.unwrap();
        assert_eq!(peer.credential(), Some("token-1"));
        assert!(client.wait_for_state(ConnectionState::Connected).await);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.heartbeat_times().len(), 1);
        assert_eq!(api.roster_requests.lock().unwrap().len(), 1);
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_lifecycle() {
        let (client, mut server, _api) = client();
        let mut deliveries = client.subscribe(Topic::DeliveryChange);
        client.login("token-1").await;
        let mut peer = server.accept().await.unwrap();

        let id = client.send_message("c1", json!({"text": "hi"})).await.unwrap();
        match next_frame(&mut peer).await.unwrap() {
            Frame::Message {
                client_message_id,
                conversation_id,
                content,
            } => {
                assert_eq!(client_message_id, id);
                assert_eq!(conversation_id, "c1");
                assert_eq!(content, json!({"text": "hi"}));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        peer.send(&Frame::delivery_ack(&id, AckState::Delivered));

        let mut seen = Vec::new();
        while seen.last() != Some(&DeliveryState::Delivered) {
            if let Event::Delivery(change) = next_event(&mut deliveries).await.as_ref() {
                assert_eq!(change.client_message_id, id);
                seen.push(change.current);
            }
        }
        assert_eq!(
            seen,
            vec![DeliveryState::Pending, DeliveryState::Sent, DeliveryState::Delivered]
        );
        assert_eq!(
            client.delivery(&id).await.map(|r| r.state),
            Some(DeliveryState::Delivered)
        );
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_message_can_be_resent() {
        let (client, mut server, _api) = client();
        client.login("token-1").await;
        let mut peer = server.accept().await.unwrap();

        let id = client.send_message("c1", json!("hello")).await.unwrap();
        assert!(next_frame(&mut peer).await.is_some());
        assert!(matches!(client.resend(&id).await, Err(ClientError::NotRetryable(_))));

        tokio::time::sleep(Duration::from_secs(17)).await;
        let record = client.delivery(&id).await.unwrap();
        assert_eq!(record.state, DeliveryState::Failed);
        assert!(record.retryable);

        client.resend(&id).await.unwrap();
        match next_frame(&mut peer).await.unwrap() {
            Frame::Message {
                client_message_id, ..
            } => assert_eq!(client_message_id, id),
            other => panic!("unexpected frame {other:?}"),
        }
        peer.send(&Frame::delivery_ack(&id, AckState::Read));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            client.delivery(&id).await.map(|r| r.state),
            Some(DeliveryState::Delivered)
        );
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_messages_are_not_written_late() {
        let (client, mut server, _api) = client();
        server.set_refusing(true);
        client.login("token-1").await;

        let abandoned = client.send_message("c1", json!("one")).await.unwrap();
        let retried = client.send_message("c1", json!("two")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(16)).await;
        for id in [&abandoned, &retried] {
            let record = client.delivery(id).await.unwrap();
            assert_eq!(record.state, DeliveryState::Failed);
            assert!(record.retryable);
        }

        client.resend(&retried).await.unwrap();
        server.set_refusing(false);
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        // Only the explicit resend reaches the server, exactly once.
        match next_frame(&mut peer).await.unwrap() {
            Frame::Message {
                client_message_id, ..
            } => assert_eq!(client_message_id, retried),
            other => panic!("unexpected frame {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(peer.try_recv().is_none());
        assert_eq!(
            client.delivery(&abandoned).await.map(|r| r.state),
            Some(DeliveryState::Failed)
        );
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_messages_are_forgotten() {
        let mut config = Config::default();
        config.delivery.retention_ms = 30_000;
        let (client, mut server, _api) = client_with(config);
        client.login("token-1").await;
        let mut peer = server.accept().await.unwrap();

        let acked = client.send_message("c1", json!("a")).await.unwrap();
        let unanswered = client.send_message("c1", json!("b")).await.unwrap();
        assert!(next_frame(&mut peer).await.is_some());
        assert!(next_frame(&mut peer).await.is_some());
        peer.send(&Frame::delivery_ack(&acked, AckState::Delivered));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(outbox_len(&client).await, 1);

        // Timed out at 15s: still resendable for the retention window.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(client.delivery(&unanswered).await.unwrap().retryable);
        assert_eq!(outbox_len(&client).await, 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(client.delivery(&acked).await.is_none());
        assert!(client.delivery(&unanswered).await.is_none());
        assert_eq!(outbox_len(&client).await, 0);
        assert!(matches!(
            client.resend(&unanswered).await,
            Err(ClientError::Delivery(DeliveryError::UnknownMessage(_)))
        ));
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushed_presence_and_typing() {
        let (client, mut server, _api) = client();
        let mut typing = client.subscribe(Topic::TypingChange);
        client.login("token-1").await;
        let peer = server.accept().await.unwrap();

        peer.send(&Frame::user_status_change("bob", UserStatus::Online, None));
        peer.send(&Frame::typing("c1", "bob", TypingAction::Start));

        assert!(matches!(next_event(&mut typing).await.as_ref(), Event::Typing(c) if c.typing));
        assert_eq!(client.typing_in("c1").await, vec!["bob".to_string()]);
        let presence = client.presence().await;
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].status, UserStatus::Online);

        // No refresh: the entry expires within TTL plus one sweep.
        assert!(matches!(next_event(&mut typing).await.as_ref(), Event::Typing(c) if !c.typing));
        assert!(client.typing_in("c1").await.is_empty());
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_tears_down_session() {
        let (client, mut server, api) = client();
        client.login("token-1").await;
        let mut peer = server.accept().await.unwrap();
        assert!(client.wait_for_state(ConnectionState::Connected).await);

        client.logout().await;
        assert_eq!(peer.recv().await, None);
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);

        let heartbeats = api.heartbeat_times().len();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.heartbeat_times().len(), heartbeats);
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_login_is_followed() {
        let (client, mut server, _api) = client();
        client.auth().login("token-2");

        let peer = server.accept().await.unwrap();
        assert_eq!(peer.credential(), Some("token-2"));
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_page_pauses_heartbeat() {
        let (client, _server, api) = client();
        client.set_visible(false).await;
        client.login("token-1").await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(api.heartbeat_times().is_empty());

        client.set_visible(true).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.heartbeat_times().len(), 1);
        client.shutdown().await;
    }
}
