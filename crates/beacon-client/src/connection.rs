//! Connection manager.
//!
//! A single task owns the open [`Connection`] and runs the reconnection
//! state machine:
//!
//! ```text
//! disconnected ──connect──▶ connecting ──opened──▶ connected
//!                               │                   │    ▲
//!                          open failed         lost │    │ opened
//!                               ▼                   ▼    │
//!                             error ──backoff──▶ reconnecting
//!                               ▲                   │
//!                               └────exhausted──────┘
//! ```
//!
//! Callers talk to it through a cloneable [`ConnectionManager`] handle.
//! Outbound frames always go through a bounded FIFO queue that is flushed
//! whenever the channel is open, so frames sent while offline are written in
//! submission order once connected.
//!
//! A lost channel counts against the same attempt budget as a failed open.
//! The budget is restored only once the server has sent a frame on the new
//! channel, so a server that accepts and immediately drops is retried with
//! growing delays and eventually given up on.

use beacon_core::{
    ConnectionState, ConnectionStateChange, ConnectivityError, Event, EventBus, InboundMessage,
    OutboundReceipt,
};
use beacon_protocol::{codec, Frame, ProtocolError};
use beacon_transport::{Connection, Transport, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::auth::CredentialProvider;
use crate::backoff::Backoff;
use crate::config::ConnectionConfig;
use crate::metrics;

/// Result of handing a frame to [`ConnectionManager::send`].
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    /// Frames ahead of this one in the queue.
    pub queued_behind: usize,
    /// Oldest frames dropped to make room, oldest first.
    pub evicted: Vec<Frame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Disconnect,
    Shutdown,
}

/// Bounded FIFO shared between the handle and the task.
#[derive(Debug)]
struct SendQueue {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    notify: Notify,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    fn push(&self, frame: Frame) -> SendOutcome {
        let (outcome, depth) = {
            let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
            let mut evicted = Vec::new();
            while frames.len() >= self.capacity {
                match frames.pop_front() {
                    Some(oldest) => evicted.push(oldest),
                    None => break,
                }
            }
            frames.push_back(frame);
            (
                SendOutcome {
                    queued_behind: frames.len() - 1,
                    evicted,
                },
                frames.len(),
            )
        };

        for evicted in &outcome.evicted {
            warn!(
                frame = evicted.type_name(),
                message = ?evicted.client_message_id(),
                "Send queue full, oldest frame dropped"
            );
            metrics::record_eviction();
        }
        metrics::set_queue_depth(depth);
        self.notify.notify_one();
        outcome
    }

    fn pop(&self) -> Option<Frame> {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        let frame = frames.pop_front();
        metrics::set_queue_depth(frames.len());
        frame
    }

    /// Put a frame whose write failed back at the head.
    ///
    /// Never drops: a push made while the frame was being written may leave
    /// the queue one over capacity, and the next push evicts (and reports)
    /// the excess.
    fn requeue(&self, frame: Frame) {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.push_front(frame);
        metrics::set_queue_depth(frames.len());
    }

    /// Drop every queued frame for message `id`. Returns `true` if any was.
    fn remove(&self, id: &str) -> bool {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        let before = frames.len();
        frames.retain(|frame| frame.client_message_id() != Some(id));
        metrics::set_queue_depth(frames.len());
        frames.len() < before
    }

    fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle to the connection manager task.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    queue: Arc<SendQueue>,
}

impl ConnectionManager {
    /// Start the manager task in the `disconnected` state.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        config: ConnectionConfig,
        bus: EventBus,
    ) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let queue = Arc::new(SendQueue::new(config.queue_capacity));

        let actor = Actor {
            transport,
            credentials,
            backoff: Backoff::from_config(&config),
            config,
            bus,
            queue: Arc::clone(&queue),
            state: state_tx,
            commands: command_rx,
            failures: 0,
            sequence: 0,
        };
        let handle = tokio::spawn(actor.run());

        (
            Self {
                commands: command_tx,
                state: state_rx,
                queue,
            },
            handle,
        )
    }

    /// Open the channel. Ignored while connecting or connected.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the channel and stay disconnected until [`connect`](Self::connect).
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Close the channel and stop the task.
    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(?command, "Connection manager already stopped");
        }
    }

    /// Queue a frame for writing.
    ///
    /// The frame is written as soon as the channel is open, after every frame
    /// queued before it.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame can never be encoded.
    pub fn send(&self, frame: Frame) -> Result<SendOutcome, ProtocolError> {
        codec::encode(&frame)?;
        Ok(self.queue.push(frame))
    }

    /// Withdraw a message that has not been written yet.
    ///
    /// Returns `false` if nothing for `id` was queued, for instance because
    /// it is already on the wire.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.queue.remove(id);
        if removed {
            debug!(message = %id, "Queued message withdrawn");
        }
        removed
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch the current state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the manager reaches `target`.
    ///
    /// Returns `false` if the task stopped first.
    pub async fn wait_for(&self, target: ConnectionState) -> bool {
        let mut state = self.state.clone();
        let reached = state.wait_for(|s| *s == target).await;
        reached.is_ok()
    }

    /// Get the number of frames waiting to be written.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

enum Phase {
    Idle,
    Opening,
    Waiting,
    Connected(Box<dyn Connection>),
    Stopped,
}

struct Actor {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    config: ConnectionConfig,
    backoff: Backoff,
    bus: EventBus,
    queue: Arc<SendQueue>,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Consecutive failed opens and lost channels without a frame from the
    /// server in between.
    failures: u32,
    /// Inbound frames received so far.
    sequence: u64,
}

impl Actor {
    async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Opening => self.open().await,
                Phase::Waiting => self.wait_backoff().await,
                Phase::Connected(conn) => self.serve(conn).await,
                Phase::Stopped => break,
            };
        }
        debug!("Connection manager stopped");
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState, reason: Option<ConnectivityError>) {
        let previous = self.current();
        if previous == next {
            return;
        }
        self.state.send_replace(next);

        match &reason {
            Some(reason) => info!(from = %previous, to = %next, %reason, "Connection state changed"),
            None => info!(from = %previous, to = %next, "Connection state changed"),
        }
        metrics::record_state(next);
        self.bus.publish(Event::ConnectionState(ConnectionStateChange {
            previous,
            current: next,
            reason,
        }));
    }

    /// Apply a command that arrived outside the idle phase.
    ///
    /// Returns the next phase, or `None` if the current phase continues.
    fn interrupt(&self, command: Option<Command>) -> Option<Phase> {
        match command {
            Some(Command::Connect) => None,
            Some(Command::Disconnect) => {
                self.set_state(ConnectionState::Disconnected, None);
                Some(Phase::Idle)
            }
            Some(Command::Shutdown) | None => {
                self.set_state(ConnectionState::Disconnected, None);
                Some(Phase::Stopped)
            }
        }
    }

    async fn idle(&mut self) -> Phase {
        match self.commands.recv().await {
            Some(Command::Connect) => {
                self.failures = 0;
                self.set_state(ConnectionState::Connecting, None);
                Phase::Opening
            }
            Some(Command::Disconnect) => {
                self.set_state(ConnectionState::Disconnected, None);
                Phase::Idle
            }
            Some(Command::Shutdown) | None => {
                self.set_state(ConnectionState::Disconnected, None);
                Phase::Stopped
            }
        }
    }

    async fn open(&mut self) -> Phase {
        let transport = Arc::clone(&self.transport);
        let credential = self.credentials.credential();
        let timeout = self.config.connect_timeout();

        debug!(
            transport = transport.name(),
            attempt = self.failures + 1,
            authenticated = credential.is_some(),
            "Opening channel"
        );

        let opening = tokio::time::timeout(timeout, transport.connect(credential.as_deref()));
        tokio::pin!(opening);

        let result = loop {
            tokio::select! {
                result = &mut opening => break result,
                command = self.commands.recv() => {
                    if let Some(phase) = self.interrupt(command) {
                        return phase;
                    }
                }
            }
        };

        match result {
            Ok(Ok(conn)) => {
                info!(conn = %conn.id(), transport = transport.name(), "Channel opened");
                self.set_state(ConnectionState::Connected, None);
                Phase::Connected(conn)
            }
            Ok(Err(e)) => self.open_failed(e.to_string()),
            Err(_) => self.open_failed(format!("connect timed out after {timeout:?}")),
        }
    }

    fn open_failed(&mut self, reason: String) -> Phase {
        self.failures += 1;
        warn!(attempt = self.failures, error = %reason, "Channel open failed");

        if let Some(phase) = self.give_up() {
            return phase;
        }

        if self.current() == ConnectionState::Connecting {
            self.set_state(
                ConnectionState::Error,
                Some(ConnectivityError::TransientNetwork(reason)),
            );
        }
        Phase::Waiting
    }

    /// Enter `error` if the attempt budget is spent.
    fn give_up(&self) -> Option<Phase> {
        if !self.backoff.is_exhausted(self.failures) {
            return None;
        }
        error!(attempts = self.failures, "Reconnect attempts exhausted");
        self.set_state(
            ConnectionState::Error,
            Some(ConnectivityError::ExhaustedReconnect {
                attempts: self.failures,
            }),
        );
        Some(Phase::Idle)
    }

    async fn wait_backoff(&mut self) -> Phase {
        let delay = self.backoff.delay(self.failures);
        debug!(attempt = self.failures + 1, ?delay, "Waiting before reconnect");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = self.commands.recv() => {
                    // An explicit connect skips the rest of the wait.
                    if command == Some(Command::Connect) {
                        break;
                    }
                    if let Some(phase) = self.interrupt(command) {
                        return phase;
                    }
                }
            }
        }

        metrics::record_reconnect_attempt();
        self.set_state(ConnectionState::Reconnecting, None);
        Phase::Opening
    }

    async fn serve(&mut self, mut conn: Box<dyn Connection>) -> Phase {
        if let Err(e) = self.flush(conn.as_mut()).await {
            return self.lost(conn, e.to_string()).await;
        }

        let period = self.config.ping_interval();
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;
        let mut missed_pongs = 0u32;

        let reason = loop {
            tokio::select! {
                command = self.commands.recv() => {
                    if command == Some(Command::Connect) {
                        continue;
                    }
                    Self::close(conn.as_mut()).await;
                    if let Some(phase) = self.interrupt(command) {
                        return phase;
                    }
                }
                _ = self.queue.notify.notified() => {
                    if let Err(e) = self.flush(conn.as_mut()).await {
                        break e.to_string();
                    }
                }
                received = conn.recv() => match received {
                    Ok(Some(frame)) => match self.handle_inbound(conn.as_mut(), frame).await {
                        Ok(true) => {
                            awaiting_pong = false;
                            missed_pongs = 0;
                        }
                        Ok(false) => {}
                        Err(e) => break e.to_string(),
                    },
                    Ok(None) => break "channel closed by server".to_string(),
                    Err(e) if e.is_recoverable() => {
                        warn!(conn = %conn.id(), error = %e, "Dropping malformed frame");
                        metrics::record_parse_error();
                    }
                    Err(e) => break e.to_string(),
                },
                _ = ping.tick() => {
                    if awaiting_pong {
                        missed_pongs += 1;
                        debug!(conn = %conn.id(), missed_pongs, "Pong missed");
                    }
                    if missed_pongs >= self.config.max_missed_pongs {
                        break format!("{missed_pongs} consecutive pongs missed");
                    }
                    match conn.send(&Frame::ping(Some(unix_millis()))).await {
                        Ok(()) => {
                            awaiting_pong = true;
                            metrics::record_frame("outbound", "ping");
                        }
                        Err(e) => break e.to_string(),
                    }
                }
            }
        };

        self.lost(conn, reason).await
    }

    /// Write every queued frame in order.
    async fn flush(&self, conn: &mut dyn Connection) -> Result<(), TransportError> {
        while let Some(frame) = self.queue.pop() {
            if let Err(e) = conn.send(&frame).await {
                if e.is_recoverable() {
                    warn!(frame = frame.type_name(), error = %e, "Dropping unencodable frame");
                    continue;
                }
                self.queue.requeue(frame);
                return Err(e);
            }

            trace!(frame = frame.type_name(), "Frame written");
            metrics::record_frame("outbound", frame.type_name());
            self.bus
                .publish(Event::Outbound(OutboundReceipt::for_frame(&frame)));
        }
        Ok(())
    }

    /// Publish an inbound frame. Returns `true` if it was a pong.
    async fn handle_inbound(
        &mut self,
        conn: &mut dyn Connection,
        frame: Frame,
    ) -> Result<bool, TransportError> {
        if self.failures > 0 {
            debug!(conn = %conn.id(), after = self.failures, "Channel healthy, attempt budget restored");
            self.failures = 0;
        }
        self.sequence += 1;
        metrics::record_frame("inbound", frame.type_name());

        let reply = match &frame {
            Frame::Ping { timestamp } => Some(Frame::pong(*timestamp)),
            _ => None,
        };
        let is_pong = matches!(frame, Frame::Pong { .. });

        if matches!(frame, Frame::Unknown) {
            debug!(sequence = self.sequence, "Frame of unknown type");
        }
        trace!(sequence = self.sequence, kind = frame.kind().as_str(), "Frame received");
        self.bus
            .publish(Event::Inbound(InboundMessage::new(self.sequence, frame)));

        if let Some(reply) = reply {
            conn.send(&reply).await?;
            metrics::record_frame("outbound", "pong");
        }
        Ok(is_pong)
    }

    async fn lost(&mut self, mut conn: Box<dyn Connection>, reason: String) -> Phase {
        Self::close(conn.as_mut()).await;
        self.failures += 1;
        warn!(conn = %conn.id(), attempt = self.failures, %reason, "Channel lost");

        if let Some(phase) = self.give_up() {
            return phase;
        }
        self.set_state(
            ConnectionState::Reconnecting,
            Some(ConnectivityError::TransientNetwork(reason)),
        );
        Phase::Waiting
    }

    async fn close(conn: &mut dyn Connection) {
        if let Err(e) = conn.close().await {
            debug!(conn = %conn.id(), error = %e, "Close failed");
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthState;
    use beacon_core::{Subscription, Topic};
    use beacon_protocol::{MessageKind, TypingAction, UserStatus};
    use beacon_transport::{MemoryServer, MemoryTransport};
    use std::time::Duration;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            jitter: 0.0,
            ..ConnectionConfig::default()
        }
    }

    fn start(config: ConnectionConfig) -> (ConnectionManager, MemoryServer, EventBus, JoinHandle<()>) {
        let (transport, server) = MemoryTransport::new();
        let auth = AuthState::new();
        auth.login("token-1");
        let bus = EventBus::new();
        let (manager, handle) =
            ConnectionManager::spawn(Arc::new(transport), Arc::new(auth), config, bus.clone());
        (manager, server, bus, handle)
    }

    async fn next_state(rx: &mut Subscription) -> ConnectionStateChange {
        loop {
            let event = rx.recv().await.unwrap();
            if let Event::ConnectionState(change) = event.as_ref() {
                return change.clone();
            }
        }
    }

    async fn next_inbound(rx: &mut Subscription) -> InboundMessage {
        loop {
            let event = rx.recv().await.unwrap();
            if let Event::Inbound(message) = event.as_ref() {
                return message.clone();
            }
        }
    }

    fn message(id: &str) -> Frame {
        Frame::message(id, "c1", serde_json::json!({ "text": id }))
    }

    #[test]
    fn test_queue_evicts_oldest_when_full() {
        let queue = SendQueue::new(2);
        assert_eq!(queue.push(message("m1")).queued_behind, 0);
        assert_eq!(queue.push(message("m2")).queued_behind, 1);

        let outcome = queue.push(message("m3"));
        assert_eq!(outcome.evicted, vec![message("m1")]);
        assert_eq!(outcome.queued_behind, 1);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(message("m2")));
        assert_eq!(queue.pop(), Some(message("m3")));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_requeue_into_full_queue_is_reported_by_next_push() {
        let queue = SendQueue::new(2);
        queue.push(message("m1"));
        queue.push(message("m2"));

        // m1 is being written while m3 arrives, then the write fails.
        let writing = queue.pop().unwrap();
        assert!(queue.push(message("m3")).evicted.is_empty());
        queue.requeue(writing);
        assert_eq!(queue.len(), 3);

        // Nothing was lost silently: the next push evicts both excess frames.
        let outcome = queue.push(message("m4"));
        assert_eq!(outcome.evicted, vec![message("m1"), message("m2")]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(message("m3")));
        assert_eq!(queue.pop(), Some(message("m4")));
    }

    #[test]
    fn test_remove_withdraws_only_matching_frames() {
        let queue = SendQueue::new(8);
        queue.push(message("m1"));
        queue.push(Frame::ping(None));
        queue.push(message("m2"));

        assert!(queue.remove("m1"));
        assert!(!queue.remove("m1"));
        assert_eq!(queue.pop(), Some(Frame::ping(None)));
        assert_eq!(queue.pop(), Some(message("m2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_message_is_never_written() {
        let (manager, mut server, _bus, handle) = start(config());
        manager.send(message("keep-1")).unwrap();
        manager.send(message("withdrawn")).unwrap();
        manager.send(message("keep-2")).unwrap();

        assert!(manager.cancel("withdrawn"));
        assert_eq!(manager.queued(), 2);

        manager.connect();
        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.recv().await.unwrap().client_message_id(), Some("keep-1"));
        assert_eq!(peer.recv().await.unwrap().client_message_id(), Some("keep-2"));
        assert!(peer.try_recv().is_none());

        // Already written: nothing left to withdraw.
        assert!(!manager.cancel("keep-1"));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rejects_unencodable_frame() {
        let (manager, _server, _bus, handle) = start(config());
        assert!(manager.send(Frame::Unknown).is_err());
        assert_eq!(manager.queued(), 0);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_frames_flush_in_order() {
        let (manager, mut server, bus, handle) = start(config());
        let mut outbound = bus.subscribe(Topic::Outbound);

        for i in 0..5 {
            manager.send(message(&format!("m{i}"))).unwrap();
        }
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.queued(), 5);

        manager.connect();
        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.credential(), Some("token-1"));

        for i in 0..5 {
            let frame = peer.recv().await.unwrap();
            assert_eq!(frame.client_message_id(), Some(format!("m{i}").as_str()));
        }
        assert!(manager.wait_for(ConnectionState::Connected).await);
        assert_eq!(manager.queued(), 0);

        let receipts: Vec<String> = outbound
            .drain()
            .iter()
            .filter_map(|e| match e.as_ref() {
                Event::Outbound(r) => r.client_message_id.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(receipts, vec!["m0", "m1", "m2", "m3", "m4"]);

        // Frames sent while connected go straight out.
        manager.send(message("live")).unwrap();
        assert_eq!(peer.recv().await.unwrap().client_message_id(), Some("live"));

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_frames_published_in_order() {
        let (manager, mut server, bus, handle) = start(config());
        let mut inbound = bus.subscribe(Topic::Inbound);
        let mut states = bus.subscribe(Topic::ConnectionState);

        manager.connect();
        let peer = server.accept().await.unwrap();
        assert_eq!(next_state(&mut states).await.current, ConnectionState::Connecting);
        assert_eq!(next_state(&mut states).await.current, ConnectionState::Connected);

        peer.send(&Frame::user_status_change("u1", UserStatus::Online, Some(1)));
        peer.send_text("{ definitely not json");
        peer.send_text(r#"{"type":"read_receipt","message_id":"x"}"#);
        peer.send(&Frame::typing("c1", "u1", TypingAction::Start));

        let first = next_inbound(&mut inbound).await;
        let second = next_inbound(&mut inbound).await;
        let third = next_inbound(&mut inbound).await;
        assert_eq!((first.sequence, first.kind), (1, MessageKind::Presence));
        assert_eq!((second.sequence, second.kind), (2, MessageKind::Unknown));
        assert_eq!((third.sequence, third.kind), (3, MessageKind::Typing));

        // The malformed frame did not disturb the connection.
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(states.try_recv().is_none());

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_ping_is_answered() {
        let (manager, mut server, _bus, handle) = start(config());
        manager.connect();
        let mut peer = server.accept().await.unwrap();

        peer.send(&Frame::ping(Some(42)));
        assert_eq!(peer.recv().await, Some(Frame::pong(Some(42))));

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_missed_pongs_force_reconnect() {
        let (manager, mut server, bus, handle) = start(config());
        let mut states = bus.subscribe(Topic::ConnectionState);

        manager.connect();
        let mut peer = server.accept().await.unwrap();
        assert!(manager.wait_for(ConnectionState::Connected).await);
        let connected_at = Instant::now();

        // The server reads pings but never answers them.
        let reader = tokio::spawn(async move {
            let mut pings = 0;
            while let Some(frame) = peer.recv().await {
                if matches!(frame, Frame::Ping { .. }) {
                    pings += 1;
                }
            }
            pings
        });

        loop {
            let change = next_state(&mut states).await;
            if change.current == ConnectionState::Reconnecting {
                assert_eq!(change.previous, ConnectionState::Connected);
                assert!(matches!(
                    change.reason,
                    Some(ConnectivityError::TransientNetwork(_))
                ));
                break;
            }
        }
        assert_eq!(connected_at.elapsed(), Duration::from_secs(60));
        assert_eq!(reader.await.unwrap(), 3);

        // A fresh channel is opened after the first backoff delay.
        let _second = server.accept().await.unwrap();
        assert_eq!(connected_at.elapsed(), Duration::from_millis(60_500));
        assert!(manager.wait_for(ConnectionState::Connected).await);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_pings_keep_channel() {
        let (manager, mut server, bus, handle) = start(config());
        let mut states = bus.subscribe(Topic::ConnectionState);

        manager.connect();
        let mut peer = server.accept().await.unwrap();
        tokio::spawn(async move {
            while let Some(frame) = peer.recv().await {
                if let Frame::Ping { timestamp } = frame {
                    peer.send(&Frame::pong(timestamp));
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        let transitions: Vec<_> = states.drain();
        assert_eq!(transitions.len(), 2);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_goes_through_error_then_reconnects() {
        let (manager, mut server, bus, handle) = start(config());
        let mut states = bus.subscribe(Topic::ConnectionState);
        server.fail_next(1);

        manager.connect();
        let _peer = server.accept().await.unwrap();

        let expected = [
            ConnectionState::Connecting,
            ConnectionState::Error,
            ConnectionState::Reconnecting,
            ConnectionState::Connected,
        ];
        for state in expected {
            assert_eq!(next_state(&mut states).await.current, state);
        }
        assert_eq!(server.attempts(), 2);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnect_is_terminal() {
        let (manager, server, bus, handle) = start(ConnectionConfig {
            max_reconnect_attempts: 3,
            ..config()
        });
        let mut states = bus.subscribe(Topic::ConnectionState);
        server.set_refusing(true);

        manager.connect();
        let mut last = next_state(&mut states).await;
        while last.reason != Some(ConnectivityError::ExhaustedReconnect { attempts: 3 }) {
            last = next_state(&mut states).await;
        }
        assert_eq!(last.previous, ConnectionState::Reconnecting);
        assert_eq!(last.current, ConnectionState::Error);
        assert_eq!(server.attempts(), 3);

        // No further automatic retries.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(server.attempts(), 3);
        assert_eq!(manager.state(), ConnectionState::Error);

        // An explicit connect starts over.
        server.set_refusing(false);
        manager.connect();
        assert!(manager.wait_for(ConnectionState::Connected).await);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_grow() {
        let (manager, server, _bus, handle) = start(config());
        server.set_refusing(true);
        let started = Instant::now();

        manager.connect();
        // Attempts at 0, 0.5, 1.5 and 3.5 seconds.
        tokio::time::sleep(Duration::from_millis(3400)).await;
        assert_eq!(server.attempts(), 3);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.attempts(), 4);
        assert!(started.elapsed() < Duration::from_secs(4));

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_server_is_retried_with_backoff() {
        let (manager, mut server, bus, handle) = start(config());
        let mut states = bus.subscribe(Topic::ConnectionState);
        let started = Instant::now();

        // Every channel is accepted and dropped straight away.
        manager.connect();
        let mut opened_at = Vec::new();
        let deadline = started + Duration::from_secs(10);
        while let Ok(Some(peer)) = tokio::time::timeout_at(deadline, server.accept()).await {
            opened_at.push(started.elapsed());
            drop(peer);
        }
        assert_eq!(
            opened_at,
            [0, 500, 1_500, 3_500, 7_500].map(Duration::from_millis)
        );

        assert_eq!(next_state(&mut states).await.current, ConnectionState::Connecting);
        assert_eq!(next_state(&mut states).await.current, ConnectionState::Connected);
        let lost = next_state(&mut states).await;
        assert_eq!(lost.current, ConnectionState::Reconnecting);
        assert!(matches!(lost.reason, Some(ConnectivityError::TransientNetwork(_))));

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_server_exhausts_attempts() {
        let (manager, mut server, bus, handle) = start(ConnectionConfig {
            max_reconnect_attempts: 3,
            ..config()
        });
        let mut states = bus.subscribe(Topic::ConnectionState);
        tokio::spawn(async move {
            while let Some(peer) = server.accept().await {
                drop(peer);
            }
        });

        manager.connect();
        let mut last = next_state(&mut states).await;
        while last.current != ConnectionState::Error {
            last = next_state(&mut states).await;
        }
        assert_eq!(last.previous, ConnectionState::Connected);
        assert_eq!(
            last.reason,
            Some(ConnectivityError::ExhaustedReconnect { attempts: 3 })
        );

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(manager.state(), ConnectionState::Error);
        assert!(states.try_recv().is_none());

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_from_server_restores_attempt_budget() {
        let (manager, mut server, _bus, handle) = start(ConnectionConfig {
            max_reconnect_attempts: 2,
            ..config()
        });

        manager.connect();
        drop(server.accept().await.unwrap());

        // The second channel proves itself before it drops.
        let mut second = server.accept().await.unwrap();
        second.send(&Frame::ping(Some(7)));
        assert_eq!(second.recv().await, Some(Frame::pong(Some(7))));
        drop(second);
        let dropped_at = Instant::now();

        // Without the reset this would be the second failure in a row.
        let _third = server.accept().await.unwrap();
        assert_eq!(dropped_at.elapsed(), Duration::from_millis(500));
        assert!(manager.wait_for(ConnectionState::Connected).await);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (manager, server, bus, handle) = start(ConnectionConfig {
            connect_timeout_ms: 1_000,
            ..config()
        });
        let mut states = bus.subscribe(Topic::ConnectionState);
        server.set_stalled(true);
        let started = Instant::now();

        manager.connect();
        assert_eq!(next_state(&mut states).await.current, ConnectionState::Connecting);
        let failed = next_state(&mut states).await;
        assert_eq!(failed.current, ConnectionState::Error);
        assert_eq!(started.elapsed(), Duration::from_secs(1));

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_interrupts_open() {
        let (manager, server, _bus, handle) = start(config());
        server.set_stalled(true);

        manager.connect();
        assert!(manager.wait_for(ConnectionState::Connecting).await);
        manager.disconnect();
        assert!(manager.wait_for(ConnectionState::Disconnected).await);

        // Stays disconnected.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.attempts(), 1);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_channel() {
        let (manager, mut server, bus, handle) = start(config());
        let mut states = bus.subscribe(Topic::ConnectionState);

        manager.connect();
        let mut peer = server.accept().await.unwrap();
        assert!(manager.wait_for(ConnectionState::Connected).await);

        manager.disconnect();
        assert_eq!(peer.recv().await, None);
        let states: Vec<ConnectionState> = states
            .drain()
            .iter()
            .filter_map(|e| match e.as_ref() {
                Event::ConnectionState(change) => Some(change.current),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );

        // No reconnect after an explicit disconnect.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(server.try_accept().is_none());

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_survive_dropped_channel() {
        let (manager, mut server, _bus, handle) = start(config());

        manager.connect();
        let mut first = server.accept().await.unwrap();
        assert!(manager.wait_for(ConnectionState::Connected).await);

        first.close();
        manager.send(message("after-drop")).unwrap();

        let mut second = server.accept().await.unwrap();
        assert_eq!(
            second.recv().await.unwrap().client_message_id(),
            Some("after-drop")
        );
        assert!(manager.wait_for(ConnectionState::Connected).await);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_task() {
        let (manager, mut server, _bus, handle) = start(config());
        manager.connect();
        let mut peer = server.accept().await.unwrap();

        manager.shutdown();
        handle.await.unwrap();
        assert_eq!(peer.recv().await, None);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
