//! In-process transport.
//!
//! [`MemoryTransport`] opens connections to a [`MemoryServer`] living in the
//! same process. Frames cross as encoded JSON text, so the server side can
//! also inject malformed input. The server controls whether connection
//! attempts succeed, fail, or hang.

use async_trait::async_trait;
use beacon_protocol::{codec, Frame};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, Transport, TransportError};

#[derive(Debug, Default)]
struct Behavior {
    attempts: AtomicU32,
    fail_next: AtomicU32,
    refusing: AtomicBool,
    stalled: AtomicBool,
}

/// Client half of the in-process transport.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    incoming: mpsc::UnboundedSender<MemoryPeer>,
    behavior: Arc<Behavior>,
}

impl MemoryTransport {
    /// Create a transport and the server it connects to.
    #[must_use]
    pub fn new() -> (Self, MemoryServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let behavior = Arc::new(Behavior::default());
        (
            Self {
                incoming: tx,
                behavior: Arc::clone(&behavior),
            },
            MemoryServer {
                incoming: rx,
                behavior,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, credential: Option<&str>) -> Result<Box<dyn Connection>, TransportError> {
        let attempt = self.behavior.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if self.behavior.stalled.load(Ordering::SeqCst) {
            debug!(attempt, "Memory transport: connect stalled");
            std::future::pending::<()>().await;
        }

        if self.behavior.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("connection refused".into()));
        }

        let failed = self
            .behavior
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::ConnectFailed("injected failure".into()));
        }

        let id = ConnectionId::generate();
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            id: id.clone(),
            credential: credential.map(str::to_owned),
            tx: Some(server_tx),
            rx: server_rx,
        };
        self.incoming
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed("server stopped".into()))?;

        debug!(conn = %id, attempt, "Memory transport: connected");
        Ok(Box::new(MemoryConnection {
            id,
            tx: Some(client_tx),
            rx: client_rx,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Client side of an in-process connection.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.rx.recv().await {
            Some(text) => Ok(Some(codec::decode(&text)?)),
            None => {
                self.tx = None;
                Ok(None)
            }
        }
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        let text = codec::encode(frame)?;
        if tx.send(text).is_err() {
            self.tx = None;
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// Server side of the in-process transport.
#[derive(Debug)]
pub struct MemoryServer {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
    behavior: Arc<Behavior>,
}

impl MemoryServer {
    /// Wait for the next client connection.
    ///
    /// Returns `None` once every transport handle has been dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }

    /// Take a pending connection if one is ready.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.try_recv().ok()
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.behavior.fail_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every connection attempt while set.
    pub fn set_refusing(&self, refusing: bool) {
        self.behavior.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Make connection attempts hang forever while set.
    pub fn set_stalled(&self, stalled: bool) {
        self.behavior.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Get the number of connection attempts so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.behavior.attempts.load(Ordering::SeqCst)
    }
}

/// Server end of one in-process connection.
#[derive(Debug)]
pub struct MemoryPeer {
    id: ConnectionId,
    credential: Option<String>,
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Get the connection ID shared with the client side.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the credential the client connected with.
    #[must_use]
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    /// Send a frame to the client. Returns `false` if the client is gone.
    pub fn send(&self, frame: &Frame) -> bool {
        match codec::encode(frame) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(error = %e, "Memory peer: frame not encodable");
                false
            }
        }
    }

    /// Send raw text to the client. Returns `false` if the client is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx
            .as_ref()
            .is_some_and(|tx| tx.send(text.into()).is_ok())
    }

    /// Wait for the next frame from the client.
    ///
    /// Returns `None` once the client has closed the connection.
    pub async fn recv(&mut self) -> Option<Frame> {
        while let Some(text) = self.rx.recv().await {
            match codec::decode(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => warn!(error = %e, "Memory peer: malformed frame from client"),
            }
        }
        None
    }

    /// Take a frame from the client if one is ready.
    pub fn try_recv(&mut self) -> Option<Frame> {
        while let Ok(text) = self.rx.try_recv() {
            if let Ok(frame) = codec::decode(&text) {
                return Some(frame);
            }
        }
        None
    }

    /// Close the server end; the client sees the connection end.
    pub fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
