//! In-process transport.
//!
//! Each accepted connection hands its server side to the owner as a
//! [`MemoryPeer`], which can push frames to the client, read what the client
//! sent, and drop the connection. Connect attempts can be scripted to fail and
//! are recorded with their (tokio) timestamps, so reconnect behaviour can be
//! observed under paused time.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chatsync_shared::SyncError;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::connection::{Connector, Frame, Transport};
use crate::sync_util::lock;

/// One recorded call to [`Connector::connect`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectAttempt {
    pub url: String,
    pub at: Instant,
    pub accepted: bool,
}

/// Server side of an accepted in-memory connection.
pub struct MemoryPeer {
    pub url: String,
    to_client: UnboundedSender<Result<Frame, SyncError>>,
    from_client: UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Push a text frame. Returns `false` if the client side is gone.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.to_client
            .unbounded_send(Ok(Frame::Text(text.into())))
            .is_ok()
    }

    /// Next frame the client sent, or `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Drop the connection from the server side.
    pub fn disconnect(self) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Close));
    }
}

struct MemoryInner {
    fail_next: AtomicU32,
    refuse_all: AtomicBool,
    attempts: Mutex<Vec<ConnectAttempt>>,
    accepted_tx: mpsc::UnboundedSender<MemoryPeer>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MemoryInner {
                fail_next: AtomicU32::new(0),
                refuse_all: AtomicBool::new(false),
                attempts: Mutex::new(Vec::new()),
                accepted_tx,
                accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            }),
        }
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next(&self, n: u32) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every connect attempt until switched off.
    pub fn refuse_all(&self, refuse: bool) {
        self.inner.refuse_all.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        lock(&self.inner.attempts).clone()
    }

    /// Wait for the next accepted connection.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.inner.accepted_rx.lock().await.recv().await
    }

    /// Next accepted connection, if one is already waiting.
    pub fn try_accept(&self) -> Option<MemoryPeer> {
        self.inner.accepted_rx.try_lock().ok()?.try_recv().ok()
    }

    fn should_refuse(&self) -> bool {
        if self.inner.refuse_all.load(Ordering::SeqCst) {
            return true;
        }
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Transport, SyncError> {
        let refused = self.should_refuse();
        lock(&self.inner.attempts).push(ConnectAttempt {
            url: url.to_string(),
            at: Instant::now(),
            accepted: !refused,
        });
        if refused {
            return Err(SyncError::TransportFailure(format!(
                "connection refused: {}",
                url
            )));
        }

        let (to_client, client_rx) = unbounded();
        let (client_tx, from_client) = unbounded::<String>();
        let peer = MemoryPeer {
            url: url.to_string(),
            to_client,
            from_client,
        };
        self.inner
            .accepted_tx
            .send(peer)
            .map_err(|_| SyncError::TransportFailure("memory listener dropped".into()))?;

        Ok(Transport {
            sink: Box::pin(
                client_tx.sink_map_err(|e| SyncError::TransportFailure(e.to_string())),
            ),
            stream: Box::pin(client_rx),
        })
    }
}
