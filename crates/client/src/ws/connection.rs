//! A single managed channel: state machine, transport plumbing and the
//! connect/reconnect loop.

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chatsync_shared::{decode_inbound, ChannelRef, SyncError};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::watch;

use crate::config::ReconnectConfig;
use crate::dispatch::{EventDispatcher, LifecycleEvent, SyncEvent};
use crate::sync_util::lock;

/// Connection state for a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }

    /// Connected or on its way there.
    pub fn is_live(&self) -> bool {
        self.is_connected() || self.is_connecting()
    }

    /// Current reconnect attempt; zero unless reconnecting.
    pub fn attempt(&self) -> u32 {
        match self {
            ConnectionState::Reconnecting { attempt } => *attempt,
            _ => 0,
        }
    }
}

/// One inbound unit from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Close,
    /// Binary, ping, pong: ignored by the channel.
    Other,
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = SyncError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, SyncError>> + Send>>;

/// An established duplex connection.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens transports. The manager calls this once per (re)connect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Transport, SyncError>;
}

/// State shared between a channel's worker task and the manager.
pub(crate) struct ChannelShared {
    pub(crate) channel: ChannelRef,
    pub(crate) url: String,
    state: watch::Sender<ConnectionState>,
    /// Present only while connected; dropped on disconnect so nothing queued
    /// for one session leaks into the next.
    outbound: Mutex<Option<UnboundedSender<String>>>,
    shutdown: watch::Sender<bool>,
}

impl ChannelShared {
    pub(crate) fn new(channel: ChannelRef, url: String) -> (Arc<Self>, watch::Receiver<bool>) {
        // Starts as Connecting so a second open before the worker runs is a no-op.
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Self {
            channel,
            url,
            state,
            outbound: Mutex::new(None),
            shutdown,
        });
        (shared, shutdown_rx)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        crate::log_debug!("{} -> {:?}", self.channel, state);
        self.state.send_replace(state);
    }

    /// At-most-once send: fails unless the channel is connected right now.
    pub(crate) fn send_text(&self, text: String) -> Result<(), SyncError> {
        let outbound = lock(&self.outbound);
        match outbound.as_ref() {
            Some(tx) if self.state.borrow().is_connected() => tx
                .unbounded_send(text)
                .map_err(|_| SyncError::NotConnected(self.channel.to_string())),
            _ => Err(SyncError::NotConnected(self.channel.to_string())),
        }
    }

    pub(crate) fn request_close(&self) {
        self.shutdown.send_replace(true);
    }
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

/// Drives one channel until it is closed or gives up.
pub(crate) struct ChannelWorker {
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) reconnect: ReconnectConfig,
    /// Only the firehose reconnects on its own; conversation channels report
    /// the disconnect and stop.
    pub(crate) auto_reconnect: bool,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl ChannelWorker {
    pub(crate) async fn run(mut self) {
        let channel = self.shared.channel.clone();
        let mut attempt = 0u32;

        loop {
            if *self.shutdown_rx.borrow_and_update() {
                break;
            }

            let connected = tokio::select! {
                result = self.connector.connect(&self.shared.url) => result,
                _ = self.shutdown_rx.changed() => break,
            };

            match connected {
                Ok(transport) => {
                    attempt = 0;
                    let (tx, rx) = unbounded();
                    *lock(&self.shared.outbound) = Some(tx);
                    self.shared.set_state(ConnectionState::Connected);
                    crate::log_info!("{} connected", channel);
                    self.dispatcher
                        .publish_lifecycle(&channel, LifecycleEvent::Connected);

                    let end = self.pump(transport, rx).await;
                    lock(&self.shared.outbound).take();

                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Dropped(reason) => {
                            crate::log_warn!("{} disconnected: {}", channel, reason);
                            self.dispatcher
                                .publish_lifecycle(&channel, LifecycleEvent::Disconnected);
                            if !self.auto_reconnect {
                                self.shared.set_state(ConnectionState::Disconnected);
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    crate::log_error!("{} connect failed: {}", channel, e);
                    if !self.auto_reconnect {
                        self.fail(e.to_string());
                        return;
                    }
                }
            }

            if !self.reconnect.allows(attempt) {
                self.fail(SyncError::ReconnectExhausted { attempts: attempt }.to_string());
                return;
            }

            let delay = self.reconnect.delay_for_attempt(attempt);
            attempt += 1;
            self.shared
                .set_state(ConnectionState::Reconnecting { attempt });
            crate::log_info!(
                "Reconnecting {} in {}ms (attempt {})",
                channel,
                delay.as_millis(),
                attempt
            );
            self.dispatcher
                .publish_lifecycle(&channel, LifecycleEvent::Reconnecting { attempt });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.changed() => break,
            }
        }

        // Explicit close by the owner.
        self.shared.set_state(ConnectionState::Disconnected);
        crate::log_info!("{} closed", channel);
        self.dispatcher
            .publish_lifecycle(&channel, LifecycleEvent::Disconnected);
    }

    fn fail(&self, reason: String) {
        crate::log_error!("{} failed: {}", self.shared.channel, reason);
        self.shared.set_state(ConnectionState::Failed {
            reason: reason.clone(),
        });
        self.dispatcher
            .publish_lifecycle(&self.shared.channel, LifecycleEvent::Failed { reason });
    }

    async fn pump(
        &mut self,
        transport: Transport,
        mut outbound: UnboundedReceiver<String>,
    ) -> SessionEnd {
        let Transport {
            mut sink,
            mut stream,
        } = transport;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Frame::Text(text))) => self.deliver(&text),
                    Some(Ok(Frame::Other)) => {}
                    Some(Ok(Frame::Close)) | None => {
                        return SessionEnd::Dropped("closed by peer".to_string())
                    }
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                },
                out = outbound.next() => match out {
                    Some(text) => {
                        if let Err(e) = sink.send(text).await {
                            return SessionEnd::Dropped(format!("send failed: {}", e));
                        }
                    }
                    None => return SessionEnd::Dropped("outbound queue closed".to_string()),
                },
                _ = self.shutdown_rx.changed() => {
                    self.shared.set_state(ConnectionState::Closing);
                    if let Err(e) = sink.close().await {
                        crate::log_debug!("{} close handshake failed: {}", self.shared.channel, e);
                    }
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    fn deliver(&self, text: &str) {
        match decode_inbound(text) {
            Ok(event) => {
                self.dispatcher.publish(SyncEvent::Inbound {
                    channel: self.shared.channel.clone(),
                    event,
                });
            }
            Err(e) => self.dispatcher.record_malformed(&self.shared.channel, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_predicates() {
        assert!(ConnectionState::Connected.is_live());
        assert!(ConnectionState::Reconnecting { attempt: 2 }.is_connecting());
        assert_eq!(ConnectionState::Reconnecting { attempt: 2 }.attempt(), 2);
        assert_eq!(ConnectionState::Connected.attempt(), 0);
        assert!(!ConnectionState::Closing.is_live());
        assert!(!ConnectionState::Failed { reason: "x".into() }.is_live());
    }

    #[test]
    fn send_requires_connected_state() {
        let (shared, _shutdown) = ChannelShared::new(ChannelRef::Firehose, "ws://x".into());
        assert_eq!(
            shared.send_text("hi".into()),
            Err(SyncError::NotConnected("firehose".into()))
        );

        let (tx, _rx) = unbounded();
        *lock(&shared.outbound) = Some(tx);
        shared.set_state(ConnectionState::Reconnecting { attempt: 1 });
        assert!(shared.send_text("hi".into()).is_err());

        shared.set_state(ConnectionState::Connected);
        assert!(shared.send_text("hi".into()).is_ok());
    }
}
