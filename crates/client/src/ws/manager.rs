//! Connection manager: one firehose channel plus reference-counted
//! conversation channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chatsync_shared::{ChannelRef, ClientCommand, SyncError, WsEnvelope};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use super::connection::{ChannelShared, ChannelWorker, ConnectionState, Connector};
use crate::config::SyncConfig;
use crate::dispatch::EventDispatcher;
use crate::sync_util::lock;

/// Opaque session credential presented when opening channels.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Clone)]
struct Endpoint {
    base: Url,
    credential: Credential,
}

struct ChannelEntry {
    shared: Arc<ChannelShared>,
    task: JoinHandle<()>,
    refs: usize,
}

struct ManagerInner {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    dispatcher: EventDispatcher,
    endpoint: Mutex<Option<Endpoint>>,
    firehose: Mutex<Option<ChannelEntry>>,
    conversations: Mutex<HashMap<String, ChannelEntry>>,
    /// Workers told to close that may still be finishing.
    closing: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Owns every persistent connection. Construct once at startup, pass clones
/// to consumers, call [`ConnectionManager::shutdown`] on teardown.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                connector,
                dispatcher,
                endpoint: Mutex::new(None),
                firehose: Mutex::new(None),
                conversations: Mutex::new(HashMap::new()),
                closing: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    /// Open the firehose. No-op while it is already connecting or connected.
    ///
    /// `endpoint` is the `ws://` or `wss://` origin; the credential is sent as
    /// the `token` query parameter and reused for conversation channels.
    pub fn open_firehose(&self, endpoint: &str, credential: Credential) -> Result<(), SyncError> {
        self.inner.ensure_running()?;
        let base = parse_endpoint(endpoint)?;

        let mut firehose = lock(&self.inner.firehose);
        if let Some(entry) = firehose.as_ref() {
            if entry.shared.state().is_live() {
                crate::log_debug!("firehose already {:?}, ignoring open", entry.shared.state());
                return Ok(());
            }
        }

        let url = channel_url(&base, &self.inner.config.firehose_path, &credential)?;
        *lock(&self.inner.endpoint) = Some(Endpoint { base, credential });

        let entry = self.inner.spawn_channel(ChannelRef::Firehose, url, true)?;
        crate::log_info!("opening firehose");
        *firehose = Some(entry);
        Ok(())
    }

    /// Open (or share) the channel for one conversation.
    ///
    /// The handle is usable once a `Connected` lifecycle event fires for
    /// `ChannelRef::Conversation(id)`.
    pub fn open_conversation(&self, conversation_id: &str) -> Result<ConversationHandle, SyncError> {
        self.inner.ensure_running()?;
        let id = conversation_id.trim();
        if id.is_empty() {
            return Err(SyncError::InvalidConversation(conversation_id.to_string()));
        }

        let endpoint = lock(&self.inner.endpoint)
            .clone()
            .ok_or(SyncError::NoEndpoint)?;

        let mut conversations = lock(&self.inner.conversations);
        let live = conversations
            .get_mut(id)
            .filter(|entry| entry.shared.state().is_live());
        if let Some(entry) = live {
            entry.refs += 1;
            crate::log_debug!("conversation {} now has {} refs", id, entry.refs);
        } else {
            // Not open, or it dropped/failed earlier: start a fresh channel
            // and carry over the references still held.
            let refs = conversations.get(id).map(|e| e.refs).unwrap_or(0) + 1;
            let path = format!(
                "{}/{}",
                self.inner.config.conversation_path.trim_end_matches('/'),
                urlencoding::encode(id)
            );
            let url = channel_url(&endpoint.base, &path, &endpoint.credential)?;
            let mut entry = self
                .inner
                .spawn_channel(ChannelRef::conversation(id), url, false)?;
            entry.refs = refs;
            crate::log_info!("opening conversation channel {}", id);
            conversations.insert(id.to_string(), entry);
        }

        Ok(ConversationHandle {
            conversation_id: id.to_string(),
            manager: Arc::downgrade(&self.inner),
        })
    }

    /// Send a command. Fails with `NotConnected` unless the channel is
    /// connected; nothing is queued across a disconnect.
    pub fn send(&self, channel: &ChannelRef, command: ClientCommand) -> Result<(), SyncError> {
        self.inner.send(channel, WsEnvelope::new(command))
    }

    /// Send a command carrying a correlation id for matching server replies.
    pub fn send_with_correlation(
        &self,
        channel: &ChannelRef,
        command: ClientCommand,
        correlation_id: impl Into<String>,
    ) -> Result<(), SyncError> {
        self.inner
            .send(channel, WsEnvelope::new(command).with_correlation(correlation_id))
    }

    /// Release one reference. Conversation transports close when the count
    /// reaches zero; the firehose closes immediately and does not reconnect.
    /// Returns the references still held.
    pub fn close(&self, channel: &ChannelRef) -> usize {
        self.inner.close(channel)
    }

    pub fn state(&self, channel: &ChannelRef) -> ConnectionState {
        self.inner
            .shared(channel)
            .map(|s| s.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self, channel: &ChannelRef) -> bool {
        self.state(channel).is_connected()
    }

    /// Watch a channel's state. `None` if the channel is not open.
    pub fn state_changes(&self, channel: &ChannelRef) -> Option<watch::Receiver<ConnectionState>> {
        self.inner.shared(channel).map(|s| s.watch_state())
    }

    pub fn conversation_refs(&self, conversation_id: &str) -> usize {
        lock(&self.inner.conversations)
            .get(conversation_id)
            .map(|e| e.refs)
            .unwrap_or(0)
    }

    /// Close every channel and wait for the workers to finish. Further opens
    /// fail with `ShutDown`.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);

        let mut tasks = Vec::new();
        if let Some(entry) = lock(&self.inner.firehose).take() {
            entry.shared.request_close();
            tasks.push(entry.task);
        }
        for (_, entry) in lock(&self.inner.conversations).drain() {
            entry.shared.request_close();
            tasks.push(entry.task);
        }
        tasks.append(&mut lock(&self.inner.closing));
        *lock(&self.inner.endpoint) = None;

        let count = tasks.len();
        for task in tasks {
            if let Err(e) = task.await {
                crate::log_error!("channel worker ended abnormally: {}", e);
            }
        }
        crate::log_info!("connection manager shut down ({} channels)", count);
    }
}

impl ManagerInner {
    fn ensure_running(&self) -> Result<(), SyncError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(SyncError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn spawn_channel(
        &self,
        channel: ChannelRef,
        url: String,
        auto_reconnect: bool,
    ) -> Result<ChannelEntry, SyncError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::TransportFailure(format!("no async runtime: {}", e)))?;

        let (shared, shutdown_rx) = ChannelShared::new(channel, url);
        let worker = ChannelWorker {
            shared: shared.clone(),
            connector: self.connector.clone(),
            dispatcher: self.dispatcher.clone(),
            reconnect: self.config.reconnect.clone(),
            auto_reconnect,
            shutdown_rx,
        };
        let task = runtime.spawn(worker.run());

        Ok(ChannelEntry {
            shared,
            task,
            refs: 1,
        })
    }

    fn shared(&self, channel: &ChannelRef) -> Option<Arc<ChannelShared>> {
        match channel {
            ChannelRef::Firehose => lock(&self.firehose).as_ref().map(|e| e.shared.clone()),
            ChannelRef::Conversation(id) => lock(&self.conversations)
                .get(id)
                .map(|e| e.shared.clone()),
        }
    }

    fn send(&self, channel: &ChannelRef, envelope: WsEnvelope<ClientCommand>) -> Result<(), SyncError> {
        let shared = self
            .shared(channel)
            .ok_or_else(|| SyncError::NotConnected(channel.to_string()))?;
        let json = serde_json::to_string(&envelope)
            .map_err(|e| SyncError::TransportFailure(format!("serialize failed: {}", e)))?;
        crate::log_debug!("sending to {}: {}", channel, json);
        shared.send_text(json)
    }

    fn close(&self, channel: &ChannelRef) -> usize {
        match channel {
            ChannelRef::Firehose => {
                if let Some(entry) = lock(&self.firehose).take() {
                    crate::log_info!("closing firehose");
                    entry.shared.request_close();
                    self.retire(entry.task);
                }
                0
            }
            ChannelRef::Conversation(id) => {
                let mut conversations = lock(&self.conversations);
                let Some(entry) = conversations.get_mut(id) else {
                    return 0;
                };
                entry.refs = entry.refs.saturating_sub(1);
                if entry.refs > 0 {
                    return entry.refs;
                }
                if let Some(entry) = conversations.remove(id) {
                    crate::log_info!("closing conversation channel {}", id);
                    entry.shared.request_close();
                    self.retire(entry.task);
                }
                0
            }
        }
    }

    fn retire(&self, task: JoinHandle<()>) {
        let mut closing = lock(&self.closing);
        closing.retain(|t| !t.is_finished());
        closing.push(task);
    }
}

/// A subscriber's reference to a conversation channel.
///
/// Resolves through the manager on every call, so it keeps working when the
/// channel is reopened after a disconnect. Each handle owns one reference;
/// use [`ConversationHandle::try_clone`] to take another.
pub struct ConversationHandle {
    conversation_id: String,
    manager: Weak<ManagerInner>,
}

impl ConversationHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn channel(&self) -> ChannelRef {
        ChannelRef::conversation(self.conversation_id.clone())
    }

    pub fn state(&self) -> ConnectionState {
        self.manager
            .upgrade()
            .and_then(|m| m.shared(&self.channel()))
            .map(|s| s.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn send(&self, command: ClientCommand) -> Result<(), SyncError> {
        let manager = self.manager.upgrade().ok_or(SyncError::ShutDown)?;
        manager.send(&self.channel(), WsEnvelope::new(command))
    }

    /// Send a chat message to this conversation.
    pub fn send_message(&self, body: &str, nonce: &str) -> Result<(), SyncError> {
        self.send(ClientCommand::MessageCreate {
            conversation_id: self.conversation_id.clone(),
            body: body.to_string(),
            nonce: nonce.to_string(),
        })
    }

    pub fn typing(&self) -> Result<(), SyncError> {
        self.send(ClientCommand::Typing {
            conversation_id: self.conversation_id.clone(),
        })
    }

    /// A second handle holding its own reference.
    pub fn try_clone(&self) -> Result<ConversationHandle, SyncError> {
        let inner = self.manager.upgrade().ok_or(SyncError::ShutDown)?;
        ConnectionManager { inner }.open_conversation(&self.conversation_id)
    }

    /// Release this subscriber's reference. Returns the references still held.
    pub fn close(self) -> usize {
        match self.manager.upgrade() {
            Some(manager) => manager.close(&self.channel()),
            None => 0,
        }
    }
}

impl std::fmt::Debug for ConversationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationHandle")
            .field("conversation_id", &self.conversation_id)
            .finish()
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, SyncError> {
    let url = Url::parse(endpoint).map_err(|e| SyncError::InvalidEndpoint(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(SyncError::InvalidEndpoint(format!(
            "unsupported scheme {:?}",
            other
        ))),
    }
}

fn channel_url(base: &Url, path: &str, credential: &Credential) -> Result<String, SyncError> {
    let mut url = base
        .join(path)
        .map_err(|e| SyncError::InvalidEndpoint(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("token", credential.expose());
    Ok(url.into())
}
