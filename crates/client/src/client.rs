//! One object wiring the sync core together.

use std::sync::Arc;

use chatsync_shared::{ApiError, SyncError};

use crate::bridge::StoreBridge;
use crate::config::SyncConfig;
use crate::dispatch::{EventDispatcher, SubscriptionGuard};
use crate::mutations::{HttpMutationTransport, MutationCoordinator, MutationTransport};
use crate::session::Session;
use crate::stores::{EntityCounterStore, MessageStore};
use crate::ws::{ConnectionManager, Connector, Credential};

/// Construct once at startup, hand clones of the parts to widgets, and call
/// [`SyncClient::shutdown`] on teardown.
pub struct SyncClient {
    config: SyncConfig,
    session: Session,
    dispatcher: EventDispatcher,
    connections: ConnectionManager,
    counters: EntityCounterStore,
    messages: MessageStore,
    coordinator: MutationCoordinator,
    _bridge: StoreBridge,
    _votes: SubscriptionGuard,
}

impl SyncClient {
    pub fn new(
        config: SyncConfig,
        session: Session,
        connector: Arc<dyn Connector>,
        transport: Arc<dyn MutationTransport>,
    ) -> Self {
        let dispatcher = EventDispatcher::new();
        let connections = ConnectionManager::new(config.clone(), connector, dispatcher.clone());
        let counters = EntityCounterStore::new(config.dedup_capacity);
        let messages = MessageStore::new();
        let bridge = StoreBridge::attach(&dispatcher, counters.clone(), messages.clone());
        let coordinator = MutationCoordinator::new(session.clone(), counters.clone(), transport);
        let votes = coordinator.track_votes(&dispatcher);

        Self {
            config,
            session,
            dispatcher,
            connections,
            counters,
            messages,
            coordinator,
            _bridge: bridge,
            _votes: votes,
        }
    }

    /// Client whose mutations go over HTTP to `config.api_base_url`.
    pub fn with_http(
        config: SyncConfig,
        session: Session,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ApiError> {
        let transport = HttpMutationTransport::new(
            config.api_base_url.clone(),
            config.request_timeout,
            session.clone(),
        )?;
        Ok(Self::new(config, session, connector, Arc::new(transport)))
    }

    /// Open the firehose.
    pub fn connect(&self, endpoint: &str, credential: Credential) -> Result<(), SyncError> {
        self.connections.open_firehose(endpoint, credential)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn counters(&self) -> &EntityCounterStore {
        &self.counters
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    /// End the session and drop all per-user state. Channels stay open.
    pub fn logout(&self) {
        self.session.logout();
        self.counters.clear();
        self.messages.clear();
        self.coordinator.clear();
    }

    pub async fn shutdown(&self) {
        self.connections.shutdown().await;
    }
}
