//! Chatsync Client - real-time sync core
//!
//! Keeps social counters and chat timelines in sync from two sources: push
//! events on persistent WebSocket channels, and the user's own optimistic
//! mutations over HTTP.

pub mod logging;

pub mod bridge;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod mutations;
pub mod session;
pub mod stores;
pub mod ws;

mod sync_util;

pub use bridge::StoreBridge;
pub use client::SyncClient;
pub use config::{ReconnectConfig, SyncConfig};
pub use dispatch::{
    DispatchStats, EventDispatcher, EventFilter, EventKind, LifecycleEvent, SubscriptionGuard,
    SubscriptionHandle, SyncEvent,
};
pub use mutations::{MutationCoordinator, MutationKind, MutationOutcome, Widget};
pub use session::{AuthSession, Session};
pub use stores::{CounterKey, CounterView, EntityCounterStore, MessageStore};
pub use ws::{ConnectionManager, ConnectionState, ConversationHandle, Credential};
