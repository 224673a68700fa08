//! Typed publish/subscribe registry between the connection manager and widgets.
//!
//! The connection manager publishes every successfully parsed push event and
//! every channel lifecycle transition here. Widgets and stores register
//! filtered handlers; a handler that errors or panics is logged and counted
//! without affecting the others.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chatsync_shared::{ActionKind, ChannelRef, InboundEvent, SyncError};

use crate::sync_util::lock;

/// Lifecycle transitions exposed to widgets.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

/// Everything the dispatcher delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Inbound {
        channel: ChannelRef,
        event: InboundEvent,
    },
    Lifecycle {
        channel: ChannelRef,
        event: LifecycleEvent,
    },
}

impl SyncEvent {
    pub fn channel(&self) -> &ChannelRef {
        match self {
            SyncEvent::Inbound { channel, .. } | SyncEvent::Lifecycle { channel, .. } => channel,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::Inbound { event, .. } => match event {
                InboundEvent::Action(action) => match action.kind {
                    ActionKind::Connect => EventKind::Connect,
                    ActionKind::Follow => EventKind::Follow,
                    ActionKind::Like => EventKind::Like,
                    ActionKind::Vote => EventKind::Vote,
                    ActionKind::Subscribe => EventKind::Subscribe,
                    ActionKind::Reaction(_) => EventKind::Reaction,
                },
                InboundEvent::ChatMessage(_) => EventKind::ChatMessage,
                InboundEvent::ChatControl(_) => EventKind::ChatControl,
            },
            SyncEvent::Lifecycle { .. } => EventKind::Lifecycle,
        }
    }

    /// Entity the event targets, if any.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            SyncEvent::Inbound { event, .. } => event.entity_id(),
            SyncEvent::Lifecycle { .. } => None,
        }
    }
}

/// Coarse event classification used by filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Follow,
    Like,
    Vote,
    Subscribe,
    Reaction,
    ChatMessage,
    ChatControl,
    Lifecycle,
}

impl EventKind {
    pub fn is_action(self) -> bool {
        matches!(
            self,
            EventKind::Connect
                | EventKind::Follow
                | EventKind::Like
                | EventKind::Vote
                | EventKind::Subscribe
                | EventKind::Reaction
        )
    }
}

/// Subscription predicate. Unset fields match anything; set fields must all match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    kinds: Option<Vec<EventKind>>,
    actions_only: bool,
    entity_id: Option<String>,
    channel: Option<ChannelRef>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(kind: EventKind) -> Self {
        Self::default().or_kind(kind)
    }

    /// Every counter-moving action, whatever its kind.
    pub fn actions() -> Self {
        Self {
            actions_only: true,
            ..Self::default()
        }
    }

    /// Lifecycle events of one channel.
    pub fn lifecycle(channel: ChannelRef) -> Self {
        Self::kind(EventKind::Lifecycle).on_channel(channel)
    }

    pub fn or_kind(mut self, kind: EventKind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn on_channel(mut self, channel: ChannelRef) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn matches(&self, event: &SyncEvent) -> bool {
        let kind = event.kind();
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&kind) {
                return false;
            }
        }
        if self.actions_only && !kind.is_action() {
            return false;
        }
        if let Some(entity) = &self.entity_id {
            if event.entity_id() != Some(entity.as_str()) {
                return false;
            }
        }
        if let Some(channel) = &self.channel {
            if event.channel() != channel {
                return false;
            }
        }
        true
    }
}

pub type Handler = Arc<dyn Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    filter: EventFilter,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Registration>>,
    published: AtomicU64,
    delivered: AtomicU64,
    malformed: AtomicU64,
    handler_failures: AtomicU64,
}

impl Registry {
    fn remove(&self, id: u64) -> bool {
        lock(&self.entries).remove(&id).is_some()
    }
}

/// Point-in-time dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub published: u64,
    pub delivered: u64,
    pub malformed: u64,
    pub handler_failures: u64,
}

/// Handle to one registration. Cloning does not duplicate the registration.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: u64,
    registry: Weak<Registry>,
}

impl SubscriptionHandle {
    /// Remove the registration. Returns `false` if it was already removed.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.id),
            None => false,
        }
    }

    /// Tie the registration to the returned guard's lifetime.
    pub fn into_guard(self) -> SubscriptionGuard {
        SubscriptionGuard {
            handle: self,
            armed: true,
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").field("id", &self.id).finish()
    }
}

/// Unsubscribes when dropped. Widgets keep these alongside their own state so
/// destroying the widget releases its handlers.
#[derive(Debug)]
pub struct SubscriptionGuard {
    handle: SubscriptionHandle,
    armed: bool,
}

impl SubscriptionGuard {
    /// Keep the registration alive past the guard.
    pub fn detach(mut self) -> SubscriptionHandle {
        self.armed = false;
        self.handle.clone()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.handle.unsubscribe();
        }
    }
}

#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Registry>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionHandle
    where
        F: Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.registry.entries).insert(
            id,
            Registration {
                filter,
                handler: Arc::new(handler),
            },
        );
        SubscriptionHandle {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Idempotent: removing an already removed handle is a no-op returning `false`.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        handle.unsubscribe()
    }

    /// Deliver `event` to every matching handler. Returns how many handlers ran
    /// successfully.
    pub fn publish(&self, event: SyncEvent) -> usize {
        self.registry.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot under the lock so handlers may (un)subscribe re-entrantly.
        let handlers: Vec<Handler> = lock(&self.registry.entries)
            .values()
            .filter(|r| r.filter.matches(&event))
            .map(|r| r.handler.clone())
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    self.registry.handler_failures.fetch_add(1, Ordering::Relaxed);
                    crate::log_warn!("event handler failed for {:?}: {:#}", event.kind(), e);
                }
                Err(_) => {
                    self.registry.handler_failures.fetch_add(1, Ordering::Relaxed);
                    crate::log_error!("event handler panicked for {:?}", event.kind());
                }
            }
        }
        self.registry
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub(crate) fn publish_lifecycle(&self, channel: &ChannelRef, event: LifecycleEvent) {
        self.publish(SyncEvent::Lifecycle {
            channel: channel.clone(),
            event,
        });
    }

    /// Count and log a payload that failed structural validation. Subscribers
    /// never see it.
    pub fn record_malformed(&self, channel: &ChannelRef, error: &SyncError) {
        self.registry.malformed.fetch_add(1, Ordering::Relaxed);
        crate::log_warn!("dropping malformed payload on {}: {}", channel, error);
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.registry.entries).len()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            published: self.registry.published.load(Ordering::Relaxed),
            delivered: self.registry.delivered.load(Ordering::Relaxed),
            malformed: self.registry.malformed.load(Ordering::Relaxed),
            handler_failures: self.registry.handler_failures.load(Ordering::Relaxed),
        }
    }
}
