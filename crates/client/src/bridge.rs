//! Feeds push events into the stores.

use chatsync_shared::{ActionEvent, InboundEvent};

use crate::dispatch::{EventDispatcher, EventFilter, EventKind, SubscriptionGuard, SyncEvent};
use crate::stores::{CounterKey, EntityCounterStore, MessageStore, RemoteChange};

/// Keeps the stores subscribed for as long as it lives.
pub struct StoreBridge {
    _guards: Vec<SubscriptionGuard>,
}

impl StoreBridge {
    pub fn attach(
        dispatcher: &EventDispatcher,
        counters: EntityCounterStore,
        messages: MessageStore,
    ) -> Self {
        let counter_guard = dispatcher
            .subscribe(EventFilter::actions(), move |event| {
                if let SyncEvent::Inbound {
                    event: InboundEvent::Action(action),
                    ..
                } = event
                {
                    let outcome = counters.apply_remote_event(remote_change(action));
                    crate::log_debug!("push {} -> {:?}", action.dedup_key(), outcome);
                }
                Ok(())
            })
            .into_guard();

        let message_guard = dispatcher
            .subscribe(EventFilter::kind(EventKind::ChatMessage), move |event| {
                if let SyncEvent::Inbound {
                    event: InboundEvent::ChatMessage(msg),
                    ..
                } = event
                {
                    messages.add_message(msg.clone());
                }
                Ok(())
            })
            .into_guard();

        Self {
            _guards: vec![counter_guard, message_guard],
        }
    }
}

/// The counter change a push action describes.
pub fn remote_change(action: &ActionEvent) -> RemoteChange {
    RemoteChange {
        key: CounterKey::new(action.target.clone(), action.kind.counter_name()),
        actor: action.actor.clone(),
        delta: action.delta,
        change_id: action.change_id.clone(),
    }
}
