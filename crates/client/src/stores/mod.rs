//! Client-side stores for synchronized state.

pub mod counters;
pub mod messages;

pub use counters::{
    Confirmation, CounterChange, CounterKey, CounterView, EntityCounterStore, MutationId,
    MutationStatus, PendingMutation, RemoteChange, RemoteOutcome, Resolution,
};
pub use messages::{ConversationMessages, MessageStore};
