//! Entity counter store.
//!
//! Holds the last server-known value of every (entity, counter) pair together
//! with locally pending optimistic mutations, and merges push-origin changes
//! into the same state. A viewer always reads
//! `server_value + own in-flight delta`; other actors' pending deltas are never
//! visible.
//!
//! Push merges are idempotent: a change id is remembered in a bounded window,
//! and per-actor membership marks (the last applied direction) reject a
//! repeated toggle even when no change id is sent.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chatsync_shared::SyncError;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::sync_util::lock;

const CHANGE_FEED_CAPACITY: usize = 256;

/// Addresses one counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub entity_id: String,
    pub counter: String,
}

impl CounterKey {
    pub fn new(entity_id: impl Into<String>, counter: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            counter: counter.into(),
        }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_id, self.counter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationId(Uuid);

impl MutationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for MutationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    InFlight,
    Confirmed,
    /// A push for the same change arrived before the HTTP response.
    ConfirmedByRace,
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub id: MutationId,
    pub key: CounterKey,
    pub actor: String,
    pub delta: i64,
    /// Value the actor saw before the mutation.
    pub snapshot: i64,
    /// Value shown while in flight.
    pub optimistic: i64,
    /// Counter version when the mutation began.
    pub base_version: u64,
    pub status: MutationStatus,
}

impl PendingMutation {
    /// Direction the mutation moves the actor's membership.
    pub fn activates(&self) -> bool {
        self.delta > 0
    }
}

/// What the server reported for a successful mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Confirmation {
    /// Resulting membership flag (liked, following, voted...).
    pub active: Option<bool>,
    /// Absolute counter value after the mutation.
    pub server_value: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The optimistic value stands.
    Confirmed { value: i64, active: bool },
    /// The server disagreed with the optimistic projection and won.
    Corrected { value: i64, active: bool },
    /// A push already resolved the mutation; nothing applied.
    AlreadyResolved { value: i64, active: bool },
    RolledBack { value: i64, active: bool },
    /// No such mutation (already resolved, or store cleared).
    Unknown,
}

impl Resolution {
    pub fn value(&self) -> Option<i64> {
        match self {
            Resolution::Confirmed { value, .. }
            | Resolution::Corrected { value, .. }
            | Resolution::AlreadyResolved { value, .. }
            | Resolution::RolledBack { value, .. } => Some(*value),
            Resolution::Unknown => None,
        }
    }
}

/// A push-origin change to one counter.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub key: CounterKey,
    pub actor: String,
    pub delta: i64,
    pub change_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    Applied { value: i64 },
    Duplicate,
    /// Applied, and it settled the actor's in-flight mutation.
    ResolvedPending { id: MutationId, value: i64 },
    Ignored,
}

/// Broadcast whenever a counter's server value or a membership mark moves.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterChange {
    pub key: CounterKey,
    pub server_value: i64,
    pub version: u64,
}

/// What a widget renders for one viewer.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterView {
    pub key: CounterKey,
    pub value: i64,
    pub active: bool,
    pub pending: bool,
}

#[derive(Debug, Default)]
struct CounterEntry {
    server_value: i64,
    version: u64,
    /// Last applied direction per actor.
    marks: HashMap<String, bool>,
    in_flight: HashMap<String, MutationId>,
}

struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns false if the key was already seen.
    fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

struct StoreState {
    counters: HashMap<CounterKey, CounterEntry>,
    /// InFlight and ConfirmedByRace mutations awaiting their HTTP response.
    mutations: HashMap<MutationId, PendingMutation>,
    dedup: DedupWindow,
}

impl StoreState {
    fn display(&self, key: &CounterKey, viewer: Option<&str>) -> i64 {
        let Some(entry) = self.counters.get(key) else {
            return 0;
        };
        let pending = viewer
            .and_then(|v| entry.in_flight.get(v))
            .and_then(|id| self.mutations.get(id))
            .map(|m| m.delta)
            .unwrap_or(0);
        entry.server_value + pending
    }

    fn active(&self, key: &CounterKey, viewer: &str) -> bool {
        let Some(entry) = self.counters.get(key) else {
            return false;
        };
        match entry.in_flight.get(viewer).and_then(|id| self.mutations.get(id)) {
            Some(m) => m.activates(),
            None => entry.marks.get(viewer).copied().unwrap_or(false),
        }
    }
}

/// Shared counter store. Cheap to clone.
#[derive(Clone)]
pub struct EntityCounterStore {
    state: Arc<Mutex<StoreState>>,
    changes: broadcast::Sender<CounterChange>,
}

impl EntityCounterStore {
    pub fn new(dedup_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(StoreState {
                counters: HashMap::new(),
                mutations: HashMap::new(),
                dedup: DedupWindow::new(dedup_capacity),
            })),
            changes,
        }
    }

    /// Load a server value (page render, REST fetch).
    pub fn seed(&self, key: CounterKey, value: i64) {
        let change = {
            let mut state = lock(&self.state);
            let entry = state.counters.entry(key.clone()).or_default();
            entry.server_value = value;
            entry.version += 1;
            CounterChange {
                key,
                server_value: value,
                version: entry.version,
            }
        };
        self.notify(change);
    }

    /// Load an actor's known membership (already liked, already voted...).
    pub fn seed_active(&self, key: CounterKey, actor: &str, active: bool) {
        let mut state = lock(&self.state);
        state
            .counters
            .entry(key)
            .or_default()
            .marks
            .insert(actor.to_string(), active);
    }

    /// Displayed value for `viewer`: server value plus the viewer's own
    /// in-flight delta. `None` reads the bare server value.
    pub fn read(&self, key: &CounterKey, viewer: Option<&str>) -> i64 {
        lock(&self.state).display(key, viewer)
    }

    /// Whether `viewer`'s membership is active, counting an in-flight toggle.
    pub fn is_active(&self, key: &CounterKey, viewer: &str) -> bool {
        lock(&self.state).active(key, viewer)
    }

    pub fn view(&self, key: &CounterKey, viewer: &str) -> CounterView {
        let state = lock(&self.state);
        let pending = state
            .counters
            .get(key)
            .map(|e| e.in_flight.contains_key(viewer))
            .unwrap_or(false);
        CounterView {
            key: key.clone(),
            value: state.display(key, Some(viewer)),
            active: state.active(key, viewer),
            pending,
        }
    }

    pub fn version(&self, key: &CounterKey) -> u64 {
        lock(&self.state)
            .counters
            .get(key)
            .map(|e| e.version)
            .unwrap_or(0)
    }

    /// The actor's in-flight mutation on `key`, if any.
    pub fn pending(&self, key: &CounterKey, actor: &str) -> Option<PendingMutation> {
        let state = lock(&self.state);
        let id = state.counters.get(key)?.in_flight.get(actor)?;
        state.mutations.get(id).cloned()
    }

    /// Status of a mutation still awaiting its HTTP response. Resolved
    /// mutations are forgotten.
    pub fn status(&self, id: MutationId) -> Option<MutationStatus> {
        lock(&self.state).mutations.get(&id).map(|m| m.status)
    }

    /// Record an optimistic mutation. At most one per (counter, actor).
    pub fn begin(
        &self,
        key: CounterKey,
        actor: &str,
        delta: i64,
    ) -> Result<PendingMutation, SyncError> {
        let mut state = lock(&self.state);
        if state
            .counters
            .get(&key)
            .is_some_and(|e| e.in_flight.contains_key(actor))
        {
            return Err(SyncError::MutationInFlight);
        }

        let snapshot = state.display(&key, Some(actor));
        let entry = state.counters.entry(key.clone()).or_default();
        let mutation = PendingMutation {
            id: MutationId::new(),
            key,
            actor: actor.to_string(),
            delta,
            snapshot,
            optimistic: snapshot + delta,
            base_version: entry.version,
            status: MutationStatus::InFlight,
        };
        entry.in_flight.insert(mutation.actor.clone(), mutation.id);
        state.mutations.insert(mutation.id, mutation.clone());

        crate::log_debug!(
            "mutation {} on {} by {}: {} -> {}",
            mutation.id,
            mutation.key,
            actor,
            snapshot,
            mutation.optimistic
        );
        Ok(mutation)
    }

    /// Settle a mutation the server accepted. The server wins on conflict.
    pub fn apply_server_confirmation(&self, id: MutationId, truth: Confirmation) -> Resolution {
        let (resolution, change) = {
            let mut state = lock(&self.state);
            let Some(mutation) = state.mutations.remove(&id) else {
                return Resolution::Unknown;
            };

            if mutation.status == MutationStatus::ConfirmedByRace {
                let value = state.display(&mutation.key, Some(&mutation.actor));
                let active = state.active(&mutation.key, &mutation.actor);
                crate::log_debug!("mutation {} already settled by push", id);
                return Resolution::AlreadyResolved { value, active };
            }

            let entry = state.counters.entry(mutation.key.clone()).or_default();
            entry.in_flight.remove(&mutation.actor);

            let intended = mutation.activates();
            let active = truth.active.unwrap_or(intended);
            let before = entry.server_value;
            let agreed = before + mutation.delta;
            if active == intended {
                entry.server_value = agreed;
            }
            entry.marks.insert(mutation.actor.clone(), active);

            // An absolute count is only trusted if nothing merged meanwhile.
            if let Some(count) = truth.server_value {
                if entry.version == mutation.base_version {
                    entry.server_value = count;
                }
            }
            if entry.server_value != before {
                entry.version += 1;
            }

            let value = entry.server_value;
            let change = CounterChange {
                key: mutation.key.clone(),
                server_value: value,
                version: entry.version,
            };
            // Pushes merged while in flight are not a correction.
            let resolution = if active == intended && value == agreed {
                Resolution::Confirmed { value, active }
            } else {
                crate::log_info!(
                    "mutation {} on {} corrected by server: {} -> {}",
                    id,
                    mutation.key,
                    mutation.optimistic,
                    value
                );
                Resolution::Corrected { value, active }
            };
            (resolution, change)
        };
        self.notify(change);
        resolution
    }

    /// Roll a mutation back to the server-known value.
    pub fn apply_rejection(&self, id: MutationId) -> Resolution {
        let (resolution, change) = {
            let mut state = lock(&self.state);
            let Some(mutation) = state.mutations.remove(&id) else {
                return Resolution::Unknown;
            };

            if mutation.status == MutationStatus::ConfirmedByRace {
                let value = state.display(&mutation.key, Some(&mutation.actor));
                let active = state.active(&mutation.key, &mutation.actor);
                return Resolution::AlreadyResolved { value, active };
            }

            let entry = state.counters.entry(mutation.key.clone()).or_default();
            entry.in_flight.remove(&mutation.actor);
            let value = entry.server_value;
            let active = entry.marks.get(&mutation.actor).copied().unwrap_or(false);
            crate::log_info!(
                "mutation {} on {} rolled back: {} -> {}",
                id,
                mutation.key,
                mutation.optimistic,
                value
            );
            (
                Resolution::RolledBack { value, active },
                CounterChange {
                    key: mutation.key,
                    server_value: value,
                    version: entry.version,
                },
            )
        };
        self.notify(change);
        resolution
    }

    /// Merge a push-origin change.
    pub fn apply_remote_event(&self, change: RemoteChange) -> RemoteOutcome {
        if change.delta == 0 {
            return RemoteOutcome::Ignored;
        }
        let direction = change.delta > 0;

        let (outcome, notify) = {
            let mut state = lock(&self.state);

            if let Some(change_id) = &change.change_id {
                let dedup_key = format!("{}|{}|{}", change.key, change.actor, change_id);
                if !state.dedup.insert(dedup_key) {
                    crate::log_debug!("duplicate push {} on {}", change_id, change.key);
                    return RemoteOutcome::Duplicate;
                }
            }

            let StoreState {
                counters,
                mutations,
                ..
            } = &mut *state;
            let entry = counters.entry(change.key.clone()).or_default();

            // Race: a push for the actor's own in-flight change settles it.
            let raced = entry
                .in_flight
                .get(&change.actor)
                .copied()
                .filter(|id| mutations.get(id).is_some_and(|m| m.activates() == direction));

            if raced.is_none() && entry.marks.get(&change.actor) == Some(&direction) {
                crate::log_debug!(
                    "push on {} by {} already reflected",
                    change.key,
                    change.actor
                );
                return RemoteOutcome::Duplicate;
            }

            entry.server_value += change.delta;
            entry.version += 1;
            entry.marks.insert(change.actor.clone(), direction);

            let value = entry.server_value;
            let outcome = match raced {
                Some(id) => {
                    entry.in_flight.remove(&change.actor);
                    if let Some(m) = mutations.get_mut(&id) {
                        m.status = MutationStatus::ConfirmedByRace;
                    }
                    crate::log_debug!("mutation {} confirmed by push", id);
                    RemoteOutcome::ResolvedPending { id, value }
                }
                None => RemoteOutcome::Applied { value },
            };
            (
                outcome,
                CounterChange {
                    key: change.key,
                    server_value: value,
                    version: entry.version,
                },
            )
        };
        self.notify(notify);
        outcome
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<CounterChange> {
        self.changes.subscribe()
    }

    /// Drop a counter no widget displays any more. Counters with a mutation
    /// in flight are kept; returns whether the counter was dropped.
    pub fn forget(&self, key: &CounterKey) -> bool {
        let mut state = lock(&self.state);
        match state.counters.get(key) {
            Some(entry) if entry.in_flight.is_empty() => {
                state.counters.remove(key);
                crate::log_debug!("forgot counter {}", key);
                true
            }
            _ => false,
        }
    }

    /// Number of counters held.
    pub fn tracked(&self) -> usize {
        lock(&self.state).counters.len()
    }

    /// Forget everything, including in-flight mutations.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.counters.clear();
        state.mutations.clear();
        state.dedup.clear();
    }

    fn notify(&self, change: CounterChange) {
        // No receivers is fine.
        let _ = self.changes.send(change);
    }
}
