//! Optimistic mutation protocol shared by every counter widget.
//!
//! A call runs the same steps for follow, like, subscribe, reaction and poll
//! votes: guard on the session, guard on an in-flight mutation, write the
//! optimistic value, call the transport, then reconcile. Reconciliation runs
//! on its own task, so dropping the caller or the widget never loses a
//! response; rendering to a dropped widget is skipped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chatsync_shared::{ActionEvent, ActionKind, InboundEvent, SyncError};
use serde_json::json;

use super::transport::{MutationCall, MutationMethod, MutationResponse, MutationTransport};
use crate::dispatch::{EventDispatcher, EventFilter, EventKind, SubscriptionGuard, SyncEvent};
use crate::session::Session;
use crate::stores::{
    Confirmation, CounterKey, CounterView, EntityCounterStore, PendingMutation, Resolution,
};
use crate::sync_util::lock;

const GENERIC_FAILURE: &str = "Something went wrong, please try again later.";

/// A widget the coordinator renders into. Held weakly while a mutation is in
/// flight.
pub trait Widget: Send + Sync {
    fn render(&self, view: &CounterView);

    /// Transient failure notice.
    fn show_failure(&self, _message: &str) {}

    /// Out-of-band authentication prompt.
    fn request_authentication(&self) {}
}

/// Boolean toggles. Poll votes go through [`MutationCoordinator::vote`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Follow,
    Like,
    Subscribe,
    Reaction(String),
}

impl MutationKind {
    pub fn action(&self) -> ActionKind {
        match self {
            MutationKind::Follow => ActionKind::Follow,
            MutationKind::Like => ActionKind::Like,
            MutationKind::Subscribe => ActionKind::Subscribe,
            MutationKind::Reaction(key) => ActionKind::Reaction(key.clone()),
        }
    }

    pub fn counter_key(&self, entity_id: &str) -> CounterKey {
        CounterKey::new(entity_id, self.action().counter_name())
    }

    /// Response field carrying the resulting flag.
    fn active_field(&self) -> &'static str {
        match self {
            MutationKind::Follow => "following",
            MutationKind::Like => "liked",
            MutationKind::Subscribe => "subscribed",
            MutationKind::Reaction(_) => "reacted",
        }
    }

    fn call(&self, entity_id: &str, activate: bool) -> MutationCall {
        let id = urlencoding::encode(entity_id);
        let action = if activate { "add" } else { "remove" };
        let (path, body) = match self {
            MutationKind::Follow => (format!("/api/users/{id}/follow"), json!({ "action": action })),
            MutationKind::Like => (format!("/api/posts/{id}/likes"), json!({ "action": action })),
            MutationKind::Subscribe => (
                format!("/api/topics/{id}/subscribe"),
                json!({ "action": action }),
            ),
            MutationKind::Reaction(key) => (
                format!("/api/messages/{id}/reactions"),
                json!({ "action": action, "reaction": key }),
            ),
        };
        MutationCall {
            method: MutationMethod::Post,
            path,
            body,
        }
    }
}

/// How a coordinator call resolved. Every call ends in one of these; nothing
/// is raised to the widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// No session; nothing sent.
    Unauthenticated,
    /// Another mutation for this entity and actor is in flight; nothing sent.
    AlreadyPending,
    /// The actor's vote on this poll is final; nothing sent.
    AlreadyVoted,
    Confirmed { value: i64, active: bool },
    /// Accepted, but the server's state differed from the optimistic one.
    Corrected { value: i64, active: bool },
    /// A push for the same change arrived first.
    ConfirmedByRace { value: i64, active: bool },
    Rejected { message: String },
    Unverified,
    TransportFailure { message: String },
    /// The store was cleared while the request was in flight.
    Discarded,
}

impl MutationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            MutationOutcome::Confirmed { .. }
                | MutationOutcome::Corrected { .. }
                | MutationOutcome::ConfirmedByRace { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Ballot {
    Pending(String),
    Locked(String),
}

type BallotKey = (String, String);
type Ballots = Arc<Mutex<HashMap<BallotKey, Ballot>>>;

struct Flight {
    mutation: PendingMutation,
    call: MutationCall,
    active_field: &'static str,
    count_fields: [String; 2],
    /// (actor, poll) and the chosen option, for votes.
    ballot: Option<(BallotKey, String)>,
}

#[derive(Clone)]
pub struct MutationCoordinator {
    session: Session,
    store: EntityCounterStore,
    transport: Arc<dyn MutationTransport>,
    ballots: Ballots,
}

impl MutationCoordinator {
    pub fn new(
        session: Session,
        store: EntityCounterStore,
        transport: Arc<dyn MutationTransport>,
    ) -> Self {
        Self {
            session,
            store,
            transport,
            ballots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &EntityCounterStore {
        &self.store
    }

    /// Toggle the session actor's membership on `entity_id`.
    pub async fn toggle(
        &self,
        kind: MutationKind,
        entity_id: &str,
        widget: &Arc<dyn Widget>,
    ) -> MutationOutcome {
        let Some(actor) = self.session.identity() else {
            crate::log_debug!("{:?} on {} without a session", kind, entity_id);
            widget.request_authentication();
            return MutationOutcome::Unauthenticated;
        };

        let key = kind.counter_key(entity_id);
        let activate = !self.store.is_active(&key, &actor);
        let delta = if activate { 1 } else { -1 };
        let mutation = match self.store.begin(key.clone(), &actor, delta) {
            Ok(m) => m,
            Err(SyncError::MutationInFlight) => return MutationOutcome::AlreadyPending,
            Err(e) => {
                return MutationOutcome::TransportFailure {
                    message: e.to_string(),
                }
            }
        };
        widget.render(&self.store.view(&key, &actor));

        let flight = Flight {
            call: kind.call(entity_id, activate),
            active_field: kind.active_field(),
            count_fields: ["count".to_string(), key.counter.clone()],
            mutation,
            ballot: None,
        };
        self.fly(flight, widget).await
    }

    /// Cast the session actor's single vote on a poll. Votes cannot be changed
    /// once confirmed.
    pub async fn vote(
        &self,
        poll_id: &str,
        option_id: &str,
        widget: &Arc<dyn Widget>,
    ) -> MutationOutcome {
        let Some(actor) = self.session.identity() else {
            widget.request_authentication();
            return MutationOutcome::Unauthenticated;
        };

        let key = CounterKey::new(option_id, ActionKind::Vote.counter_name());
        let ballot_key = (actor.clone(), poll_id.to_string());
        let mutation = {
            let mut ballots = lock(&self.ballots);
            match ballots.get(&ballot_key) {
                Some(Ballot::Locked(_)) => return MutationOutcome::AlreadyVoted,
                Some(Ballot::Pending(_)) => return MutationOutcome::AlreadyPending,
                None => {}
            }
            let mutation = match self.store.begin(key.clone(), &actor, 1) {
                Ok(m) => m,
                Err(_) => return MutationOutcome::AlreadyPending,
            };
            ballots.insert(ballot_key.clone(), Ballot::Pending(option_id.to_string()));
            mutation
        };
        widget.render(&self.store.view(&key, &actor));

        let flight = Flight {
            call: MutationCall {
                method: MutationMethod::Patch,
                path: format!("/api/polls/{}/votes", urlencoding::encode(poll_id)),
                body: json!({ "option": option_id }),
            },
            active_field: "voted",
            count_fields: ["count".to_string(), key.counter.clone()],
            mutation,
            ballot: Some((ballot_key, option_id.to_string())),
        };
        self.fly(flight, widget).await
    }

    /// Record a vote known from the initial page load.
    pub fn record_vote(&self, actor: &str, poll_id: &str, option_id: &str) {
        lock(&self.ballots).insert(
            (actor.to_string(), poll_id.to_string()),
            Ballot::Locked(option_id.to_string()),
        );
        self.store.seed_active(
            CounterKey::new(option_id, ActionKind::Vote.counter_name()),
            actor,
            true,
        );
    }

    /// Lock ballots from vote pushes, so a vote cast in another session
    /// blocks new votes here.
    pub fn track_votes(&self, dispatcher: &EventDispatcher) -> SubscriptionGuard {
        let coordinator = self.clone();
        dispatcher
            .subscribe(EventFilter::kind(EventKind::Vote), move |event| {
                if let SyncEvent::Inbound {
                    event: InboundEvent::Action(action),
                    ..
                } = event
                {
                    coordinator.observe_vote(action);
                }
                Ok(())
            })
            .into_guard()
    }

    /// Lock the session actor's ballot if `action` is one of their votes.
    pub fn observe_vote(&self, action: &ActionEvent) {
        if action.kind != ActionKind::Vote || action.delta <= 0 {
            return;
        }
        let Some(poll_id) = action.parent.as_deref() else {
            return;
        };
        if self.session.identity().as_deref() != Some(action.actor.as_str()) {
            return;
        }
        let mut ballots = lock(&self.ballots);
        let key = (action.actor.clone(), poll_id.to_string());
        if !matches!(ballots.get(&key), Some(Ballot::Locked(_))) {
            crate::log_debug!("vote on {} locked by push for {}", poll_id, action.actor);
            ballots.insert(key, Ballot::Locked(action.target.clone()));
        }
    }

    /// The option the actor's vote on `poll_id` is locked to.
    pub fn voted_option(&self, actor: &str, poll_id: &str) -> Option<String> {
        match lock(&self.ballots).get(&(actor.to_string(), poll_id.to_string())) {
            Some(Ballot::Locked(option)) => Some(option.clone()),
            _ => None,
        }
    }

    /// Forget ballots, e.g. on logout.
    pub fn clear(&self) {
        lock(&self.ballots).clear();
    }

    async fn fly(&self, flight: Flight, widget: &Arc<dyn Widget>) -> MutationOutcome {
        let store = self.store.clone();
        let transport = self.transport.clone();
        let ballots = self.ballots.clone();
        let widget = Arc::downgrade(widget);

        let id = flight.mutation.id;
        let task = tokio::spawn(async move {
            let response = transport.execute(&flight.call).await;
            resolve(&store, &ballots, &widget, flight, response)
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                crate::log_error!("mutation {} task failed: {}", id, e);
                self.store.apply_rejection(id);
                MutationOutcome::TransportFailure {
                    message: GENERIC_FAILURE.to_string(),
                }
            }
        }
    }
}

fn resolve(
    store: &EntityCounterStore,
    ballots: &Ballots,
    widget: &Weak<dyn Widget>,
    flight: Flight,
    response: Result<MutationResponse, chatsync_shared::ApiError>,
) -> MutationOutcome {
    let Flight {
        mutation,
        active_field,
        count_fields,
        ballot,
        ..
    } = flight;

    let outcome = match response {
        Ok(resp) if resp.unverified => unverified(store, &mutation, widget),
        Ok(resp) if resp.success => {
            let fields: Vec<&str> = count_fields.iter().map(String::as_str).collect();
            let truth = Confirmation {
                active: resp.flag(active_field),
                server_value: resp.count(&fields),
            };
            match store.apply_server_confirmation(mutation.id, truth) {
                Resolution::Confirmed { value, active } => MutationOutcome::Confirmed { value, active },
                Resolution::Corrected { value, active } => MutationOutcome::Corrected { value, active },
                Resolution::AlreadyResolved { value, active } => {
                    MutationOutcome::ConfirmedByRace { value, active }
                }
                Resolution::RolledBack { .. } | Resolution::Unknown => MutationOutcome::Discarded,
            }
        }
        Ok(resp) => {
            let message = resp
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| GENERIC_FAILURE.to_string());
            fail(store, &mutation, widget, MutationOutcome::Rejected { message })
        }
        Err(e) => match SyncError::from(e) {
            SyncError::Unverified => unverified(store, &mutation, widget),
            other => {
                crate::log_warn!("mutation {} transport error: {}", mutation.id, other);
                fail(
                    store,
                    &mutation,
                    widget,
                    MutationOutcome::TransportFailure {
                        message: GENERIC_FAILURE.to_string(),
                    },
                )
            }
        },
    };

    if let Some((key, option)) = ballot {
        let mut ballots = lock(ballots);
        match &outcome {
            MutationOutcome::Confirmed { active: true, .. }
            | MutationOutcome::Corrected { active: true, .. }
            | MutationOutcome::ConfirmedByRace { active: true, .. } => {
                ballots.insert(key, Ballot::Locked(option));
            }
            // A lock taken from a push while in flight stays.
            _ => {
                if matches!(ballots.get(&key), Some(Ballot::Pending(_))) {
                    ballots.remove(&key);
                }
            }
        }
    }

    crate::log_info!("mutation {} on {}: {:?}", mutation.id, mutation.key, outcome);
    if let Some(widget) = widget.upgrade() {
        widget.render(&store.view(&mutation.key, &mutation.actor));
    }
    outcome
}

fn unverified(
    store: &EntityCounterStore,
    mutation: &PendingMutation,
    widget: &Weak<dyn Widget>,
) -> MutationOutcome {
    match store.apply_rejection(mutation.id) {
        Resolution::AlreadyResolved { value, active } => {
            MutationOutcome::ConfirmedByRace { value, active }
        }
        _ => {
            if let Some(widget) = widget.upgrade() {
                widget.request_authentication();
            }
            MutationOutcome::Unverified
        }
    }
}

fn fail(
    store: &EntityCounterStore,
    mutation: &PendingMutation,
    widget: &Weak<dyn Widget>,
    outcome: MutationOutcome,
) -> MutationOutcome {
    match store.apply_rejection(mutation.id) {
        // The push already made it real; no notice.
        Resolution::AlreadyResolved { value, active } => {
            MutationOutcome::ConfirmedByRace { value, active }
        }
        _ => {
            if let (Some(widget), MutationOutcome::Rejected { message }
            | MutationOutcome::TransportFailure { message }) = (widget.upgrade(), &outcome)
            {
                widget.show_failure(message);
            }
            outcome
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatsync_shared::{decode_inbound, ApiError, ChannelRef};
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<Result<MutationResponse, ApiError>>>,
        calls: Mutex<Vec<MutationCall>>,
    }

    impl Scripted {
        fn with(responses: Vec<Result<MutationResponse, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<MutationCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MutationTransport for Scripted {
        async fn execute(&self, call: &MutationCall) -> Result<MutationResponse, ApiError> {
            self.calls.lock().unwrap().push(call.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::Network("no scripted response".into())))
        }
    }

    #[derive(Default)]
    struct Recorder {
        renders: Mutex<Vec<CounterView>>,
        failures: Mutex<Vec<String>>,
        auth_prompts: Mutex<u32>,
    }

    impl Widget for Recorder {
        fn render(&self, view: &CounterView) {
            self.renders.lock().unwrap().push(view.clone());
        }
        fn show_failure(&self, message: &str) {
            self.failures.lock().unwrap().push(message.to_string());
        }
        fn request_authentication(&self) {
            *self.auth_prompts.lock().unwrap() += 1;
        }
    }

    fn setup(
        responses: Vec<Result<MutationResponse, ApiError>>,
    ) -> (MutationCoordinator, Arc<Scripted>, Arc<Recorder>, Arc<dyn Widget>) {
        let transport = Scripted::with(responses);
        let store = EntityCounterStore::new(64);
        store.seed(CounterKey::new("post-42", "likes"), 10);
        let coordinator = MutationCoordinator::new(
            Session::authenticated("alice", None),
            store,
            transport.clone(),
        );
        let recorder = Arc::new(Recorder::default());
        let widget: Arc<dyn Widget> = recorder.clone();
        (coordinator, transport, recorder, widget)
    }

    fn likes() -> CounterKey {
        CounterKey::new("post-42", "likes")
    }

    #[tokio::test]
    async fn unauthenticated_makes_no_call() {
        let (coordinator, transport, recorder, widget) = setup(vec![]);
        coordinator.session.logout();

        let outcome = coordinator.toggle(MutationKind::Like, "post-42", &widget).await;
        assert_eq!(outcome, MutationOutcome::Unauthenticated);
        assert!(transport.calls().is_empty());
        assert_eq!(*recorder.auth_prompts.lock().unwrap(), 1);
        assert_eq!(coordinator.store().read(&likes(), Some("alice")), 10);
    }

    #[tokio::test]
    async fn like_renders_optimistically_then_confirms() {
        let (coordinator, transport, recorder, widget) =
            setup(vec![Ok(MutationResponse::ok().with_field("liked", true))]);

        let outcome = coordinator.toggle(MutationKind::Like, "post-42", &widget).await;
        assert_eq!(outcome, MutationOutcome::Confirmed { value: 11, active: true });

        let renders = recorder.renders.lock().unwrap().clone();
        assert_eq!(renders.len(), 2);
        assert_eq!((renders[0].value, renders[0].pending), (11, true));
        assert_eq!((renders[1].value, renders[1].pending), (11, false));

        let calls = transport.calls();
        assert_eq!(calls[0].path, "/api/posts/post-42/likes");
        assert_eq!(calls[0].body["action"], "add");
    }

    #[tokio::test]
    async fn second_toggle_unlikes() {
        let (coordinator, transport, _recorder, widget) = setup(vec![
            Ok(MutationResponse::ok().with_field("liked", true)),
            Ok(MutationResponse::ok().with_field("liked", false)),
        ]);
        coordinator.toggle(MutationKind::Like, "post-42", &widget).await;
        let outcome = coordinator.toggle(MutationKind::Like, "post-42", &widget).await;

        assert_eq!(outcome, MutationOutcome::Confirmed { value: 10, active: false });
        assert_eq!(transport.calls()[1].body["action"], "remove");
    }

    #[tokio::test]
    async fn server_direction_wins() {
        // Local state assumed "not following"; server says the follow was
        // removed instead.
        let (coordinator, _transport, recorder, widget) =
            setup(vec![Ok(MutationResponse::ok().with_field("following", false))]);
        let key = MutationKind::Follow.counter_key("bob");
        coordinator.store().seed(key.clone(), 3);

        let outcome = coordinator.toggle(MutationKind::Follow, "bob", &widget).await;
        assert_eq!(outcome, MutationOutcome::Corrected { value: 3, active: false });
        let last = recorder.renders.lock().unwrap().last().cloned().unwrap();
        assert_eq!((last.value, last.active), (3, false));
    }

    #[tokio::test]
    async fn rejection_rolls_back_with_notice() {
        let (coordinator, _transport, recorder, widget) =
            setup(vec![Ok(MutationResponse::failed("rate limited"))]);

        let outcome = coordinator.toggle(MutationKind::Like, "post-42", &widget).await;
        assert_eq!(
            outcome,
            MutationOutcome::Rejected {
                message: "rate limited".into()
            }
        );
        assert_eq!(coordinator.store().read(&likes(), Some("alice")), 10);
        assert_eq!(*recorder.failures.lock().unwrap(), vec!["rate limited".to_string()]);
        assert_eq!(*recorder.auth_prompts.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn unverified_prompts_for_auth_instead_of_failure() {
        let (coordinator, _transport, recorder, widget) = setup(vec![
            Ok(MutationResponse::unverified()),
            Err(ApiError::Http {
                status: 403,
                body: String::new(),
            }),
        ]);

        for _ in 0..2 {
            let outcome = coordinator.toggle(MutationKind::Like, "post-42", &widget).await;
            assert_eq!(outcome, MutationOutcome::Unverified);
        }
        assert_eq!(*recorder.auth_prompts.lock().unwrap(), 2);
        assert!(recorder.failures.lock().unwrap().is_empty());
        assert_eq!(coordinator.store().read(&likes(), Some("alice")), 10);
    }

    #[tokio::test]
    async fn transport_error_is_a_generic_failure() {
        let (coordinator, _transport, recorder, widget) =
            setup(vec![Err(ApiError::Network("timed out".into()))]);

        let outcome = coordinator.toggle(MutationKind::Like, "post-42", &widget).await;
        assert!(matches!(outcome, MutationOutcome::TransportFailure { .. }));
        assert_eq!(recorder.failures.lock().unwrap().len(), 1);
        assert_eq!(coordinator.store().read(&likes(), Some("alice")), 10);
    }

    #[tokio::test]
    async fn concurrent_toggle_collapses() {
        let (coordinator, transport, _recorder, widget) = setup(vec![]);
        coordinator
            .store()
            .begin(likes(), "alice", 1)
            .unwrap();

        let outcome = coordinator.toggle(MutationKind::Like, "post-42", &widget).await;
        assert_eq!(outcome, MutationOutcome::AlreadyPending);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn votes_lock_after_confirmation() {
        let (coordinator, transport, _recorder, widget) =
            setup(vec![Ok(MutationResponse::ok().with_field("voted", true))]);
        coordinator
            .store()
            .seed(CounterKey::new("opt-b", "votes"), 5);

        let outcome = coordinator.vote("poll-1", "opt-b", &widget).await;
        assert_eq!(outcome, MutationOutcome::Confirmed { value: 6, active: true });
        assert_eq!(coordinator.voted_option("alice", "poll-1").as_deref(), Some("opt-b"));

        let again = coordinator.vote("poll-1", "opt-a", &widget).await;
        assert_eq!(again, MutationOutcome::AlreadyVoted);
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(transport.calls()[0].method, MutationMethod::Patch);
        assert_eq!(transport.calls()[0].body["option"], "opt-b");
    }

    #[tokio::test]
    async fn failed_vote_can_be_retried() {
        let (coordinator, _transport, _recorder, widget) = setup(vec![
            Err(ApiError::Network("reset".into())),
            Ok(MutationResponse::ok().with_field("voted", true).with_field("count", 9)),
        ]);

        assert!(!coordinator.vote("poll-1", "opt-a", &widget).await.is_success());
        assert_eq!(coordinator.voted_option("alice", "poll-1"), None);

        let outcome = coordinator.vote("poll-1", "opt-a", &widget).await;
        assert_eq!(outcome, MutationOutcome::Corrected { value: 9, active: true });
    }

    #[tokio::test]
    async fn own_vote_push_locks_the_ballot() {
        let (coordinator, transport, _recorder, widget) = setup(vec![]);
        let dispatcher = EventDispatcher::new();
        let _votes = coordinator.track_votes(&dispatcher);
        let publish = |text: &str| {
            dispatcher.publish(SyncEvent::Inbound {
                channel: ChannelRef::Firehose,
                event: decode_inbound(text).unwrap(),
            });
        };

        // Someone else's vote and a vote without a poll change nothing.
        publish(r#"{"type":"action","data":{"kind":"vote","hashes":{"from":"bob","to":"poll-1","target":"opt-a"}}}"#);
        publish(r#"{"type":"action","data":{"kind":"vote","hashes":{"from":"alice","target":"opt-a"}}}"#);
        assert_eq!(coordinator.voted_option("alice", "poll-1"), None);
        assert_eq!(coordinator.voted_option("bob", "poll-1"), None);

        publish(r#"{"type":"action","data":{"kind":"vote","hashes":{"from":"alice","to":"poll-1","target":"opt-a"}}}"#);
        assert_eq!(coordinator.voted_option("alice", "poll-1").as_deref(), Some("opt-a"));
        assert_eq!(
            coordinator.vote("poll-1", "opt-b", &widget).await,
            MutationOutcome::AlreadyVoted
        );
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn push_locks_a_pending_ballot() {
        let (coordinator, _transport, _recorder, widget) = setup(vec![]);
        coordinator.ballots.lock().unwrap().insert(
            ("alice".to_string(), "poll-1".to_string()),
            Ballot::Pending("opt-b".to_string()),
        );
        coordinator.observe_vote(&ActionEvent {
            kind: ActionKind::Vote,
            actor: "alice".into(),
            target: "opt-a".into(),
            parent: Some("poll-1".into()),
            delta: 1,
            change_id: None,
            payload: Default::default(),
        });
        assert_eq!(coordinator.voted_option("alice", "poll-1").as_deref(), Some("opt-a"));
        assert_eq!(
            coordinator.vote("poll-1", "opt-b", &widget).await,
            MutationOutcome::AlreadyVoted
        );
    }

    #[tokio::test]
    async fn recorded_vote_blocks_new_votes() {
        let (coordinator, transport, _recorder, widget) = setup(vec![]);
        coordinator.record_vote("alice", "poll-1", "opt-a");
        assert_eq!(
            coordinator.vote("poll-1", "opt-b", &widget).await,
            MutationOutcome::AlreadyVoted
        );
        assert!(transport.calls().is_empty());
    }
}
