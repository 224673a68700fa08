//! Shared data models for push events, channels and outbound commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Channels ---

/// Addresses one persistent connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelRef {
    /// The account-wide push channel.
    Firehose,
    /// A channel scoped to one conversation, keyed by its opaque id.
    Conversation(String),
}

impl ChannelRef {
    pub fn conversation(id: impl Into<String>) -> Self {
        ChannelRef::Conversation(id.into())
    }

    pub fn is_firehose(&self) -> bool {
        matches!(self, ChannelRef::Firehose)
    }
}

impl std::fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelRef::Firehose => write!(f, "firehose"),
            ChannelRef::Conversation(id) => write!(f, "conversation:{}", id),
        }
    }
}

// --- Inbound events ---

/// Social-graph actions carried by push events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    Connect,
    Follow,
    Like,
    Vote,
    Subscribe,
    /// Reaction with its key (emoji shortcode or custom id).
    Reaction(String),
}

impl ActionKind {
    /// Parse a wire `kind`. Reactions need their key from the payload, so the
    /// caller passes it in.
    pub fn from_wire(kind: &str, reaction_key: Option<&str>) -> Option<Self> {
        match kind {
            "connect" => Some(ActionKind::Connect),
            "follow" => Some(ActionKind::Follow),
            "like" => Some(ActionKind::Like),
            "vote" => Some(ActionKind::Vote),
            "subscribe" => Some(ActionKind::Subscribe),
            "reaction" => reaction_key.map(|k| ActionKind::Reaction(k.to_string())),
            _ => None,
        }
    }

    /// Whether `kind` names an action, regardless of payload.
    pub fn is_action_kind(kind: &str) -> bool {
        matches!(
            kind,
            "connect" | "follow" | "like" | "vote" | "subscribe" | "reaction"
        )
    }

    /// Name of the counter this action moves on its target entity.
    pub fn counter_name(&self) -> String {
        match self {
            ActionKind::Connect => "connections".to_string(),
            ActionKind::Follow => "followers".to_string(),
            ActionKind::Like => "likes".to_string(),
            ActionKind::Vote => "votes".to_string(),
            ActionKind::Subscribe => "subscribers".to_string(),
            ActionKind::Reaction(key) => format!("reactions:{}", key),
        }
    }
}

/// A counter-moving push event.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionEvent {
    pub kind: ActionKind,
    /// Who performed the action.
    pub actor: String,
    /// Entity whose counter moves (post, user, topic, poll option).
    pub target: String,
    /// Secondary entity, e.g. the poll an option belongs to.
    pub parent: Option<String>,
    /// Signed change, normally +1 or -1.
    pub delta: i64,
    /// Server-assigned logical change id, when the server sends one.
    pub change_id: Option<String>,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl ActionEvent {
    /// De-duplication key: actor + entity + counter, plus the logical change id
    /// or the direction when no id is available.
    pub fn dedup_key(&self) -> String {
        match &self.change_id {
            Some(id) => format!("{}|{}|{}|{}", self.actor, self.target, self.kind.counter_name(), id),
            None => format!(
                "{}|{}|{}|{}",
                self.actor,
                self.target,
                self.kind.counter_name(),
                if self.delta > 0 { "+" } else { "-" }
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Non-counting chat or account signal (typing, read receipts, joins, notices).
#[derive(Debug, Clone, PartialEq)]
pub struct ChatControl {
    pub kind: String,
    pub conversation_id: Option<String>,
    pub actor: Option<String>,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// A parsed push event. Immutable and not retained beyond dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Action(ActionEvent),
    ChatMessage(ChatMessage),
    ChatControl(ChatControl),
}

impl InboundEvent {
    /// Primary entity the event is about, used for entity-scoped subscriptions.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            InboundEvent::Action(a) => Some(&a.target),
            InboundEvent::ChatMessage(m) => Some(&m.conversation_id),
            InboundEvent::ChatControl(c) => c.conversation_id.as_deref(),
        }
    }

    pub fn actor(&self) -> Option<&str> {
        match self {
            InboundEvent::Action(a) => Some(&a.actor),
            InboundEvent::ChatMessage(m) => Some(&m.author),
            InboundEvent::ChatControl(c) => c.actor.as_deref(),
        }
    }
}

// --- Outbound ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> WsEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    #[serde(rename = "message.create", rename_all = "camelCase")]
    MessageCreate {
        conversation_id: String,
        body: String,
        nonce: String,
    },
    #[serde(rename_all = "camelCase")]
    Typing { conversation_id: String },
    #[serde(rename_all = "camelCase")]
    Read {
        conversation_id: String,
        message_id: String,
    },
    Ping,
}
