//! Message store for conversation timelines.
//!
//! Messages are organized by conversation id, and each conversation tracks
//! whether its history has been loaded. Live pushes and history fetches can
//! overlap, so inserts de-duplicate by message id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chatsync_shared::ChatMessage;

/// Messages for a single conversation.
#[derive(Default, Clone, PartialEq, Debug)]
pub struct ConversationMessages {
    /// Sorted by created_at ascending.
    pub messages: Vec<ChatMessage>,
    /// Whether the full history has been loaded.
    pub is_loaded: bool,
}

impl ConversationMessages {
    /// Add a message, maintaining sort order by created_at.
    /// Returns false if a message with the same id already exists.
    pub fn add_message(&mut self, msg: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == msg.id) {
            return false;
        }

        // Insert after any messages with the same timestamp.
        let pos = self
            .messages
            .partition_point(|m| m.created_at <= msg.created_at);
        self.messages.insert(pos, msg);
        true
    }

    /// Replace the history. Live messages already received that the history
    /// does not contain are kept.
    pub fn set_history(&mut self, history: Vec<ChatMessage>) {
        let live = std::mem::take(&mut self.messages);
        // First occurrence of an id wins.
        let mut seen = HashSet::new();
        let mut messages: Vec<_> = history
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.messages = messages;
        for msg in live {
            self.add_message(msg);
        }
        self.is_loaded = true;
    }
}

/// Shared message store keyed by conversation id.
#[derive(Clone, Default)]
pub struct MessageStore {
    conversations: Arc<RwLock<HashMap<String, ConversationMessages>>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&self, msg: ChatMessage) -> bool {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        conversations
            .entry(msg.conversation_id.clone())
            .or_default()
            .add_message(msg)
    }

    pub fn set_history(&self, conversation_id: &str, history: Vec<ChatMessage>) {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .set_history(history);
    }

    /// Snapshot of one conversation.
    pub fn conversation(&self, conversation_id: &str) -> Option<ConversationMessages> {
        self.conversations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation_id)
            .cloned()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.conversation(conversation_id)
            .map(|c| c.messages)
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.conversations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
