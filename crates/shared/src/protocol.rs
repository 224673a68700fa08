//! Inbound wire protocol.
//!
//! Push frames are JSON objects of the form
//! `{ "type": "event" | "action" | "chatMessage", "data": { "kind": ..., ... } }`.
//! Anything that does not validate is reported as `SyncError::MalformedPayload`
//! and never reaches subscribers.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::SyncError;
use crate::models::{ActionEvent, ActionKind, ChatControl, ChatMessage, InboundEvent};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
enum WireMessage {
    Event(WireData),
    Action(WireData),
    ChatMessage(WireData),
}

#[derive(Debug, Deserialize)]
struct WireData {
    kind: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    hashes: Option<Hashes>,
    #[serde(default)]
    value: Option<i64>,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Hashes {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    target: Option<String>,
}

/// Decode one text frame into an [`InboundEvent`].
pub fn decode_inbound(text: &str) -> Result<InboundEvent, SyncError> {
    let message: WireMessage =
        serde_json::from_str(text).map_err(|e| SyncError::MalformedPayload(e.to_string()))?;

    match message {
        WireMessage::Action(data) => decode_action(data),
        WireMessage::Event(data) => {
            if ActionKind::is_action_kind(&data.kind) {
                decode_action(data)
            } else {
                Ok(InboundEvent::ChatControl(decode_control(data)))
            }
        }
        WireMessage::ChatMessage(data) => {
            if data.kind == "message" {
                decode_chat_message(data).map(InboundEvent::ChatMessage)
            } else {
                Ok(InboundEvent::ChatControl(decode_control(data)))
            }
        }
    }
}

fn decode_action(data: WireData) -> Result<InboundEvent, SyncError> {
    let reaction_key = str_field(&data.payload, "reaction").or_else(|| str_field(&data.payload, "key"));
    let kind = ActionKind::from_wire(&data.kind, reaction_key.as_deref())
        .ok_or_else(|| SyncError::MalformedPayload(format!("unknown action kind {:?}", data.kind)))?;

    let hashes = data.hashes.unwrap_or_default();
    let actor = non_empty(hashes.from)
        .ok_or_else(|| SyncError::MalformedPayload("action without hashes.from".into()))?;
    // `target` names the entity whose counter moves; `to` is used by follow and
    // connect, where the target is a user.
    let (target, parent) = match (non_empty(hashes.target), non_empty(hashes.to)) {
        (Some(target), to) => (target, to),
        (None, Some(to)) => (to, None),
        (None, None) => {
            return Err(SyncError::MalformedPayload(
                "action without hashes.target or hashes.to".into(),
            ))
        }
    };

    let delta = match data.value {
        Some(v) => v,
        None => match data.action.as_deref() {
            Some("remove") | Some("undo") => -1,
            _ => 1,
        },
    };

    let change_id = str_field(&data.payload, "changeId").or_else(|| str_field(&data.payload, "id"));

    Ok(InboundEvent::Action(ActionEvent {
        kind,
        actor,
        target,
        parent,
        delta,
        change_id,
        payload: data.payload,
    }))
}

fn decode_chat_message(data: WireData) -> Result<ChatMessage, SyncError> {
    let hashes = data.hashes.unwrap_or_default();
    let payload = &data.payload;

    let id = str_field(payload, "id")
        .ok_or_else(|| SyncError::MalformedPayload("chat message without id".into()))?;
    let conversation_id = str_field(payload, "conversationId")
        .or(non_empty(hashes.target))
        .ok_or_else(|| SyncError::MalformedPayload("chat message without conversation".into()))?;
    let author = str_field(payload, "author")
        .or(non_empty(hashes.from))
        .ok_or_else(|| SyncError::MalformedPayload("chat message without author".into()))?;
    let body = str_field(payload, "body").unwrap_or_default();
    let created_at = match payload.get("createdAt") {
        Some(Value::String(ts)) => ts
            .parse::<DateTime<Utc>>()
            .map_err(|e| SyncError::MalformedPayload(format!("bad createdAt: {}", e)))?,
        Some(_) => return Err(SyncError::MalformedPayload("createdAt is not a string".into())),
        None => Utc::now(),
    };

    Ok(ChatMessage {
        id,
        conversation_id,
        author,
        body,
        created_at,
    })
}

fn decode_control(data: WireData) -> ChatControl {
    let hashes = data.hashes.unwrap_or_default();
    let conversation_id = str_field(&data.payload, "conversationId").or(non_empty(hashes.target));
    ChatControl {
        kind: data.kind,
        conversation_id,
        actor: non_empty(hashes.from),
        payload: data.payload,
    }
}

fn str_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    match payload.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_like_action() {
        let text = r#"{"type":"action","data":{"kind":"like","hashes":{"from":"alice","target":"post-42"},"value":1,"changeId":"c-9"}}"#;
        let InboundEvent::Action(ev) = decode_inbound(text).unwrap() else {
            panic!("expected action");
        };
        assert_eq!(ev.kind, ActionKind::Like);
        assert_eq!(ev.actor, "alice");
        assert_eq!(ev.target, "post-42");
        assert_eq!(ev.delta, 1);
        assert_eq!(ev.change_id.as_deref(), Some("c-9"));
    }

    #[test]
    fn follow_targets_hashes_to_and_remove_is_negative() {
        let text = r#"{"type":"event","data":{"kind":"follow","action":"remove","hashes":{"from":"alice","to":"bob"}}}"#;
        let InboundEvent::Action(ev) = decode_inbound(text).unwrap() else {
            panic!("expected action");
        };
        assert_eq!(ev.kind, ActionKind::Follow);
        assert_eq!(ev.target, "bob");
        assert_eq!(ev.delta, -1);
        assert_eq!(ev.change_id, None);
    }

    #[test]
    fn vote_keeps_poll_as_parent() {
        let text = r#"{"type":"action","data":{"kind":"vote","hashes":{"from":"carol","to":"poll-1","target":"poll-1-a"}}}"#;
        let InboundEvent::Action(ev) = decode_inbound(text).unwrap() else {
            panic!("expected action");
        };
        assert_eq!(ev.target, "poll-1-a");
        assert_eq!(ev.parent.as_deref(), Some("poll-1"));
    }

    #[test]
    fn decodes_chat_message_and_control() {
        let text = r#"{"type":"chatMessage","data":{"kind":"message","id":"m1","conversationId":"conv-1","author":"bob","body":"hi","createdAt":"2024-06-15T10:00:00Z"}}"#;
        let InboundEvent::ChatMessage(msg) = decode_inbound(text).unwrap() else {
            panic!("expected chat message");
        };
        assert_eq!(msg.conversation_id, "conv-1");
        assert_eq!(msg.body, "hi");

        let text = r#"{"type":"chatMessage","data":{"kind":"typing","hashes":{"from":"bob","target":"conv-1"}}}"#;
        let InboundEvent::ChatControl(ctl) = decode_inbound(text).unwrap() else {
            panic!("expected control");
        };
        assert_eq!(ctl.kind, "typing");
        assert_eq!(ctl.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(ctl.actor.as_deref(), Some("bob"));
    }

    #[test]
    fn rejects_structurally_invalid_frames() {
        for text in [
            "not json",
            r#"{"type":"bogus","data":{"kind":"like"}}"#,
            r#"{"type":"action","data":{"kind":"like","hashes":{"target":"post-1"}}}"#,
            r#"{"type":"action","data":{"kind":"like","hashes":{"from":"a"}}}"#,
            r#"{"type":"action","data":{"kind":"poke","hashes":{"from":"a","to":"b"}}}"#,
            r#"{"type":"chatMessage","data":{"kind":"message","conversationId":"c"}}"#,
        ] {
            assert!(
                matches!(decode_inbound(text), Err(SyncError::MalformedPayload(_))),
                "should reject {text}"
            );
        }
    }
}
