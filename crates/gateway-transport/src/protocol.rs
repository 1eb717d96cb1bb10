//! Wire protocol for live session connections.

use gateway_core::{Event, Notification, QueueAction, Seq};
use gateway_session::{SessionState, SyncItem, SyncWarning};
use serde::{Deserialize, Serialize};

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a turn.
    Prompt {
        message: String,
        #[serde(default)]
        prompt_id: Option<String>,
    },
    /// Queue a message for after the current turn.
    Queue { message: String },
    /// Remove a queued message.
    Dequeue { message_id: String },
    /// Cancel the current turn.
    Cancel,
    /// Answer a pending permission request.
    PermissionAnswer { request_id: String, option_id: String },
    /// (Re)start the event feed after `last_seq`.
    Sync { last_seq: Seq },
    Rename { title: String },
    Keepalive {
        #[serde(default)]
        last_seen_seq: Option<Seq>,
    },
    Ping,
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection.
    Connected {
        session_id: String,
        last_seq: Seq,
        state: SessionState,
    },
    /// The prompt was persisted as `seq`.
    PromptReceived { prompt_id: Option<String>, seq: Seq },
    Event { session_id: String, event: Event },
    /// Start of a resync. With `reset` the client must discard its history.
    SessionSync {
        session_id: String,
        after_seq: Seq,
        reset: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<SyncWarning>,
    },
    /// Events missing from the log.
    SyncGap { expected: Seq, found: Option<Seq> },
    SyncComplete { last_seq: Seq },
    PromptComplete { last_seq: Seq },
    QueueUpdated {
        length: usize,
        action: QueueAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    QueueTitled { message_id: String, title: String },
    SessionClosed { reason: String },
    /// The connection fell behind; send `sync` again from `last_seq`.
    ResyncRequired { last_seq: Seq },
    KeepaliveAck { server_max_seq: Seq, state: SessionState },
    Error { message: String },
    Pong,
}

impl ServerMessage {
    #[must_use]
    pub fn error(message: impl ToString) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }

    /// Wire form of a live notification.
    #[must_use]
    pub fn from_notification(session_id: &str, notification: Notification) -> Self {
        match notification {
            Notification::Event(event) => Self::Event {
                session_id: session_id.to_string(),
                event,
            },
            Notification::PromptComplete { last_seq } => Self::PromptComplete { last_seq },
            Notification::QueueUpdated {
                length,
                action,
                message_id,
            } => Self::QueueUpdated {
                length,
                action,
                message_id,
            },
            Notification::QueueTitled { message_id, title } => Self::QueueTitled { message_id, title },
            Notification::Error { message } => Self::Error { message },
            Notification::Closed { reason } => Self::SessionClosed { reason },
        }
    }

    /// Wire form of one resync step.
    #[must_use]
    pub fn from_sync(session_id: &str, item: SyncItem) -> Self {
        match item {
            SyncItem::Started {
                after_seq,
                reset,
                warning,
            } => Self::SessionSync {
                session_id: session_id.to_string(),
                after_seq,
                reset,
                warning,
            },
            SyncItem::Replay(event) => Self::Event {
                session_id: session_id.to_string(),
                event,
            },
            SyncItem::Gap { expected, found } => Self::SyncGap { expected, found },
            SyncItem::Complete { last_seq } => Self::SyncComplete { last_seq },
            SyncItem::Live(notification) => Self::from_notification(session_id, notification),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use gateway_core::{EventPayload, EventType};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_client_messages_parse() {
        let prompt: ClientMessage = serde_json::from_str(r#"{"type":"prompt","message":"hi"}"#).unwrap();
        assert_eq!(
            prompt,
            ClientMessage::Prompt {
                message: "hi".to_string(),
                prompt_id: None
            }
        );

        let answer: ClientMessage =
            serde_json::from_str(r#"{"type":"permission_answer","request_id":"r1","option_id":"allow"}"#).unwrap();
        assert!(matches!(answer, ClientMessage::PermissionAnswer { .. }));

        let keepalive: ClientMessage = serde_json::from_str(r#"{"type":"keepalive"}"#).unwrap();
        assert_eq!(keepalive, ClientMessage::Keepalive { last_seen_seq: None });

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"input","data":"x"}"#).is_err());
    }

    #[test]
    fn test_sync_start_wire_format() {
        let msg = ServerMessage::from_sync(
            "s1",
            SyncItem::Started {
                after_seq: 0,
                reset: true,
                warning: Some(SyncWarning::ClientAhead),
            },
        );
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "session_sync",
                "session_id": "s1",
                "after_seq": 0,
                "reset": true,
                "warning": "client_ahead"
            })
        );
    }

    #[test]
    fn test_event_carries_session_id() {
        let event = EventPayload::agent_message("hello").into_event(7, Utc::now()).unwrap();
        let msg = ServerMessage::from_notification("s1", Notification::Event(event));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["session_id"], "s1");
        assert_eq!(value["event"]["seq"], 7);
        assert_eq!(value["event"]["type"], EventType::AgentMessage.as_str());
        assert_eq!(value["event"]["payload"]["text"], "hello");
    }

    #[test]
    fn test_closed_maps_to_session_closed() {
        let msg = ServerMessage::from_notification(
            "s1",
            Notification::Closed {
                reason: "user_close".to_string(),
            },
        );
        assert_eq!(
            msg,
            ServerMessage::SessionClosed {
                reason: "user_close".to_string()
            }
        );
    }
}
