//! Session event model.
//!
//! An [`Event`] is one line of a session's append-only log:
//! `{"seq": 3, "type": "agent_message", "timestamp": "...", "payload": {...}}`.
//! The payload is kept as raw JSON on the record so that unknown or newer
//! payload shapes survive a read/write cycle; [`EventPayload`] is the typed view.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::permission::{PermissionOption, PermissionOutcome};

/// Per-session sequence number. Starts at 1, strictly increasing, no gaps.
pub type Seq = u64;

/// Event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    UserPrompt,
    AgentMessage,
    AgentThought,
    ToolCall,
    ToolCallUpdate,
    Plan,
    Permission,
    Error,
    SessionEnd,
}

impl EventType {
    /// Wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::UserPrompt => "user_prompt",
            Self::AgentMessage => "agent_message",
            Self::AgentThought => "agent_thought",
            Self::ToolCall => "tool_call",
            Self::ToolCallUpdate => "tool_call_update",
            Self::Plan => "plan",
            Self::Permission => "permission",
            Self::Error => "error",
            Self::SessionEnd => "session_end",
        }
    }

    /// Whether the event counts towards a session's message count.
    #[must_use]
    pub const fn is_message(self) -> bool {
        matches!(self, Self::UserPrompt | Self::AgentMessage)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted session event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: Seq,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Decode the payload into a concrete data type.
    ///
    /// # Errors
    /// Returns error if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Typed view of the payload.
    ///
    /// # Errors
    /// Returns error if the payload does not match the event type.
    pub fn typed(&self) -> Result<EventPayload, serde_json::Error> {
        EventPayload::from_event(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartData {
    pub session_id: String,
    pub agent_server: String,
    pub working_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPromptData {
    pub message: String,
    /// Client-generated id used to acknowledge delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
}

/// Payload of `agent_message` and `agent_thought`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextData {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallData {
    pub tool_call_id: String,
    pub title: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallUpdateData {
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One entry of an agent plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub content: String,
    pub priority: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanData {
    pub entries: Vec<PlanEntry>,
}

/// A permission request, or the decision that resolved it.
///
/// The request is recorded with `outcome: None`; the decision is recorded as a
/// second `permission` event carrying the same `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionData {
    pub request_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<PermissionOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<PermissionOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEndData {
    /// "user_close", "agent_failure", "storage_failure", ...
    pub reason: String,
    pub event_count: u64,
}

/// Typed payload of an event, before a sequence number is assigned.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    SessionStart(SessionStartData),
    UserPrompt(UserPromptData),
    AgentMessage(TextData),
    AgentThought(TextData),
    ToolCall(ToolCallData),
    ToolCallUpdate(ToolCallUpdateData),
    Plan(PlanData),
    Permission(PermissionData),
    Error(ErrorData),
    SessionEnd(SessionEndData),
}

impl EventPayload {
    /// Shorthand for an `agent_message` payload.
    #[must_use]
    pub fn agent_message(text: impl Into<String>) -> Self {
        Self::AgentMessage(TextData { text: text.into() })
    }

    /// Shorthand for a `user_prompt` payload without a prompt id.
    #[must_use]
    pub fn user_prompt(message: impl Into<String>) -> Self {
        Self::UserPrompt(UserPromptData {
            message: message.into(),
            prompt_id: None,
        })
    }

    /// Shorthand for an `error` payload.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorData {
            message: message.into(),
            code: None,
        })
    }

    /// Event type of this payload.
    #[must_use]
    pub const fn kind(&self) -> EventType {
        match self {
            Self::SessionStart(_) => EventType::SessionStart,
            Self::UserPrompt(_) => EventType::UserPrompt,
            Self::AgentMessage(_) => EventType::AgentMessage,
            Self::AgentThought(_) => EventType::AgentThought,
            Self::ToolCall(_) => EventType::ToolCall,
            Self::ToolCallUpdate(_) => EventType::ToolCallUpdate,
            Self::Plan(_) => EventType::Plan,
            Self::Permission(_) => EventType::Permission,
            Self::Error(_) => EventType::Error,
            Self::SessionEnd(_) => EventType::SessionEnd,
        }
    }

    /// Serialize the payload body.
    ///
    /// # Errors
    /// Returns error if the payload cannot be represented as JSON.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::SessionStart(d) => serde_json::to_value(d),
            Self::UserPrompt(d) => serde_json::to_value(d),
            Self::AgentMessage(d) | Self::AgentThought(d) => serde_json::to_value(d),
            Self::ToolCall(d) => serde_json::to_value(d),
            Self::ToolCallUpdate(d) => serde_json::to_value(d),
            Self::Plan(d) => serde_json::to_value(d),
            Self::Permission(d) => serde_json::to_value(d),
            Self::Error(d) => serde_json::to_value(d),
            Self::SessionEnd(d) => serde_json::to_value(d),
        }
    }

    /// Stamp the payload with a sequence number and timestamp.
    ///
    /// # Errors
    /// Returns error if the payload cannot be represented as JSON.
    pub fn into_event(self, seq: Seq, timestamp: DateTime<Utc>) -> Result<Event, serde_json::Error> {
        Ok(Event {
            seq,
            kind: self.kind(),
            timestamp,
            payload: self.to_value()?,
        })
    }

    /// Decode the typed payload of a stored event.
    ///
    /// # Errors
    /// Returns error if the payload does not match the event type.
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        Ok(match event.kind {
            EventType::SessionStart => Self::SessionStart(event.decode()?),
            EventType::UserPrompt => Self::UserPrompt(event.decode()?),
            EventType::AgentMessage => Self::AgentMessage(event.decode()?),
            EventType::AgentThought => Self::AgentThought(event.decode()?),
            EventType::ToolCall => Self::ToolCall(event.decode()?),
            EventType::ToolCallUpdate => Self::ToolCallUpdate(event.decode()?),
            EventType::Plan => Self::Plan(event.decode()?),
            EventType::Permission => Self::Permission(event.decode()?),
            EventType::Error => Self::Error(event.decode()?),
            EventType::SessionEnd => Self::SessionEnd(event.decode()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_shape() {
        let event = EventPayload::agent_message("hello")
            .into_event(2, Utc::now())
            .unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 2);
        assert_eq!(json["type"], "agent_message");
        assert_eq!(json["payload"]["text"], "hello");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_typed_view_matches_kind() {
        let event = EventPayload::UserPrompt(UserPromptData {
            message: "fix the build".to_string(),
            prompt_id: Some("p-1".to_string()),
        })
        .into_event(1, Utc::now())
        .unwrap();

        match event.typed().unwrap() {
            EventPayload::UserPrompt(data) => {
                assert_eq!(data.message, "fix the build");
                assert_eq!(data.prompt_id.as_deref(), Some("p-1"));
            }
            other => panic!("Wrong payload: {other:?}"),
        }
    }

    #[test]
    fn test_payload_mismatch_is_error() {
        let line = r#"{"seq":1,"type":"plan","timestamp":"2026-01-01T00:00:00Z","payload":{"text":"x"}}"#;
        let event: Event = serde_json::from_str(line).unwrap();
        assert!(event.typed().is_err());
    }

    #[test]
    fn test_message_count_types() {
        assert!(EventType::UserPrompt.is_message());
        assert!(EventType::AgentMessage.is_message());
        assert!(!EventType::AgentThought.is_message());
        assert!(!EventType::SessionEnd.is_message());
    }
}
