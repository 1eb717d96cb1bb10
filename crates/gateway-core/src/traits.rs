//! Collaborator contracts: agent connection, message hooks, origin guard.
//!
//! The session core depends on nothing beyond these traits. Whether an agent
//! is a subprocess, a sandboxed process or an in-process stub is the
//! implementor's concern.

use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    ExecutionContext,
    event::PlanEntry,
    permission::{PermissionOutcome, PermissionRequest},
};

/// Request sent to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Start a turn with the given (already hook-transformed) text.
    Prompt { text: String },
    /// Cancel the turn in progress.
    Cancel,
    /// Answer a permission request.
    PermissionResponse {
        request_id: String,
        outcome: PermissionOutcome,
    },
}

/// Notification emitted by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentNotification {
    AgentMessage { text: String },
    AgentThought { text: String },
    ToolCall {
        tool_call_id: String,
        title: String,
        status: String,
        #[serde(default)]
        kind: Option<String>,
        #[serde(default)]
        raw_input: Option<Value>,
    },
    ToolCallUpdate {
        tool_call_id: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
    Plan { entries: Vec<PlanEntry> },
    PermissionRequest(PermissionRequest),
    /// The current turn is over.
    TurnComplete {
        #[serde(default)]
        stop_reason: Option<String>,
    },
    /// The agent reported an error. `fatal` errors end the session.
    Error {
        message: String,
        #[serde(default)]
        fatal: bool,
    },
}

/// Agent connection error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent error: {0}")]
    Recoverable(String),
    #[error("Fatal agent error: {0}")]
    Fatal(String),
}

impl AgentError {
    /// Whether the session can continue after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Outbound half of an agent connection.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    /// Send a request to the agent.
    async fn send(&self, request: AgentRequest) -> Result<(), AgentError>;

    /// Shut the connection down. Must be idempotent.
    async fn close(&self);
}

/// Lazy, non-restartable sequence of agent notifications. Ends when the
/// agent goes away.
pub type NotificationStream = BoxStream<'static, AgentNotification>;

/// A freshly established agent connection.
pub struct AgentChannel {
    pub connection: Arc<dyn AgentConnection>,
    pub notifications: NotificationStream,
}

/// Factory for agent connections, one per live session.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Connect to the agent server named in `ctx`.
    async fn connect(&self, ctx: &ExecutionContext) -> Result<AgentChannel, AgentError>;
}

/// What to do when a hook fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookErrorPolicy {
    /// Log and continue with the untransformed message.
    #[default]
    Skip,
    /// Abort the prompt.
    Fail,
}

/// Hook failure, tagged with the hook's own policy.
#[derive(Debug, Clone, Error)]
#[error("Hook '{hook}' failed: {reason}")]
pub struct HookError {
    pub hook: String,
    pub reason: String,
    pub policy: HookErrorPolicy,
}

/// Pre-processing of outgoing user messages.
#[async_trait]
pub trait MessageHook: Send + Sync {
    /// Return the transformed message (or the original, unchanged).
    async fn transform(&self, ctx: &ExecutionContext, message: &str) -> Result<String, HookError>;
}

/// Abuse defense consulted before a connection reaches the session layer.
pub trait OriginGuard: Send + Sync {
    /// Whether connections from `origin` must be refused.
    fn is_blocked(&self, origin: IpAddr) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_wire_format() {
        let line = r#"{"type":"tool_call","tool_call_id":"t1","title":"Read file","status":"pending"}"#;
        let parsed: AgentNotification = serde_json::from_str(line).unwrap();
        if let AgentNotification::ToolCall { tool_call_id, kind, .. } = parsed {
            assert_eq!(tool_call_id, "t1");
            assert!(kind.is_none());
        } else {
            panic!("Wrong notification type");
        }
    }

    #[test]
    fn test_permission_request_is_flattened() {
        let line = r#"{"type":"permission_request","request_id":"r1","title":"Write","options":[]}"#;
        let parsed: AgentNotification = serde_json::from_str(line).unwrap();
        assert!(matches!(parsed, AgentNotification::PermissionRequest(ref r) if r.request_id == "r1"));
    }

    #[test]
    fn test_request_serialization() {
        let json = serde_json::to_string(&AgentRequest::Prompt {
            text: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"prompt","text":"hi"}"#);
    }

    #[test]
    fn test_error_fatality() {
        assert!(AgentError::Fatal("gone".into()).is_fatal());
        assert!(!AgentError::Recoverable("retry".into()).is_fatal());
    }
}
