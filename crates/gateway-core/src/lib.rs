//! Core abstractions for the agent session gateway.
//!
//! This crate provides the fundamental building blocks:
//! - `Event` / `EventPayload` - The typed, append-only session record
//! - `ObserverHub` - Per-session fan-out to live subscribers
//! - `ExecutionContext` - Workspace + agent server a session runs against
//! - Collaborator traits: agent connection, message hook, origin guard

pub mod context;
pub mod event;
pub mod hub;
pub mod permission;
pub mod traits;

pub use context::ExecutionContext;
pub use event::{Event, EventPayload, EventType, Seq};
pub use hub::{Notification, ObserverHub, ObserverId, ObserverOverflow, QueueAction, Subscription};
pub use permission::{PermissionOption, PermissionOptionKind, PermissionOutcome, PermissionRequest};
pub use traits::{
    AgentChannel, AgentConnection, AgentConnector, AgentError, AgentNotification, AgentRequest,
    HookError, HookErrorPolicy, MessageHook, NotificationStream, OriginGuard,
};
