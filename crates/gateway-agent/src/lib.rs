//! Agent collaborators for the session gateway.
//!
//! Provides:
//! - `StdioAgentConnector` - JSON-lines agent running as a child process group
//! - `MockAgent` - scripted in-process agent
//! - `AgentServers` - routes sessions to named agent servers
//! - `CommandHook` - message hook backed by an external command
//! - Command building utilities

pub mod command;
pub mod hooks;
pub mod mock;
pub mod servers;
pub mod stdio;

pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use hooks::CommandHook;
pub use mock::{MockAgent, MockConnection};
pub use servers::AgentServers;
pub use stdio::StdioAgentConnector;
