//! Execution context for agent sessions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Where and against which agent server a session runs.
///
/// Handed to every collaborator (agent connector, message hooks) so they can
/// scope their work to the session's workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Persisted session identifier.
    pub session_id: String,
    /// Working directory for the agent session.
    pub working_dir: PathBuf,
    /// Name of the agent server driving the session.
    pub agent_server: String,
}

impl ExecutionContext {
    /// Create a new execution context.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        agent_server: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            working_dir: working_dir.into(),
            agent_server: agent_server.into(),
        }
    }

    /// Working directory as a path.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}
