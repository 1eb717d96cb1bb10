//! Session metadata cache.

use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use gateway_core::{Event, Seq};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Idle,
    Prompting,
    Closing,
    Closed,
    Archived,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Idle => "idle",
            Self::Prompting => "prompting",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Archived => "archived",
        }
    }

    /// `Closed` and `Archived` accept no further operations.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Archived)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Denormalized summary of a session, derived from its event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: SessionState,
    #[serde(default)]
    pub last_seq: Seq,
    #[serde(default)]
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub working_dir: PathBuf,
    pub agent_server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Metadata {
    /// Metadata for a session that has no events yet.
    #[must_use]
    pub fn new(id: impl Into<String>, working_dir: impl Into<PathBuf>, agent_server: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: String::new(),
            status: SessionState::Created,
            last_seq: 0,
            message_count: 0,
            created_at: now,
            updated_at: now,
            working_dir: working_dir.into(),
            agent_server: agent_server.into(),
            archived_at: None,
        }
    }

    /// Fold one appended event into the summary.
    pub fn apply(&mut self, event: &Event) {
        self.last_seq = self.last_seq.max(event.seq);
        if event.kind.is_message() {
            self.message_count += 1;
        }
        self.updated_at = self.updated_at.max(event.timestamp);
    }

    /// Reset the log-derived counters before a replay.
    pub(crate) const fn reset_counters(&mut self) {
        self.last_seq = 0;
        self.message_count = 0;
    }
}

/// Title derived from a message: its first non-empty line, truncated.
#[must_use]
pub fn derive_title(message: &str, max_chars: usize) -> String {
    let line = message
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let mut title: String = line.chars().take(max_chars.saturating_sub(1)).collect();
    title.truncate(title.trim_end().len());
    title.push('…');
    title
}

#[cfg(test)]
mod tests {
    use gateway_core::EventPayload;

    use super::*;

    #[test]
    fn test_apply_counts_messages() {
        let mut meta = Metadata::new("s1", "/proj", "mock");
        for (seq, payload) in [
            EventPayload::user_prompt("hi"),
            EventPayload::AgentThought(gateway_core::event::TextData {
                text: "thinking".to_string(),
            }),
            EventPayload::agent_message("hello"),
        ]
        .into_iter()
        .enumerate()
        {
            meta.apply(&payload.into_event(seq as u64 + 1, Utc::now()).unwrap());
        }
        assert_eq!(meta.last_seq, 3);
        assert_eq!(meta.message_count, 2);
    }

    #[test]
    fn test_derive_title() {
        assert_eq!(derive_title("\n  Fix the build\nplease", 48), "Fix the build");
        let long = "a".repeat(60);
        let title = derive_title(&long, 48);
        assert_eq!(title.chars().count(), 48);
        assert!(title.ends_with('…'));
        assert_eq!(derive_title("", 48), "");
    }

    #[test]
    fn test_state_terminality() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Archived.is_terminal());
        assert!(!SessionState::Closing.is_terminal());
    }
}
