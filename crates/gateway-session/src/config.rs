//! Session layer configuration.

use std::{collections::BTreeSet, time::Duration};

use crate::storage::queue::DEFAULT_MAX_QUEUE_SIZE;

/// Maximum length of titles derived from message text.
pub const TITLE_MAX_CHARS: usize = 48;

/// Tunables for session lifecycle and delivery.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session without observers or activity stays in memory.
    pub idle_timeout: Duration,
    /// Extra time an idle session is kept before teardown, for reconnects.
    pub reconnect_grace: Duration,
    /// Per-observer delivery queue size. A full queue disconnects the observer.
    pub observer_queue_capacity: usize,
    /// How often the idle reaper runs.
    pub reap_interval: Duration,
    /// Agent server used when a request names none.
    pub default_agent_server: String,
    /// Agent servers whose permission requests are approved automatically.
    pub auto_approve_servers: BTreeSet<String>,
    /// Maximum number of queued messages per session.
    pub max_queue_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            reconnect_grace: Duration::from_secs(30),
            observer_queue_capacity: 1024,
            reap_interval: Duration::from_secs(15),
            default_agent_server: "default".to_string(),
            auto_approve_servers: BTreeSet::new(),
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn auto_approves(&self, agent_server: &str) -> bool {
        self.auto_approve_servers.contains(agent_server)
    }
}
