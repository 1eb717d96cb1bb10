//! Gateway configuration file and environment overrides.

use std::{
    collections::BTreeSet,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use gateway_agent::{AgentServers, CommandBuilder, CommandHook, MockAgent, StdioAgentConnector};
use gateway_core::{HookErrorPolicy, MessageHook};
use gateway_session::{LockPolicy, SessionConfig};
use serde::Deserialize;

/// Name under which the in-process mock agent is always registered.
pub const MOCK_SERVER: &str = "mock";

const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 10;

/// An external agent server, launched once per live session.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub auto_approve: bool,
}

/// An external message hook.
#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub on_error: HookErrorPolicy,
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
}

const fn default_hook_timeout() -> u64 {
    DEFAULT_HOOK_TIMEOUT_SECS
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub default_agent_server: Option<String>,
    pub agent_servers: Vec<AgentServerConfig>,
    pub hooks: Vec<HookConfig>,
    pub blocked_origins: Vec<IpAddr>,
    pub idle_timeout_secs: u64,
    pub reconnect_grace_secs: u64,
    pub reap_interval_secs: u64,
    pub observer_queue_capacity: usize,
    pub max_queue_size: usize,
    pub lock_heartbeat_secs: u64,
    pub lock_stale_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        let lock = LockPolicy::default();
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3000)),
            data_dir: default_data_dir(),
            default_agent_server: None,
            agent_servers: Vec::new(),
            hooks: Vec::new(),
            blocked_origins: Vec::new(),
            idle_timeout_secs: session.idle_timeout.as_secs(),
            reconnect_grace_secs: session.reconnect_grace.as_secs(),
            reap_interval_secs: session.reap_interval.as_secs(),
            observer_queue_capacity: session.observer_queue_capacity,
            max_queue_size: session.max_queue_size,
            lock_heartbeat_secs: lock.heartbeat_interval.as_secs(),
            lock_stale_secs: lock.stale_after.as_secs(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agent-gateway")
}

impl GatewayConfig {
    /// Load from `$GATEWAY_CONFIG` (or `<data_dir>/config.json`) and apply
    /// `GATEWAY_LISTEN` / `GATEWAY_DATA_DIR`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if
    /// an override is malformed.
    pub fn load() -> anyhow::Result<Self> {
        let data_dir = std::env::var_os("GATEWAY_DATA_DIR").map(PathBuf::from);
        let path = std::env::var_os("GATEWAY_CONFIG").map_or_else(
            || data_dir.clone().unwrap_or_else(default_data_dir).join("config.json"),
            PathBuf::from,
        );

        let mut config = Self::from_file(&path)?;
        config.apply_overrides(std::env::var("GATEWAY_LISTEN").ok().as_deref(), data_dir)?;
        Ok(config)
    }

    /// Read a config file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid config JSON.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).with_context(|| format!("Invalid config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read config file {}", path.display())),
        }
    }

    fn apply_overrides(&mut self, listen: Option<&str>, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
        if let Some(listen) = listen {
            self.listen = listen
                .parse()
                .with_context(|| format!("Invalid GATEWAY_LISTEN address '{listen}'"))?;
        }
        if let Some(data_dir) = data_dir {
            self.data_dir = data_dir;
        }
        Ok(())
    }

    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Session-layer tunables derived from this config.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let default_agent_server = self.default_agent_server.clone().unwrap_or_else(|| {
            self.agent_servers
                .first()
                .map_or_else(|| MOCK_SERVER.to_string(), |server| server.name.clone())
        });
        let auto_approve_servers: BTreeSet<String> = self
            .agent_servers
            .iter()
            .filter(|server| server.auto_approve)
            .map(|server| server.name.clone())
            .collect();

        SessionConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            reconnect_grace: Duration::from_secs(self.reconnect_grace_secs),
            observer_queue_capacity: self.observer_queue_capacity.max(1),
            reap_interval: Duration::from_secs(self.reap_interval_secs.max(1)),
            default_agent_server,
            auto_approve_servers,
            max_queue_size: self.max_queue_size,
        }
    }

    /// Heartbeat timing of session writer locks. The stale timeout never drops
    /// below two heartbeats.
    #[must_use]
    pub fn lock_policy(&self) -> LockPolicy {
        let heartbeat_interval = Duration::from_secs(self.lock_heartbeat_secs.max(1));
        LockPolicy {
            heartbeat_interval,
            stale_after: Duration::from_secs(self.lock_stale_secs).max(heartbeat_interval * 2),
        }
    }

    /// Registry of every configured agent server, plus the mock agent.
    #[must_use]
    pub fn agent_servers(&self) -> AgentServers {
        self.agent_servers.iter().fold(
            AgentServers::new().with_server(MOCK_SERVER, Arc::new(MockAgent::new())),
            |servers, server| {
                servers.with_server(
                    server.name.clone(),
                    Arc::new(StdioAgentConnector::new(CommandBuilder::new(server.command.clone()))),
                )
            },
        )
    }

    #[must_use]
    pub fn message_hooks(&self) -> Vec<Arc<dyn MessageHook>> {
        self.hooks
            .iter()
            .map(|hook| {
                Arc::new(
                    CommandHook::new(hook.name.clone(), CommandBuilder::new(hook.command.clone()))
                        .with_policy(hook.on_error)
                        .with_timeout(Duration::from_secs(hook.timeout_secs)),
                ) as Arc<dyn MessageHook>
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::from_file(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.listen, SocketAddr::from(([127, 0, 0, 1], 3000)));
        assert!(config.agent_servers.is_empty());

        let session = config.session_config();
        assert_eq!(session.default_agent_server, MOCK_SERVER);
        assert_eq!(session.idle_timeout, SessionConfig::default().idle_timeout);
        assert!(config.agent_servers().contains(MOCK_SERVER));
        assert_eq!(config.lock_policy(), LockPolicy::default());
    }

    #[test]
    fn test_parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "listen": "0.0.0.0:8080",
                "agent_servers": [
                    {"name": "claude", "command": "claude-agent --stdio", "auto_approve": true},
                    {"name": "local", "command": "local-agent"}
                ],
                "hooks": [{"name": "redact", "command": "redact-secrets", "on_error": "fail"}],
                "blocked_origins": ["10.0.0.7"],
                "idle_timeout_secs": 60,
                "reconnect_grace_secs": 5,
                "lock_heartbeat_secs": 5,
                "lock_stale_secs": 3
            }"#,
        )
        .unwrap();

        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.hooks[0].on_error, HookErrorPolicy::Fail);
        assert_eq!(config.hooks[0].timeout_secs, DEFAULT_HOOK_TIMEOUT_SECS);
        assert_eq!(config.message_hooks().len(), 1);
        assert_eq!(config.blocked_origins, vec!["10.0.0.7".parse::<IpAddr>().unwrap()]);

        let session = config.session_config();
        assert_eq!(session.default_agent_server, "claude");
        assert!(session.auto_approves("claude"));
        assert!(!session.auto_approves("local"));
        assert_eq!(session.idle_timeout, Duration::from_secs(60));
        assert_eq!(session.reconnect_grace, Duration::from_secs(5));

        let servers = config.agent_servers();
        assert_eq!(servers.names().len(), 3);

        let lock = config.lock_policy();
        assert_eq!(lock.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(lock.stale_after, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides_and_bad_input() {
        let mut config = GatewayConfig::default();
        config
            .apply_overrides(Some("127.0.0.1:9999"), Some(PathBuf::from("/srv/gateway")))
            .unwrap();
        assert_eq!(config.listen.port(), 9999);
        assert_eq!(config.sessions_dir(), PathBuf::from("/srv/gateway/sessions"));
        assert!(config.apply_overrides(Some("not an address"), None).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(GatewayConfig::from_file(&path).is_err());
    }
}
