//! Routing of sessions to named agent servers.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use gateway_core::{AgentChannel, AgentConnector, AgentError, ExecutionContext};

/// Named agent servers, each backed by its own connector.
#[derive(Clone, Default)]
pub struct AgentServers {
    servers: BTreeMap<String, Arc<dyn AgentConnector>>,
}

impl AgentServers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a server.
    #[must_use]
    pub fn with_server(mut self, name: impl Into<String>, connector: Arc<dyn AgentConnector>) -> Self {
        self.servers.insert(name.into(), connector);
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    /// Registered server names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }
}

#[async_trait]
impl AgentConnector for AgentServers {
    async fn connect(&self, ctx: &ExecutionContext) -> Result<AgentChannel, AgentError> {
        let connector = self
            .servers
            .get(&ctx.agent_server)
            .ok_or_else(|| AgentError::Fatal(format!("Unknown agent server: {}", ctx.agent_server)))?;
        connector.connect(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;

    #[tokio::test]
    async fn test_routes_by_server_name() {
        let mock = MockAgent::new();
        let servers = AgentServers::new().with_server("mock", Arc::new(mock.clone()));

        assert!(servers.contains("mock"));
        assert!(servers.connect(&ExecutionContext::new("s1", "/p", "mock")).await.is_ok());
        assert_eq!(mock.connect_count(), 1);

        let err = servers
            .connect(&ExecutionContext::new("s2", "/p", "missing"))
            .await
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }
}
