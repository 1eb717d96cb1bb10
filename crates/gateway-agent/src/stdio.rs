//! JSON-lines agent over a child process's stdin/stdout.
//!
//! Each request is written as one JSON object per line on stdin; each line on
//! stdout is a tagged [`AgentNotification`]. The process runs in its own
//! process group so that closing the connection takes down anything it spawned.

use std::sync::Arc;

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::{StreamExt, stream};
use gateway_core::{
    AgentChannel, AgentConnection, AgentConnector, AgentError, AgentNotification, AgentRequest,
    ExecutionContext, NotificationStream,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStderr, ChildStdin, ChildStdout},
    sync::Mutex,
};

use crate::command::CommandBuilder;

/// Connector that launches one agent process per session.
#[derive(Debug, Clone)]
pub struct StdioAgentConnector {
    command: CommandBuilder,
}

impl StdioAgentConnector {
    #[must_use]
    pub const fn new(command: CommandBuilder) -> Self {
        Self { command }
    }
}

#[async_trait]
impl AgentConnector for StdioAgentConnector {
    async fn connect(&self, ctx: &ExecutionContext) -> Result<AgentChannel, AgentError> {
        let parts = self
            .command
            .build()
            .map_err(|e| AgentError::Fatal(e.to_string()))?;
        let program = parts.program.clone();

        let mut child = parts
            .into_command(ctx)
            .group_spawn()
            .map_err(|e| AgentError::Fatal(format!("Failed to spawn '{program}': {e}")))?;

        let inner = child.inner();
        let (Some(stdin), Some(stdout), stderr) =
            (inner.stdin.take(), inner.stdout.take(), inner.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(AgentError::Fatal("Agent process has no stdio pipes".to_string()));
        };

        tracing::info!(
            session_id = %ctx.session_id,
            agent_server = %ctx.agent_server,
            %program,
            "Agent process started"
        );

        if let Some(stderr) = stderr {
            spawn_stderr_logger(stderr, ctx.session_id.clone());
        }

        let connection = Arc::new(StdioConnection {
            session_id: ctx.session_id.clone(),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
        });

        Ok(AgentChannel {
            connection,
            notifications: notification_stream(stdout, ctx.session_id.clone()),
        })
    }
}

/// Lazily parse notifications from the agent's stdout until EOF.
fn notification_stream(
    stdout: ChildStdout,
    session_id: String,
) -> NotificationStream {
    let lines = BufReader::new(stdout).lines();
    stream::unfold((lines, session_id), |(mut lines, session_id)| async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AgentNotification>(line) {
                        Ok(notification) => return Some((notification, (lines, session_id))),
                        Err(e) => {
                            tracing::warn!(%session_id, "Skipping unparseable agent output: {e}");
                        }
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!(%session_id, "Error reading agent stdout: {e}");
                    return None;
                }
            }
        }
    })
    .boxed()
}

fn spawn_stderr_logger(stderr: ChildStderr, session_id: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(%session_id, "agent stderr: {line}");
        }
    });
}

struct StdioConnection {
    session_id: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<AsyncGroupChild>>,
}

#[async_trait]
impl AgentConnection for StdioConnection {
    async fn send(&self, request: AgentRequest) -> Result<(), AgentError> {
        let json = serde_json::to_string(&request)
            .map_err(|e| AgentError::Recoverable(format!("Failed to encode request: {e}")))?;

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| AgentError::Fatal("Agent connection is closed".to_string()))?;

        let write = async {
            stdin.write_all(json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write
            .await
            .map_err(|e| AgentError::Fatal(format!("Failed to write to agent: {e}")))
    }

    async fn close(&self) {
        // Closing stdin lets a well-behaved agent exit on its own.
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(session_id = %self.session_id, "Failed to kill agent group: {e}");
            }
            match child.wait().await {
                Ok(status) => {
                    tracing::info!(session_id = %self.session_id, %status, "Agent process exited");
                }
                Err(e) => tracing::warn!(session_id = %self.session_id, "Failed to reap agent: {e}"),
            }
        }
    }
}

impl Drop for StdioConnection {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn ctx(dir: &std::path::Path) -> ExecutionContext {
        ExecutionContext::new("s1", dir, "echo")
    }

    #[tokio::test]
    async fn test_round_trip_through_process() {
        let dir = tempfile::tempdir().unwrap();
        // Replies to every request line with a fixed agent message.
        let script = r#"while read -r line; do echo '{"type":"agent_message","text":"pong"}'; echo 'not json'; echo '{"type":"turn_complete"}'; done"#;
        let connector = StdioAgentConnector::new(CommandBuilder::new("sh -c").params([script]));

        let mut channel = connector.connect(&ctx(dir.path())).await.unwrap();
        channel
            .connection
            .send(AgentRequest::Prompt {
                text: "ping".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            channel.notifications.next().await,
            Some(AgentNotification::AgentMessage {
                text: "pong".to_string()
            })
        );
        assert_eq!(
            channel.notifications.next().await,
            Some(AgentNotification::TurnComplete { stop_reason: None })
        );

        channel.connection.close().await;
        assert!(channel.notifications.next().await.is_none());
        assert!(
            channel
                .connection
                .send(AgentRequest::Cancel)
                .await
                .unwrap_err()
                .is_fatal()
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let connector = StdioAgentConnector::new(CommandBuilder::new("/nonexistent/agent-binary"));
        let err = connector.connect(&ctx(dir.path())).await.err().unwrap();
        assert!(err.is_fatal());
    }
}
