//! Message hooks backed by external commands.

use std::time::Duration;

use async_trait::async_trait;
use gateway_core::{ExecutionContext, HookError, HookErrorPolicy, MessageHook};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::command::CommandBuilder;

/// Default time a hook command may run.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct HookInput<'a> {
    message: &'a str,
    working_dir: String,
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct HookOutput {
    message: String,
}

/// Hook that pipes the message through an external command.
///
/// The command receives `{"message", "working_dir", "session_id"}` as JSON on
/// stdin and must print `{"message": "..."}` on stdout. Empty output leaves
/// the message unchanged.
#[derive(Debug, Clone)]
pub struct CommandHook {
    name: String,
    command: CommandBuilder,
    policy: HookErrorPolicy,
    timeout: Duration,
}

impl CommandHook {
    #[must_use]
    pub fn new(name: impl Into<String>, command: CommandBuilder) -> Self {
        Self {
            name: name.into(),
            command,
            policy: HookErrorPolicy::default(),
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: HookErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn error(&self, reason: impl Into<String>) -> HookError {
        HookError {
            hook: self.name.clone(),
            reason: reason.into(),
            policy: self.policy,
        }
    }

    async fn run(&self, ctx: &ExecutionContext, message: &str) -> Result<String, HookError> {
        let parts = self.command.build().map_err(|e| self.error(e.to_string()))?;
        let mut cmd = parts.into_command(ctx);
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| self.error(format!("spawn failed: {e}")))?;

        let input = serde_json::to_vec(&HookInput {
            message,
            working_dir: ctx.working_dir().display().to_string(),
            session_id: &ctx.session_id,
        })
        .map_err(|e| self.error(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| self.error(format!("write failed: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.error(format!("wait failed: {e}")))?;
        if !output.status.success() {
            return Err(self.error(format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(message.to_string());
        }
        let parsed: HookOutput =
            serde_json::from_str(stdout.trim()).map_err(|e| self.error(format!("bad output: {e}")))?;
        Ok(parsed.message)
    }
}

#[async_trait]
impl MessageHook for CommandHook {
    async fn transform(&self, ctx: &ExecutionContext, message: &str) -> Result<String, HookError> {
        match tokio::time::timeout(self.timeout, self.run(ctx, message)).await {
            Ok(result) => result,
            Err(_) => Err(self.error(format!("timed out after {:?}", self.timeout))),
        }
    }
}
