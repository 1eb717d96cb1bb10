//! Command lines for agent servers and message hooks.

use std::process::Stdio;

use gateway_core::ExecutionContext;
use thiserror::Error;
use tokio::process::Command;

/// Environment variable carrying the session id to spawned commands.
pub const SESSION_ID_ENV: &str = "GATEWAY_SESSION_ID";
/// Environment variable carrying the agent server name to spawned commands.
pub const AGENT_SERVER_ENV: &str = "GATEWAY_AGENT_SERVER";

#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Command line cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Command line names no program")]
    EmptyCommand,
}

/// A split command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Process command for one session: runs in the session's working
    /// directory with piped stdio and the session identity in its environment.
    #[must_use]
    pub fn into_command(self, ctx: &ExecutionContext) -> Command {
        let mut cmd = Command::new(self.program);
        cmd.args(self.args)
            .current_dir(ctx.working_dir())
            .env(SESSION_ID_ENV, &ctx.session_id)
            .env(AGENT_SERVER_ENV, &ctx.agent_server)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// Shell-style command line (`"my-agent --stdio"`) plus extra arguments
/// appended unsplit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuilder {
    pub base: String,
    pub extra_args: Vec<String>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            extra_args: Vec::new(),
        }
    }

    /// Append arguments after the split base.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.extra_args.extend(params.into_iter().map(Into::into));
        self
    }

    /// Split into program and arguments.
    ///
    /// # Errors
    /// Returns an error on unbalanced quoting or when nothing names a program.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let words = shlex::split(&self.base).ok_or_else(|| CommandBuildError::InvalidBase(self.base.clone()))?;
        let mut words = words.into_iter().chain(self.extra_args.iter().cloned());
        let program = words.next().ok_or(CommandBuildError::EmptyCommand)?;
        Ok(CommandParts::new(program, words.collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_splits_quoted_args() {
        let parts = CommandBuilder::new("agent --model 'big one'")
            .params(["--stdio"])
            .build()
            .unwrap();
        assert_eq!(parts.program, "agent");
        assert_eq!(parts.args, vec!["--model", "big one", "--stdio"]);
    }

    #[test]
    fn test_params_accumulate() {
        let parts = CommandBuilder::new("hook").params(["-a"]).params(["-b c"]).build().unwrap();
        assert_eq!(parts.args, vec!["-a", "-b c"]);
    }

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(matches!(
            CommandBuilder::new("   ").build(),
            Err(CommandBuildError::EmptyCommand)
        ));
    }

    #[test]
    fn test_unbalanced_quotes_are_rejected() {
        assert!(matches!(
            CommandBuilder::new("agent 'oops").build(),
            Err(CommandBuildError::InvalidBase(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_carries_session_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::new("s-42", dir.path(), "local");
        let output = CommandBuilder::new("sh -c")
            .params([format!("printf '%s %s' \"${SESSION_ID_ENV}\" \"${AGENT_SERVER_ENV}\"; pwd")])
            .build()
            .unwrap()
            .into_command(&ctx)
            .output()
            .await
            .unwrap();
        let stdout = String::from_utf8(output.stdout).unwrap();
        assert!(stdout.starts_with("s-42 local"));
        let dir_name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(stdout.trim_end().ends_with(&dir_name));
    }
}
