//! External command execution.
//!
//! Both the queue CLI and the compute launch CLI go through a
//! `CommandExecutor`, which lets tests substitute canned outputs.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{GridScaleError, Result};

/// Runs an external program and returns its stdout.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute `program` with `args`. A non-zero exit is an `Execution` error.
    async fn execute(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// Executes commands as child processes of the daemon.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<String> {
        let command = command_line(program, args);
        debug!(%command, "executing");
        let output = Command::new(program).args(args).output().await?;
        if !output.status.success() {
            return Err(GridScaleError::Execution {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Render a command the way it would be typed, for logs and fakes.
pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_joins_arguments() {
        assert_eq!(command_line("qmod", &["-e", "main.q@host-1"]), "qmod -e main.q@host-1");
        assert_eq!(command_line("qconf", &[]), "qconf");
    }

    #[tokio::test]
    async fn shell_executor_captures_stdout() {
        let out = ShellExecutor.execute("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn shell_executor_reports_non_zero_exit() {
        let err = ShellExecutor.execute("false", &[]).await.unwrap_err();
        assert!(matches!(err, GridScaleError::Execution { code: Some(1), .. }));
    }
}
