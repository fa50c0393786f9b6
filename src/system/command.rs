//! Host command execution.
//!
//! Every mutation of host state (iptables, ip, nmcli, rfkill, sysctl, pkill)
//! goes through a [`CommandRunner`] so the live system can be swapped for a
//! fake in tests.

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{render_command, ApError, Result};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty.
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion.
    ///
    /// A non-zero exit is not an error here; only a failure to spawn is.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs commands on the live host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| ApError::command(program, args, e.to_string()))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a command and require a zero exit status.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
) -> Result<CommandOutput> {
    let output = runner.run(program, args).await?;
    if output.success() {
        return Ok(output);
    }
    Err(failure(program, args, &output))
}

/// Classify a failed command's output into an error.
pub fn failure(program: &str, args: &[String], output: &CommandOutput) -> ApError {
    let message = output.message();
    if message.contains("Operation not permitted")
        || message.contains("Permission denied")
        || message.contains("you must be root")
    {
        return ApError::PermissionDenied;
    }
    let message = match output.code {
        Some(code) => format!("exit status {}: {}", code, message),
        None => format!("terminated by signal: {}", message),
    };
    ApError::CommandFailed {
        command: render_command(program, args),
        message,
    }
}

/// Build an owned argument vector from string slices.
pub fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_prefers_stderr() {
        let output = CommandOutput {
            code: Some(1),
            stdout: "out\n".into(),
            stderr: "  err \n".into(),
        };
        assert_eq!(output.message(), "err");

        let output = CommandOutput {
            code: Some(1),
            stdout: "only stdout\n".into(),
            stderr: String::new(),
        };
        assert_eq!(output.message(), "only stdout");
    }

    #[test]
    fn test_failure_classification() {
        let denied = CommandOutput {
            code: Some(4),
            stdout: String::new(),
            stderr: "iptables v1.8.7 (nf_tables): Could not fetch rule set generation id: Permission denied (you must be root)".into(),
        };
        assert!(matches!(
            failure("iptables", &args(&["-L"]), &denied),
            ApError::PermissionDenied
        ));

        let bad = CommandOutput {
            code: Some(2),
            stdout: String::new(),
            stderr: "Bad argument `foo'".into(),
        };
        match failure("iptables", &args(&["-C", "INPUT", "foo"]), &bad) {
            ApError::CommandFailed { command, message } => {
                assert_eq!(command, "iptables -C INPUT foo");
                assert!(message.contains("exit status 2"));
                assert!(message.contains("Bad argument"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let output = SystemRunner
            .run("sh", &args(&["-c", "echo hello; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_system_runner_spawn_failure() {
        let err = SystemRunner
            .run("/nonexistent/apshare-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ApError::CommandFailed { .. }));
    }
}
