use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::job::CommandResult;

/// Runs a job's command and reports how it exited.
///
/// Implementations must always return: timeouts, spawn failures and crashes
/// are reported as [`CommandResult::SENTINEL`] rather than as errors.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> CommandResult;
}

/// Executes commands through `sh -c`
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    timeout: Duration,
}

impl ShellExecutor {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_shell<S: Into<String>>(mut self, shell: S) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str) -> CommandResult {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                error!(command, shell = %self.shell, error = %e, "Failed to spawn command");
                return CommandResult::sentinel();
            }
        };

        // Dropping the timed-out future drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(command, error = %e, "Failed to wait for command");
                return CommandResult::sentinel();
            }
            Err(_) => {
                warn!(command, timeout = ?self.timeout, "Command timed out");
                return CommandResult::sentinel();
            }
        };

        let Some(exit_code) = output.status.code() else {
            warn!(command, status = %output.status, "Command terminated by signal");
            return CommandResult::sentinel();
        };

        if exit_code == 0 {
            debug!(command, "Command succeeded");
        } else {
            warn!(
                command,
                exit_code,
                stdout = %String::from_utf8_lossy(&output.stdout).trim_end(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "Command failed"
            );
        }

        CommandResult::new(exit_code)
    }
}
