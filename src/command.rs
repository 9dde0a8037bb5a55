//! External command execution for `command.<cmd>` sources.
//!
//! Commands run through a [`CommandRunner`]. The process implementation
//! bounds concurrency with a semaphore and kills the child when the timeout
//! elapses, so a slow command only stalls the request that issued it.

use crate::config::CommandSettings;
use crate::error::CommandError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::debug;

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub return_code: i32,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<CommandOutput, CommandError>;
}

/// Runs commands through a shell as child processes.
pub struct ProcessRunner {
    shell: String,
    permits: Semaphore,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(shell: impl Into<String>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            permits: Semaphore::new(max_concurrent.max(1)),
            timeout,
        }
    }

    pub fn from_settings(settings: &CommandSettings) -> Self {
        Self::new(
            settings.shell.clone(),
            settings.max_concurrent,
            Duration::from_millis(settings.timeout_ms),
        )
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput, CommandError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CommandError::PoolClosed)?;

        debug!(command, "Executing command");
        let mut child = Command::new(&self.shell);
        child
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, child.output())
            .await
            .map_err(|_| CommandError::Timeout(self.timeout))??;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            return_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Rejects every command.
pub struct DisabledRunner;

#[async_trait]
impl CommandRunner for DisabledRunner {
    async fn run(&self, _command: &str) -> Result<CommandOutput, CommandError> {
        Err(CommandError::Disabled)
    }
}
