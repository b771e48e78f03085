//! Subprocess backend: runs a generative CLI once per prompt
//!
//! The prompt is written to the child's stdin, or substituted for a literal
//! `{prompt}` argument when the CLI expects it on the command line. The call
//! is bounded by a timeout; a child that overruns is killed.

use super::traits::{Backend, BackendError};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Configuration for a subprocess backend
#[derive(Debug, Clone)]
pub struct CommandBackendConfig {
    /// Executable name or path
    pub command: String,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
}

impl CommandBackendConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            timeout_seconds: 120,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

pub struct CommandBackend {
    config: CommandBackendConfig,
}

impl CommandBackend {
    pub fn new(config: CommandBackendConfig) -> Self {
        Self { config }
    }

    fn prompt_in_args(&self) -> bool {
        self.config.args.iter().any(|a| a == PROMPT_PLACEHOLDER)
    }

    fn build_command(&self, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.config.command);
        for arg in &self.config.args {
            if arg == PROMPT_PLACEHOLDER {
                cmd.arg(prompt);
            } else {
                cmd.arg(arg);
            }
        }
        cmd.stdin(if self.prompt_in_args() {
            Stdio::null()
        } else {
            Stdio::piped()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Backend for CommandBackend {
    async fn invoke(&self, prompt: &str) -> Result<String, BackendError> {
        let mut child = self.build_command(prompt).spawn().map_err(|e| {
            BackendError::Unavailable(format!("failed to start '{}': {}", self.config.command, e))
        })?;

        let stdin = child.stdin.take();
        let input = prompt.as_bytes().to_vec();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };

        let seconds = self.config.timeout_seconds;
        let run = async { tokio::join!(feed, child.wait_with_output()) };
        let (fed, output) = timeout(Duration::from_secs(seconds), run)
            .await
            .map_err(|_| BackendError::Timeout { seconds })?;

        let output = output
            .map_err(|e| BackendError::Failed(format!("failed to read output: {}", e)))?;
        // A child may exit before draining stdin; its exit status decides.
        if let Err(e) = fed {
            tracing::debug!(command = %self.config.command, error = %e, "prompt write incomplete");
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(BackendError::Failed(format!(
                "'{}' exited with {}: {}",
                self.config.command, output.status, detail
            )));
        }

        if stdout.trim().is_empty() {
            return Err(BackendError::Failed(format!(
                "'{}' returned an empty response",
                self.config.command
            )));
        }

        Ok(stdout)
    }
}
