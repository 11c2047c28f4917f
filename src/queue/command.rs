//! Handler that runs an external executable per item.
//!
//! The item's JSON is written to the command's stdin; whatever the command
//! prints to stdout is parsed as the JSON result (empty output is `null`).
//! A non-zero exit status fails the attempt.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{JobContext, JobError, JobHandler};

pub struct CommandHandler {
    command: PathBuf,
}

impl CommandHandler {
    /// Relative paths resolve against the current directory at construction.
    pub fn new(command: &Path) -> std::io::Result<Self> {
        let command = if command.is_relative() {
            std::env::current_dir()?.join(command)
        } else {
            command.to_path_buf()
        };
        Ok(Self { command })
    }

    pub fn command(&self) -> &Path {
        &self.command
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn handle(
        &self,
        data: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, JobError> {
        debug!(
            channel = %ctx.channel,
            job_id = %ctx.job_id,
            command = %self.command.display(),
            "running handler command"
        );

        let mut child = Command::new(&self.command)
            .env("FABRIC_CHANNEL", &ctx.channel)
            .env("FABRIC_JOB_ID", ctx.job_id.to_string())
            .env("FABRIC_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&serde_json::to_vec(&data)?).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(JobError::new(format!(
                "handler exited with status {}",
                output.status.code().unwrap_or(-1)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            Ok(serde_json::Value::Null)
        } else {
            Ok(serde_json::from_str(stdout)?)
        }
    }
}
