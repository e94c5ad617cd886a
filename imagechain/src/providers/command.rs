//! Transformation executor that runs an external provisioning command.
//!
//! The command receives a JSON document on stdin describing the stage and
//! the target instance. Its output is streamed to the log. Failure is
//! signalled by a non-zero exit status or by a marker on the last output
//! line. Connection failures are retried here, invisible to the orchestrator.

use super::{TransformExecutor, TransformRequest};
use crate::errors::{ChainError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Marker a provisioning script prints as its last line when it failed.
pub const DEFAULT_FAILURE_MARKER: &str = "+-+-+-+ERROR+-+-+-+";

fn default_failure_marker() -> String {
    DEFAULT_FAILURE_MARKER.to_string()
}

fn default_connection_error_pattern() -> String {
    "ECONNREFUSED|ETIMEDOUT".to_string()
}

fn default_max_connection_retries() -> u32 {
    10
}

fn default_retry_delay() -> f64 {
    15.0
}

/// Settings for [`CommandTransformExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSettings {
    /// Executable to run.
    pub program: String,
    /// Arguments placed before the stage name.
    #[serde(default)]
    pub args: Vec<String>,
    /// Passed through to the command as `options`.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    /// Last-line marker signalling failure.
    #[serde(default = "default_failure_marker")]
    pub failure_marker: String,
    /// Output matching this pattern marks a connection failure.
    #[serde(default = "default_connection_error_pattern")]
    pub connection_error_pattern: String,
    /// How often a connection failure is retried.
    #[serde(default = "default_max_connection_retries")]
    pub max_connection_retries: u32,
    /// Pause between retries in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: f64,
}

impl CommandSettings {
    /// Creates settings for `program` with default retry behavior.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            options: serde_json::Map::new(),
            failure_marker: default_failure_marker(),
            connection_error_pattern: default_connection_error_pattern(),
            max_connection_retries: default_max_connection_retries(),
            retry_delay_seconds: default_retry_delay(),
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a pass-through option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Sets the retry policy for connection failures.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, delay_seconds: f64) -> Self {
        self.max_connection_retries = max_retries;
        self.retry_delay_seconds = delay_seconds;
        self
    }

    /// Gets the retry delay as Duration.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_seconds.max(0.0))
    }
}

/// Payload written to the command's stdin.
#[derive(Debug, Serialize)]
struct CommandPayload<'a> {
    script: &'a str,
    tags: &'a crate::core::Fingerprint,
    version: &'a str,
    name: &'a str,
    options: &'a serde_json::Map<String, serde_json::Value>,
    server: &'a str,
}

/// Result of one run of the command.
#[derive(Debug)]
struct Attempt {
    success: bool,
    exit_code: Option<i32>,
    last_line: String,
    connection_failure: bool,
}

/// Runs an external command per stage.
#[derive(Debug, Clone)]
pub struct CommandTransformExecutor {
    settings: CommandSettings,
    connection_error: Regex,
}

impl CommandTransformExecutor {
    /// Creates an executor.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the connection error pattern is not a valid regex.
    pub fn new(settings: CommandSettings) -> Result<Self> {
        let connection_error = Regex::new(&settings.connection_error_pattern).map_err(|e| {
            ChainError::configuration(format!("invalid connection_error_pattern: {e}"))
        })?;
        Ok(Self {
            settings,
            connection_error,
        })
    }

    /// Returns the settings.
    #[must_use]
    pub fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn run_once(&self, request: &TransformRequest, payload: &[u8]) -> Result<Attempt> {
        let stage = request.name.as_str();
        let mut child = Command::new(&self.settings.program)
            .args(&self.settings.args)
            .arg(stage)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let program = &self.settings.program;
                ChainError::transform(stage, format!("failed to run {program}: {e}"))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(payload).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => return Err(ChainError::transform(stage, format!("writing stdin: {e}"))),
            }
        }

        let stderr_task = child.stderr.take().map(|stderr| {
            let pattern = self.connection_error.clone();
            let stage = stage.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut matched = false;
                while let Ok(Some(line)) = lines.next_line().await {
                    matched |= pattern.is_match(&line);
                    warn!(stage = %stage, "{line}");
                }
                matched
            })
        });

        let mut last_line = String::new();
        let mut connection_failure = false;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| ChainError::transform(stage, format!("reading output: {e}")))?
            {
                connection_failure |= self.connection_error.is_match(&line);
                info!(stage = %stage, "{line}");
                if !line.trim().is_empty() {
                    last_line = line;
                }
            }
        }

        if let Some(task) = stderr_task {
            connection_failure |= task.await.unwrap_or(false);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ChainError::transform(stage, format!("waiting for command: {e}")))?;

        Ok(Attempt {
            success: status.success(),
            exit_code: status.code(),
            last_line,
            connection_failure,
        })
    }
}

#[async_trait]
impl TransformExecutor for CommandTransformExecutor {
    async fn execute(&self, request: &TransformRequest, target_address: &str) -> Result<()> {
        let stage = request.name.as_str();
        let payload = serde_json::to_vec(&CommandPayload {
            script: &request.transform_source,
            tags: &request.tags,
            version: &request.version,
            name: stage,
            options: &self.settings.options,
            server: target_address,
        })?;

        let mut retries_left = self.settings.max_connection_retries;
        loop {
            let attempt = self.run_once(request, &payload).await?;
            let marked = attempt.last_line.contains(&self.settings.failure_marker);

            if (marked || !attempt.success) && attempt.connection_failure && retries_left > 0 {
                retries_left -= 1;
                warn!(
                    stage = %stage,
                    server = %target_address,
                    retries_left,
                    "Connection failed, retrying..."
                );
                tokio::time::sleep(self.settings.retry_delay()).await;
                continue;
            }

            if !attempt.success {
                return Err(ChainError::transform(
                    stage,
                    format!(
                        "{} exited with status {}",
                        request.transform_source,
                        attempt
                            .exit_code
                            .map_or_else(|| "signal".to_string(), |c| c.to_string())
                    ),
                ));
            }

            if marked {
                return Err(ChainError::transform(
                    stage,
                    format!("Error while executing {}", request.transform_source),
                ));
            }

            return Ok(());
        }
    }
}
