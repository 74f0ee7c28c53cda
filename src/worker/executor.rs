use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::ModelConfig;
use crate::protocol::NamedValues;
use crate::worker::run::RunControl;

/// Why a computation did not produce observations. Never fatal to the
/// session: it is reported to the coordinator as RUN_FAILED.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("run cancelled")]
    Cancelled,

    #[error("failed to write parameter file {path}: {source}")]
    WriteInput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to start model command: {0}")]
    Spawn(std::io::Error),

    #[error("model command exited with code {code:?}: {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error("failed to read observation file {path}: {source}")]
    ReadOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("observation file line {line}: cannot parse '{text}'")]
    ParseOutput { line: usize, text: String },

    #[error("{0}")]
    Other(String),
}

/// The externally defined computation evaluated for each run.
///
/// Implementations run on a background task while the protocol loop keeps
/// servicing the socket. They should watch [`RunControl::cancelled`] and
/// return promptly once cancellation is requested.
#[async_trait]
pub trait Model: Send + Sync {
    async fn execute(
        &self,
        parameters: &NamedValues,
        control: &RunControl,
    ) -> Result<NamedValues, ModelError>;
}

/// Runs a shell command per run, exchanging values through files.
///
/// Parameters are written as `name value` lines; the command must leave
/// `name value` lines in the observation file. Blank lines and lines
/// starting with `#` are ignored.
#[derive(Debug, Clone)]
pub struct CommandModel {
    config: ModelConfig,
}

impl CommandModel {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    async fn prepare_files(
        &self,
        parameters: &NamedValues,
    ) -> Result<(PathBuf, PathBuf), ModelError> {
        let (par_path, obs_path) = self.config.resolved_paths();

        tokio::fs::write(&par_path, render_parameters(parameters))
            .await
            .map_err(|source| ModelError::WriteInput {
                path: par_path.clone(),
                source,
            })?;

        // Stale output from a previous run must not be mistaken for this one
        match tokio::fs::remove_file(&obs_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ModelError::ReadOutput {
                    path: obs_path,
                    source,
                })
            }
        }

        Ok((par_path, obs_path))
    }
}

#[async_trait]
impl Model for CommandModel {
    async fn execute(
        &self,
        parameters: &NamedValues,
        control: &RunControl,
    ) -> Result<NamedValues, ModelError> {
        let (_, obs_path) = self.prepare_files(parameters).await?;

        tracing::info!(command = %self.config.command, "Starting model command");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.config.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(ModelError::Spawn)?;

        let stderr = child.stderr.take();
        let stderr_reader = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text).await;
            }
            text
        });

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = control.cancelled() => None,
        };

        let status = match waited {
            Some(status) => status.map_err(ModelError::Spawn)?,
            None => {
                tracing::info!("Cancellation requested, killing model command");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill model command");
                }
                return Err(ModelError::Cancelled);
            }
        };

        let stderr = stderr_reader.await.unwrap_or_default();
        if !status.success() {
            return Err(ModelError::CommandFailed {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        let text = tokio::fs::read_to_string(&obs_path)
            .await
            .map_err(|source| ModelError::ReadOutput {
                path: obs_path.clone(),
                source,
            })?;

        let observations = parse_observations(&text)?;
        tracing::info!(count = observations.len(), "Model command completed");
        Ok(observations)
    }
}

fn render_parameters(parameters: &NamedValues) -> String {
    let mut out = String::new();
    for (name, value) in parameters {
        let _ = writeln!(out, "{} {:e}", name, value);
    }
    out
}

/// Parse `name value` lines.
pub fn parse_observations(text: &str) -> Result<NamedValues, ModelError> {
    let mut observations = NamedValues::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let parsed = match (fields.next(), fields.next(), fields.next()) {
            (Some(name), Some(value), None) => value.parse::<f64>().ok().map(|v| (name, v)),
            _ => None,
        };

        match parsed {
            Some((name, value)) => {
                observations.insert(name.to_string(), value);
            }
            None => {
                return Err(ModelError::ParseOutput {
                    line: idx + 1,
                    text: line.to_string(),
                })
            }
        }
    }
    Ok(observations)
}
