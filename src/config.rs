use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Configuration for the external computation run by [`CommandModel`](crate::worker::CommandModel).
///
/// The command is executed with `sh -c` inside `working_dir`. Parameters are
/// written to `parameter_file` before the command starts and observations
/// are read back from `observation_file` once it exits successfully.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Shell command that evaluates one run
    pub command: String,
    /// File the parameter values are written to (relative to `working_dir`)
    pub parameter_file: PathBuf,
    /// File the observation values are read from (relative to `working_dir`)
    pub observation_file: PathBuf,
    /// Directory the command runs in. Defaults to the process working directory.
    pub working_dir: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            parameter_file: PathBuf::from("parameters.txt"),
            observation_file: PathBuf::from("observations.txt"),
            working_dir: None,
        }
    }
}

impl ModelConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Resolve the parameter and observation paths against the working directory.
    pub fn resolved_paths(&self) -> (PathBuf, PathBuf) {
        match &self.working_dir {
            Some(dir) => (
                dir.join(&self.parameter_file),
                dir.join(&self.observation_file),
            ),
            None => (self.parameter_file.clone(), self.observation_file.clone()),
        }
    }
}

/// Agent connection and protocol settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    /// Sleep between connection attempts
    pub poll_interval: Duration,
    /// Receive timeout while idle; each timeout triggers a liveness check
    pub recv_timeout: Duration,
    /// Dispatch cadence while a run is active
    pub run_poll_interval: Duration,
    /// Seconds without inbound traffic before the coordinator is declared
    /// dead. Zero or negative waits forever.
    pub max_no_ping_secs: i64,
    /// Reconnect instead of exiting after a fatal session error
    pub restart_on_error: bool,
    pub restart_backoff: Duration,
    /// Upper bound of the random delay added to `restart_backoff`
    pub restart_jitter: Duration,
    pub max_send_fails: u32,
    pub max_recv_fails: u32,
    /// Where to record the ids of the run in progress
    pub run_info_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4004,
            poll_interval: Duration::from_secs(1),
            recv_timeout: Duration::from_secs(1),
            run_poll_interval: Duration::from_millis(100),
            max_no_ping_secs: 300,
            restart_on_error: false,
            restart_backoff: Duration::from_secs(5),
            restart_jitter: Duration::from_millis(500),
            max_send_fails: 100,
            max_recv_fails: 100,
            run_info_path: None,
        }
    }
}

impl AgentConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_restart_on_error(mut self, restart: bool) -> Self {
        self.restart_on_error = restart;
        self
    }

    pub fn with_max_no_ping_secs(mut self, secs: i64) -> Self {
        self.max_no_ping_secs = secs;
        self
    }

    pub fn with_run_info_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.run_info_path = Some(path.into());
        self
    }

    /// Liveness threshold, or `None` when the check is disabled.
    pub fn max_silence(&self) -> Option<Duration> {
        if self.max_no_ping_secs > 0 {
            Some(Duration::from_secs(self.max_no_ping_secs as u64))
        } else {
            None
        }
    }

    /// Reject settings that would stall the protocol loop.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(AgentError::InvalidConfig("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(AgentError::InvalidConfig("port must be non-zero".into()));
        }
        if self.recv_timeout.is_zero() {
            return Err(AgentError::InvalidConfig(
                "receive timeout must be positive".into(),
            ));
        }
        if self.run_poll_interval.is_zero() {
            return Err(AgentError::InvalidConfig(
                "run poll interval must be positive".into(),
            ));
        }
        Ok(())
    }
}
