use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use jobwire::agent::AgentSupervisor;
use jobwire::config::{AgentConfig, ModelConfig};
use jobwire::shutdown::install_shutdown_handler;
use jobwire::worker::CommandModel;

#[derive(Parser, Debug)]
#[command(name = "jobwire-agent")]
#[command(version)]
#[command(about = "Worker agent that evaluates model runs for a remote coordinator")]
struct Args {
    /// Coordinator host name or address
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Coordinator port
    #[arg(long, default_value = "4004")]
    port: u16,

    /// Shell command that evaluates one run
    #[arg(long)]
    command: String,

    /// File the parameters are written to before each run
    #[arg(long, default_value = "parameters.txt")]
    parameter_file: PathBuf,

    /// File the command leaves its observations in
    #[arg(long, default_value = "observations.txt")]
    observation_file: PathBuf,

    /// Directory the command runs in (defaults to the current directory)
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Seconds between connection attempts
    #[arg(long, default_value = "1")]
    poll_interval_secs: u64,

    /// Seconds to wait for each message while idle
    #[arg(long, default_value = "1")]
    recv_timeout_secs: u64,

    /// Milliseconds between checks on an active run
    #[arg(long, default_value = "100")]
    run_poll_interval_ms: u64,

    /// Seconds of coordinator silence before giving up (0 or negative waits forever)
    #[arg(long, default_value = "300", allow_negative_numbers = true)]
    max_no_ping_secs: i64,

    /// Reconnect after a fatal error instead of exiting
    #[arg(long)]
    restart_on_error: bool,

    /// Consecutive send failures tolerated before the session fails
    #[arg(long, default_value = "100")]
    max_send_fails: u32,

    /// Consecutive receive failures tolerated before the session fails
    #[arg(long, default_value = "100")]
    max_recv_fails: u32,

    /// Record the ids of the run in progress in this file
    #[arg(long)]
    run_info: Option<PathBuf>,

    /// Append-only agent log
    #[arg(long, default_value = "jobwire-agent.log")]
    log_file: PathBuf,
}

impl Args {
    fn agent_config(&self) -> AgentConfig {
        let mut config = AgentConfig::new(self.host.clone(), self.port)
            .with_restart_on_error(self.restart_on_error)
            .with_max_no_ping_secs(self.max_no_ping_secs);
        config.poll_interval = Duration::from_secs(self.poll_interval_secs);
        config.recv_timeout = Duration::from_secs(self.recv_timeout_secs);
        config.run_poll_interval = Duration::from_millis(self.run_poll_interval_ms);
        config.max_send_fails = self.max_send_fails;
        config.max_recv_fails = self.max_recv_fails;
        if let Some(path) = &self.run_info {
            config = config.with_run_info_path(path);
        }
        config
    }

    fn model_config(&self) -> ModelConfig {
        let mut model = ModelConfig::new(self.command.clone());
        model.parameter_file = self.parameter_file.clone();
        model.observation_file = self.observation_file.clone();
        if let Some(dir) = &self.working_dir {
            model = model.with_working_dir(dir);
        }
        model
    }
}

fn init_logging(log_file: &Path) -> Option<std::io::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let opened = OpenOptions::new().create(true).append(true).open(log_file);
    let (file_layer, open_error) = match opened {
        Ok(file) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    open_error
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(e) = init_logging(&args.log_file) {
        tracing::warn!(
            path = %args.log_file.display(),
            error = %e,
            "Cannot open log file, logging to stderr only"
        );
    }

    let config = args.agent_config();
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid agent configuration");
        return ExitCode::FAILURE;
    }

    let model = Arc::new(CommandModel::new(args.model_config()));
    let supervisor = AgentSupervisor::new(config, model);
    let shutdown = install_shutdown_handler();

    tokio::select! {
        result = supervisor.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "Agent stopped after fatal error");
                ExitCode::FAILURE
            }
        },
        _ = shutdown.cancelled() => {
            tracing::info!("Agent shut down by signal");
            ExitCode::SUCCESS
        }
    }
}
