use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::protocol::payload;
use crate::protocol::{Envelope, MessageKind};
use crate::transport::{MessageChannel, Transport};
use crate::worker::linpack;
use crate::worker::{LivenessMonitor, Model, RunRequest, RunResult, RunStatus, RunSupervisor};

/// How one connection lifecycle ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The coordinator sent TERMINATE
    Completed,
    /// A fatal error occurred and restart-on-error is enabled
    RestartRequested(AgentError),
}

/// How an active run ended from the protocol's point of view.
enum RunConclusion {
    Concluded(RunResult),
    Killed(Option<RunResult>),
    Abandoned,
}

/// Protocol state machine for one connection to the coordinator.
///
/// ```text
/// CONNECTING -> IDLE <-> RUNNING -> TERMINATED
/// ```
///
/// While idle the loop waits up to `recv_timeout` for each message and checks
/// liveness on every timeout. While a run is active it alternates between
/// polling the run and a `run_poll_interval` receive, so PING, REQUEST_KILL
/// and TERMINATE are serviced regardless of how long the computation takes.
pub struct Session {
    config: Arc<AgentConfig>,
    model: Arc<dyn Model>,
    liveness: LivenessMonitor,
    parameter_names: Vec<String>,
    observation_names: Vec<String>,
    terminate: bool,
}

impl Session {
    pub fn new(config: Arc<AgentConfig>, model: Arc<dyn Model>) -> Self {
        let liveness = LivenessMonitor::new(config.max_silence());
        Self {
            config,
            model,
            liveness,
            parameter_names: Vec::new(),
            observation_names: Vec::new(),
            terminate: false,
        }
    }

    /// Connect and serve until TERMINATE or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns the fatal error when restart-on-error is disabled. With the
    /// policy enabled the error is wrapped in
    /// [`SessionOutcome::RestartRequested`] instead.
    pub async fn run(&mut self) -> Result<SessionOutcome> {
        self.terminate = false;

        let transport = Transport::connect(
            &self.config.host,
            self.config.port,
            self.config.poll_interval,
        )
        .await;
        let mut channel = MessageChannel::new(
            transport,
            self.config.max_send_fails,
            self.config.max_recv_fails,
        );
        self.liveness = LivenessMonitor::new(self.config.max_silence());

        let served = self.serve(&mut channel).await;
        match served {
            Ok(()) => {
                tracing::info!("Terminate requested by coordinator");
                channel.close().await;
                Ok(SessionOutcome::Completed)
            }
            Err(err) => self.terminate_or_restart(&mut channel, err).await,
        }
    }

    /// Single decision point for every fatal condition.
    async fn terminate_or_restart(
        &mut self,
        channel: &mut MessageChannel,
        err: AgentError,
    ) -> Result<SessionOutcome> {
        tracing::error!(error = %err, peer = %channel.peer(), "Fatal session error");

        if err.is_corrupt() {
            let reply = Envelope::control(MessageKind::CorruptMessage)
                .with_info("received corrupt message");
            if let Err(e) = channel.send_message(&reply).await {
                tracing::warn!(error = %e, "Failed to report corrupt message to coordinator");
            }
        }

        channel.close().await;

        if self.config.restart_on_error {
            Ok(SessionOutcome::RestartRequested(err))
        } else {
            Err(err)
        }
    }

    async fn serve(&mut self, channel: &mut MessageChannel) -> Result<()> {
        while !self.terminate {
            let received = channel
                .recv_message(Some(self.config.recv_timeout))
                .await?;

            match received {
                Some(envelope) => {
                    self.liveness.touch();
                    self.dispatch(channel, envelope).await?;
                }
                None => {
                    if self.liveness.is_stale() {
                        return Err(AgentError::PeerSilent {
                            silence_secs: self.liveness.silence().as_secs(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, channel: &mut MessageChannel, envelope: Envelope) -> Result<()> {
        match envelope.kind {
            MessageKind::RequestRunDir => {
                let cwd = std::env::current_dir()?;
                let cwd = cwd.to_string_lossy().into_owned();
                tracing::info!(cwd = %cwd, "Sending run directory");
                channel
                    .send_message(&Envelope::control(MessageKind::RunDir).with_payload(cwd))
                    .await?;
            }
            MessageKind::ParameterNames => {
                self.parameter_names = decode_name_list(&envelope, "parameter")?;
                tracing::info!(count = self.parameter_names.len(), "Received parameter names");
            }
            MessageKind::ObservationNames => {
                self.observation_names = decode_name_list(&envelope, "observation")?;
                tracing::info!(
                    count = self.observation_names.len(),
                    "Received observation names"
                );
            }
            MessageKind::RequestLinpack => {
                tracing::info!("Running linpack benchmark");
                let report = linpack::run(linpack::DEFAULT_SIZE);
                tracing::info!(
                    mflops = report.mflops,
                    seconds = report.seconds,
                    "Linpack benchmark complete"
                );
                let info = serde_json::to_string(&report)
                    .map_err(|e| AgentError::Encode(e.to_string()))?;
                channel
                    .send_message(&Envelope::control(MessageKind::Linpack).with_info(info))
                    .await?;
            }
            MessageKind::StartRun => {
                self.start_run(channel, envelope).await?;
            }
            MessageKind::Terminate => {
                self.terminate = true;
            }
            MessageKind::RequestKill => {
                tracing::info!("Received kill request with no run in progress");
            }
            MessageKind::Ping => {
                tracing::debug!("Ping received");
                channel
                    .send_message(&Envelope::control(MessageKind::Ping))
                    .await?;
            }
            other => {
                tracing::warn!(kind = %other, "Received unsupported message kind");
            }
        }
        Ok(())
    }

    async fn start_run(&mut self, channel: &mut MessageChannel, envelope: Envelope) -> Result<()> {
        let group_id = envelope.group_id;
        let run_id = envelope.run_id;

        let parameters = payload::decode_parameters(&envelope.payload, &self.parameter_names)
            .map_err(|e| {
                AgentError::CorruptMessage(format!(
                    "START_RUN payload for group {group_id} run {run_id}: {e}"
                ))
            })?;

        tracing::info!(group_id, run_id, "Received parameters, starting run");
        self.write_run_info(group_id, run_id).await;

        let run = RunSupervisor::start(
            self.model.clone(),
            RunRequest {
                group_id,
                run_id,
                parameters: parameters.clone(),
            },
        );

        let status_text = match self.supervise(channel, run).await? {
            RunConclusion::Concluded(result) => {
                self.report_result(channel, (group_id, run_id), &parameters, result)
                    .await?
            }
            RunConclusion::Killed(result) => {
                if let Some(result) = result {
                    tracing::debug!(
                        group_id,
                        run_id,
                        succeeded = result.outcome.is_ok(),
                        "Killed run concluded"
                    );
                }
                tracing::info!(group_id, run_id, "Run killed");
                let text = "run killed at coordinator request".to_string();
                channel
                    .send_message(&Envelope::new(
                        MessageKind::RunKilled,
                        group_id,
                        run_id,
                        text.clone(),
                        Bytes::new(),
                    ))
                    .await?;
                text
            }
            RunConclusion::Abandoned => {
                tracing::info!(group_id, run_id, "Run preempted by terminate request");
                String::new()
            }
        };

        if !self.terminate {
            tracing::info!("Sending ready signal to coordinator");
            channel
                .send_message(&Envelope::control(MessageKind::Ready).with_info(status_text))
                .await?;
        }
        Ok(())
    }

    /// Drive an active run until it concludes, is killed, or the session
    /// terminates. The run is cancelled before any error is returned.
    async fn supervise(
        &mut self,
        channel: &mut MessageChannel,
        run: RunSupervisor,
    ) -> Result<RunConclusion> {
        let cadence = self.config.run_poll_interval;
        let mut kill_requested = false;

        loop {
            // Sample first so a message that arrived alongside completion is
            // still handled before the run is reported.
            let concluded = run.poll() != RunStatus::Running;

            match self.receive_during_run(channel, cadence).await {
                Ok(None) => {}
                Ok(Some(kind)) => match kind {
                    MessageKind::Ping => {
                        if let Err(e) = channel
                            .send_message_within(&Envelope::control(MessageKind::Ping), cadence)
                            .await
                        {
                            run.request_cancel();
                            return Err(e);
                        }
                    }
                    MessageKind::RequestKill => {
                        if !kill_requested {
                            tracing::info!(
                                run_id = run.request().run_id,
                                "Received kill request, cancelling run"
                            );
                            run.request_cancel();
                            kill_requested = true;
                        }
                    }
                    MessageKind::Terminate => {
                        tracing::info!(
                            run_id = run.request().run_id,
                            "Received terminate request, cancelling run"
                        );
                        run.request_cancel();
                        self.terminate = true;
                        return Ok(RunConclusion::Abandoned);
                    }
                    other => {
                        tracing::error!(
                            kind = %other,
                            "Only PING, REQUEST_KILL or TERMINATE may arrive during a run"
                        );
                        run.request_cancel();
                        return Err(AgentError::ProtocolViolation(other));
                    }
                },
                Err(e) => {
                    run.request_cancel();
                    return Err(e);
                }
            }

            if concluded {
                let result = run.collect_result();
                if kill_requested {
                    return Ok(RunConclusion::Killed(result));
                }
                return Ok(RunConclusion::Concluded(result.unwrap_or_else(|| RunResult {
                    outcome: Err("run result unavailable".to_string()),
                    elapsed: Duration::ZERO,
                })));
            }
        }
    }

    async fn receive_during_run(
        &mut self,
        channel: &mut MessageChannel,
        cadence: Duration,
    ) -> Result<Option<MessageKind>> {
        match channel.recv_message(Some(cadence)).await? {
            Some(envelope) => {
                self.liveness.touch();
                Ok(Some(envelope.kind))
            }
            None => Ok(None),
        }
    }

    /// Send RUN_FINISHED or RUN_FAILED. Returns the status text for READY.
    async fn report_result(
        &mut self,
        channel: &mut MessageChannel,
        (group_id, run_id): (i32, i32),
        parameters: &payload::NamedValues,
        result: RunResult,
    ) -> Result<String> {
        let run_seconds = result.elapsed.as_secs_f64();
        let encoded = result.outcome.and_then(|observations| {
            payload::encode_run_output(
                parameters,
                &self.parameter_names,
                &observations,
                &self.observation_names,
                run_seconds,
            )
            .map_err(|e| format!("cannot report observations: {e}"))
        });

        match encoded {
            Ok(bytes) => {
                let text = format!("run complete, run took {run_seconds:.3} seconds");
                tracing::info!(group_id, run_id, run_seconds, "Run complete, sending results");
                channel
                    .send_message(&Envelope::new(
                        MessageKind::RunFinished,
                        group_id,
                        run_id,
                        text.clone(),
                        bytes,
                    ))
                    .await?;
                Ok(text)
            }
            Err(message) => {
                tracing::warn!(group_id, run_id, error = %message, "Run failed");
                let message = format!("{message}, run took {run_seconds:.3} seconds");
                channel
                    .send_message(&Envelope::new(
                        MessageKind::RunFailed,
                        group_id,
                        run_id,
                        message.clone(),
                        Bytes::new(),
                    ))
                    .await?;
                Ok(message)
            }
        }
    }

    async fn write_run_info(&self, group_id: i32, run_id: i32) {
        let Some(path) = &self.config.run_info_path else {
            return;
        };
        let contents = format!(
            "run_id, {}\ngroup_id, {}\nstarted_at, {}\n",
            run_id,
            group_id,
            chrono::Utc::now().to_rfc3339()
        );
        if let Err(e) = tokio::fs::write(path, contents).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write run info file");
        }
    }
}

fn decode_name_list(envelope: &Envelope, what: &str) -> Result<Vec<String>> {
    payload::decode_names(&envelope.payload)
        .map_err(|e| AgentError::CorruptMessage(format!("{what} name list: {e}")))
}
