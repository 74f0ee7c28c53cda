use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::agent::session::{Session, SessionOutcome};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::worker::Model;

/// Owns the restart policy: runs sessions back to back until one completes
/// or fails with restart-on-error disabled.
pub struct AgentSupervisor {
    config: Arc<AgentConfig>,
    model: Arc<dyn Model>,
}

impl AgentSupervisor {
    pub fn new(config: AgentConfig, model: Arc<dyn Model>) -> Self {
        Self {
            config: Arc::new(config),
            model,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Serve the coordinator until it sends TERMINATE.
    ///
    /// # Errors
    ///
    /// Returns the first fatal session error when restart-on-error is
    /// disabled.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            restart_on_error = self.config.restart_on_error,
            "Starting agent"
        );

        let mut sessions = 0u64;
        loop {
            sessions += 1;
            let mut session = Session::new(self.config.clone(), self.model.clone());

            match session.run().await? {
                SessionOutcome::Completed => {
                    tracing::info!(sessions, "Agent finished");
                    return Ok(());
                }
                SessionOutcome::RestartRequested(err) => {
                    let delay =
                        restart_delay(self.config.restart_backoff, self.config.restart_jitter);
                    tracing::warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Restarting agent session"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Backoff plus a uniformly random share of `jitter`.
pub fn restart_delay(backoff: Duration, jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return backoff;
    }
    let mut rng = rand::thread_rng();
    backoff + Duration::from_millis(rng.gen_range(0..=jitter_ms))
}
