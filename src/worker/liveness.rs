use std::time::Duration;

use tokio::time::Instant;

/// Tracks time since the last inbound message from the coordinator.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    last_inbound: Instant,
    max_silence: Option<Duration>,
}

impl LivenessMonitor {
    /// `max_silence` of `None` disables staleness detection.
    pub fn new(max_silence: Option<Duration>) -> Self {
        Self {
            last_inbound: Instant::now(),
            max_silence,
        }
    }

    /// Record inbound traffic. Receive timeouts must not call this.
    pub fn touch(&mut self) {
        self.last_inbound = Instant::now();
    }

    pub fn silence(&self) -> Duration {
        self.last_inbound.elapsed()
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Instant::now())
    }

    pub fn is_stale_at(&self, now: Instant) -> bool {
        match self.max_silence {
            Some(limit) => now.saturating_duration_since(self.last_inbound) > limit,
            None => false,
        }
    }
}
