use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::NamedValues;
use crate::worker::executor::Model;

/// One run assignment.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub group_id: i32,
    pub run_id: i32,
    pub parameters: NamedValues,
}

/// What the computation produced, collected once the run concludes.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Observations on success, failure text otherwise
    pub outcome: Result<NamedValues, String>,
    pub elapsed: Duration,
}

/// Non-blocking view of a run in progress.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Running,
    Finished,
    Failed(String),
}

/// State shared between the protocol loop and one run's background task.
///
/// Each field has a single writer: cancellation is requested only by the
/// protocol loop, while the outcome and the completion flag are written only
/// by the task, outcome first.
#[derive(Debug, Default)]
pub struct RunControl {
    cancel: CancellationToken,
    finished: AtomicBool,
    outcome: Mutex<Option<RunResult>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn complete(&self, result: RunResult) {
        *self.outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
        self.finished.store(true, Ordering::Release);
    }

    fn failure(&self) -> Option<String> {
        self.outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|r| r.outcome.as_ref().err().cloned())
    }

    fn take(&self) -> Option<RunResult> {
        self.outcome.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Runs one computation on a background task.
///
/// Dropping the supervisor detaches the task; it keeps running until the
/// model honors a cancellation request or finishes on its own.
pub struct RunSupervisor {
    request: RunRequest,
    control: Arc<RunControl>,
}

impl RunSupervisor {
    /// Spawn `model` for `request` and return immediately.
    pub fn start(model: Arc<dyn Model>, request: RunRequest) -> Self {
        let control = Arc::new(RunControl::new());
        let task_control = control.clone();
        let parameters = request.parameters.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let result = AssertUnwindSafe(model.execute(&parameters, &task_control))
                .catch_unwind()
                .await;

            let outcome = match result {
                Ok(Ok(observations)) => Ok(observations),
                Ok(Err(e)) => Err(e.to_string()),
                Err(panic) => Err(format!("computation panicked: {}", panic_message(&*panic))),
            };
            task_control.complete(RunResult {
                outcome,
                elapsed: started.elapsed(),
            });
        });

        Self { request, control }
    }

    pub fn request(&self) -> &RunRequest {
        &self.request
    }

    pub fn request_cancel(&self) {
        self.control.request_cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn poll(&self) -> RunStatus {
        if !self.control.is_finished() {
            return RunStatus::Running;
        }
        match self.control.failure() {
            Some(message) => RunStatus::Failed(message),
            None => RunStatus::Finished,
        }
    }

    /// Take the run's result, releasing the shared state. `None` while the
    /// run is still in progress.
    pub fn collect_result(self) -> Option<RunResult> {
        if !self.control.is_finished() {
            return None;
        }
        self.control.take()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
