//! Run execution on the agent side.
//!
//! - [`RunSupervisor`]: starts a computation on a background task and lets the
//!   protocol loop cancel it, poll it and collect its result
//! - [`Model`]: the externally defined computation, with [`CommandModel`] as
//!   the shell-command implementation
//! - [`LivenessMonitor`]: detects a coordinator that has gone silent
//! - [`linpack`]: local benchmark reported to the coordinator on request

pub mod executor;
pub mod linpack;
pub mod liveness;
pub mod run;

pub use executor::{CommandModel, Model, ModelError};
pub use liveness::LivenessMonitor;
pub use run::{RunControl, RunRequest, RunResult, RunStatus, RunSupervisor};
