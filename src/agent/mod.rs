//! Coordinator-facing protocol loop and its restart policy.

pub mod session;
pub mod supervisor;

pub use session::{Session, SessionOutcome};
pub use supervisor::{restart_delay, AgentSupervisor};
