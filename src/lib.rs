pub mod agent;
pub mod config;
pub mod error;
pub mod protocol;
pub mod shutdown;
pub mod transport;
pub mod worker;
