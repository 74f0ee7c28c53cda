//! Stream transport to the coordinator.
//!
//! - [`Transport`]: one framed socket with connect-with-retry, bounded
//!   receive, single-attempt send and close
//! - [`MessageChannel`]: retry policy layered on top of a transport

pub mod channel;
pub mod connection;

pub use channel::MessageChannel;
pub use connection::{Transport, TransportError};
