//! Coordinator/agent wire protocol.
//!
//! - [`message`]: message kinds and the [`Envelope`] every exchange is wrapped in
//! - [`codec`]: length-prefixed framing of envelopes over a byte stream
//! - [`payload`]: bodies carried inside envelopes (name lists, run values)

pub mod codec;
pub mod message;
pub mod payload;

pub use codec::{CodecError, EnvelopeCodec, MAX_FRAME_SIZE};
pub use message::{Envelope, MessageKind};
pub use payload::{NamedValues, PayloadError, RunValues};
