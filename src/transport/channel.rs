use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{AgentError, Result};
use crate::protocol::Envelope;
use crate::transport::connection::{Transport, TransportError};

/// Retrying wrapper around [`Transport`].
///
/// Transient I/O failures are retried up to the configured cap; the attempt
/// after the cap is exhausted is fatal. Corrupt frames and a closed peer are
/// fatal immediately.
pub struct MessageChannel<S = TcpStream> {
    transport: Transport<S>,
    max_send_fails: u32,
    max_recv_fails: u32,
}

impl<S> MessageChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(transport: Transport<S>, max_send_fails: u32, max_recv_fails: u32) -> Self {
        Self {
            transport,
            max_send_fails,
            max_recv_fails,
        }
    }

    pub fn peer(&self) -> &str {
        self.transport.peer()
    }

    /// Receive one envelope, or `Ok(None)` if nothing arrived within `timeout`.
    pub async fn recv_message(&mut self, timeout: Option<Duration>) -> Result<Option<Envelope>> {
        let mut failures = 0u32;
        loop {
            match self.transport.receive(timeout).await {
                Ok(received) => return Ok(received),
                Err(TransportError::Io(e)) => {
                    failures += 1;
                    if failures > self.max_recv_fails {
                        tracing::error!(
                            peer = %self.transport.peer(),
                            failures,
                            error = %e,
                            "Receive from coordinator failed too many times"
                        );
                        return Err(AgentError::ReceiveFailed {
                            attempts: failures,
                            source: e,
                        });
                    }
                    tracing::warn!(
                        peer = %self.transport.peer(),
                        failures,
                        error = %e,
                        "Receive from coordinator failed, retrying"
                    );
                }
                Err(TransportError::Corrupt(e)) => {
                    tracing::error!(peer = %self.transport.peer(), error = %e, "Received corrupt message");
                    return Err(AgentError::CorruptMessage(e.to_string()));
                }
                Err(TransportError::Closed) => {
                    tracing::error!(peer = %self.transport.peer(), "Lost connection to coordinator");
                    return Err(AgentError::PeerClosed);
                }
                Err(TransportError::Encode(e)) => return Err(AgentError::Encode(e.to_string())),
                Err(TransportError::NotConnected) => return Err(AgentError::NotConnected),
                Err(TransportError::Incomplete) => return Err(AgentError::Desynchronized),
            }
        }
    }

    /// Deliver one envelope, retrying transient failures.
    ///
    /// A retry resumes the frame from the first byte the socket did not
    /// accept. Once the cap is exhausted the stream is out of step with the
    /// peer, so the transport is closed.
    pub async fn send_message(&mut self, envelope: &Envelope) -> Result<()> {
        self.send_with_limit(envelope, None).await
    }

    /// Like [`MessageChannel::send_message`], but each attempt gives up after
    /// `attempt_timeout` and counts as a transient failure. Used while a run
    /// is active so a peer that stops reading cannot stall the loop.
    pub async fn send_message_within(
        &mut self,
        envelope: &Envelope,
        attempt_timeout: Duration,
    ) -> Result<()> {
        self.send_with_limit(envelope, Some(attempt_timeout)).await
    }

    async fn send_with_limit(
        &mut self,
        envelope: &Envelope,
        attempt_timeout: Option<Duration>,
    ) -> Result<()> {
        let mut failures = 0u32;
        loop {
            let first = failures == 0;
            match self.attempt(envelope, first, attempt_timeout).await {
                Ok(()) => return Ok(()),
                Err(TransportError::Io(e)) => {
                    failures += 1;
                    if failures > self.max_send_fails {
                        tracing::error!(
                            peer = %self.transport.peer(),
                            kind = %envelope.kind,
                            failures,
                            error = %e,
                            "Send to coordinator failed too many times, giving up"
                        );
                        self.transport.close().await;
                        return Err(AgentError::SendFailed {
                            attempts: failures,
                            source: e,
                        });
                    }
                    tracing::warn!(
                        peer = %self.transport.peer(),
                        kind = %envelope.kind,
                        failures,
                        pending = self.transport.has_pending_frame(),
                        error = %e,
                        "Send to coordinator failed, retrying"
                    );
                }
                Err(TransportError::Encode(e)) => return Err(AgentError::Encode(e.to_string())),
                Err(TransportError::Corrupt(e)) => {
                    return Err(AgentError::CorruptMessage(e.to_string()))
                }
                Err(TransportError::Closed) => return Err(AgentError::PeerClosed),
                Err(TransportError::NotConnected) => return Err(AgentError::NotConnected),
                Err(TransportError::Incomplete) => return Err(AgentError::Desynchronized),
            }
        }
    }

    async fn attempt(
        &mut self,
        envelope: &Envelope,
        first: bool,
        attempt_timeout: Option<Duration>,
    ) -> std::result::Result<(), TransportError> {
        let write = async {
            if first {
                self.transport.send(envelope).await
            } else {
                self.transport.resume_send().await
            }
        };
        match attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, write).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("send not accepted within {} ms", limit.as_millis()),
                ))),
            },
            None => write.await,
        }
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}
