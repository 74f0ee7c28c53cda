use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{CodecError, Envelope, EnvelopeCodec};

/// Outcome of a single receive or send attempt.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt frame: {0}")]
    Corrupt(CodecError),

    #[error("cannot encode frame: {0}")]
    Encode(CodecError),

    #[error("transport is closed")]
    NotConnected,

    #[error("previous frame was only partly written")]
    Incomplete,
}

/// A single framed stream to the coordinator.
///
/// Bytes read from the socket accumulate in an internal buffer until a full
/// frame is available, so a receive that times out part-way through a frame
/// loses nothing. On the write side, a frame stays buffered until every byte
/// of it has been handed to the socket; a failed send leaves the unsent tail
/// for [`Transport::resume_send`].
pub struct Transport<S = TcpStream> {
    stream: Option<S>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Set from encode until the frame has been fully written and flushed
    in_flight: bool,
    codec: EnvelopeCodec,
    peer: String,
}

impl Transport<TcpStream> {
    /// Connect to the coordinator, retrying every `poll_interval` until a
    /// connection succeeds. Never returns an error.
    pub async fn connect(host: &str, port: u16, poll_interval: Duration) -> Self {
        tracing::info!(
            host,
            port,
            poll_interval_secs = poll_interval.as_secs_f64(),
            "Polling for coordinator connection"
        );

        loop {
            match Self::try_connect(host, port).await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    tracing::info!(peer = %addr, "Connected to coordinator");
                    return Self::from_stream(stream, addr.to_string());
                }
                Err(e) => {
                    tracing::warn!(host, port, error = %e, "Failed to connect to coordinator");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    async fn try_connect(host: &str, port: u16) -> std::io::Result<(TcpStream, SocketAddr)> {
        let mut last_err = None;
        for addr in lookup_host((host, port)).await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok((stream, addr)),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}:{} resolved to no addresses", host, port),
            )
        }))
    }
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn from_stream(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: BytesMut::new(),
            in_flight: false,
            codec: EnvelopeCodec,
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Wait up to `timeout` (forever when `None`) for one envelope.
    ///
    /// Returns `Ok(None)` when nothing complete arrived in time.
    pub async fn receive(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, TransportError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(envelope)) => return Ok(Some(envelope)),
                Ok(None) => {}
                Err(CodecError::Io(e)) => return Err(TransportError::Io(e)),
                Err(e) => return Err(TransportError::Corrupt(e)),
            }

            let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
            let read = stream.read_buf(&mut self.read_buf);
            let n = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, read).await {
                    Ok(result) => result?,
                    Err(_) => return Ok(None),
                },
                None => read.await?,
            };

            if n == 0 {
                return Err(TransportError::Closed);
            }
        }
    }

    /// Write one envelope. A single attempt; retries belong to the caller
    /// and must go through [`Transport::resume_send`], which continues from
    /// the first byte the socket did not accept.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.stream.is_none() {
            return Err(TransportError::NotConnected);
        }
        if self.in_flight {
            return Err(TransportError::Incomplete);
        }

        self.write_buf.clear();
        self.codec
            .encode(envelope, &mut self.write_buf)
            .map_err(TransportError::Encode)?;
        self.in_flight = true;
        self.write_pending().await
    }

    /// Continue the frame a failed [`Transport::send`] left behind. A no-op
    /// when nothing is in flight.
    pub async fn resume_send(&mut self) -> Result<(), TransportError> {
        if !self.in_flight {
            return Ok(());
        }
        self.write_pending().await
    }

    /// Whether part of a frame is still waiting to be written.
    pub fn has_pending_frame(&self) -> bool {
        self.in_flight
    }

    async fn write_pending(&mut self) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        // write_all_buf advances the buffer, so an error or a cancelled
        // attempt keeps exactly the bytes still owed to the peer
        stream.write_all_buf(&mut self.write_buf).await?;
        stream.flush().await?;
        self.in_flight = false;
        Ok(())
    }

    /// Release the socket. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(peer = %self.peer, error = %e, "Error shutting down connection");
            }
            tracing::info!(peer = %self.peer, "Connection to coordinator closed");
        }
        self.read_buf.clear();
        self.write_buf.clear();
        self.in_flight = false;
    }
}
