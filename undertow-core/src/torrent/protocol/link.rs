//! Framed message transport over one peer byte stream

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use super::handshake::{HANDSHAKE_LENGTH, HandshakeCodec};
use super::messages::{LENGTH_PREFIX_SIZE, MessageCodec};
use super::types::{PeerError, PeerHandshake, PeerMessage};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LENGTH: usize = 2 * 1024 * 1024;

/// Bytes reserved in the receive buffer before each socket read.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Receiving half of a peer link.
///
/// Buffers raw stream input and cuts it into handshake and framed messages.
/// Every wait for more bytes is bounded by the inactivity timeout.
pub struct LinkReader<R> {
    inner: R,
    buffer: BytesMut,
    codec: MessageCodec,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> LinkReader<R> {
    /// Creates reader over `inner` with empty receive buffer.
    pub fn new(inner: R, codec: MessageCodec, read_timeout: Duration) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            codec,
            read_timeout,
        }
    }

    /// Reads the peer's fixed-size handshake.
    ///
    /// # Errors
    ///
    /// - `PeerError::Timeout` - If the peer went quiet before 68 bytes arrived
    /// - `PeerError::ConnectionClosed` - If the stream ended
    /// - `PeerError::InvalidHandshake` - If the bytes are not a handshake
    pub async fn read_handshake(&mut self) -> Result<PeerHandshake, PeerError> {
        self.fill_to(HANDSHAKE_LENGTH).await?;
        let handshake = HandshakeCodec::deserialize_handshake(&self.buffer[..HANDSHAKE_LENGTH])?;
        self.buffer.advance(HANDSHAKE_LENGTH);
        Ok(handshake)
    }

    /// Reads the next message, skipping keep-alives.
    ///
    /// # Errors
    ///
    /// - `PeerError::Timeout` - If the peer went quiet mid-message
    /// - `PeerError::ConnectionClosed` - If the stream ended
    /// - `PeerError::ProtocolViolation` - If the frame is oversized or malformed
    pub async fn read(&mut self) -> Result<PeerMessage, PeerError> {
        loop {
            self.fill_to(LENGTH_PREFIX_SIZE).await?;
            let mut prefix = &self.buffer[..LENGTH_PREFIX_SIZE];
            let length = prefix.get_u32() as usize;

            if length == 0 {
                self.buffer.advance(LENGTH_PREFIX_SIZE);
                tracing::trace!("LinkReader: keep-alive");
                continue;
            }

            if length > MAX_FRAME_LENGTH {
                return Err(PeerError::violation(format!(
                    "Frame of {length} bytes exceeds limit of {MAX_FRAME_LENGTH}"
                )));
            }

            let frame_len = LENGTH_PREFIX_SIZE + length;
            self.fill_to(frame_len).await?;
            let frame = self.buffer.split_to(frame_len);
            return self.codec.deserialize_message(&frame);
        }
    }

    /// Number of received bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    async fn fill_to(&mut self, wanted: usize) -> Result<(), PeerError> {
        let read_timeout = self.read_timeout;
        while self.buffer.len() < wanted {
            self.buffer
                .reserve((wanted - self.buffer.len()).max(READ_CHUNK_SIZE));
            let read = tokio::time::timeout(read_timeout, self.inner.read_buf(&mut self.buffer))
                .await
                .map_err(|_| PeerError::Timeout {
                    after: read_timeout,
                })??;
            if read == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }
}

/// Sending half of a peer link.
pub struct LinkWriter<W> {
    inner: W,
    codec: MessageCodec,
}

impl<W: AsyncWrite + Unpin> LinkWriter<W> {
    /// Creates writer over `inner`.
    pub fn new(inner: W, codec: MessageCodec) -> Self {
        Self { inner, codec }
    }

    /// Writes our handshake and flushes it.
    ///
    /// # Errors
    ///
    /// - `PeerError::Io` - If the stream rejected the write
    pub async fn send_handshake(&mut self, handshake: &PeerHandshake) -> Result<(), PeerError> {
        let bytes = HandshakeCodec::serialize_handshake(handshake);
        self.write_all(&bytes).await
    }

    /// Encodes and writes one message; returns once it is flushed.
    ///
    /// # Errors
    ///
    /// - `PeerError::Io` - If the stream rejected the write
    pub async fn send(&mut self, message: &PeerMessage) -> Result<(), PeerError> {
        let bytes = self.codec.serialize_message(message);
        self.write_all(&bytes).await
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// One peer connection split into independently usable halves.
///
/// The halves let a request sender and a block receiver run concurrently
/// on the same connection.
pub struct PeerLink<S> {
    reader: LinkReader<ReadHalf<S>>,
    writer: LinkWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> PeerLink<S> {
    /// Wraps `stream`, bounding reads by `read_timeout`.
    pub fn new(stream: S, codec: MessageCodec, read_timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: LinkReader::new(read_half, codec, read_timeout),
            writer: LinkWriter::new(write_half, codec),
        }
    }

    pub fn reader(&mut self) -> &mut LinkReader<ReadHalf<S>> {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut LinkWriter<WriteHalf<S>> {
        &mut self.writer
    }

    /// Borrows both halves at once.
    pub fn halves(&mut self) -> (&mut LinkReader<ReadHalf<S>>, &mut LinkWriter<WriteHalf<S>>) {
        (&mut self.reader, &mut self.writer)
    }
}
