//! In this crate, the transport is a pair of byte streams: something to read frames from and
//! something to write frames to.  For the child process that's stdin and stdout; for the host it's
//! the other ends of the same pipes; for tests it's an in-memory [`tokio::io::duplex`].
//!
//! The two halves are deliberately separate types.  Reading is only ever done by one task (the
//! connection's run loop, or the client's receive loop), so [`FrameReader`] is a plain owned
//! value.  Writing is done by whoever has something to say, which includes event emitters running
//! on unrelated background tasks, so [`FrameWriter`] is a cheaply clonable handle around a shared
//! sink with a lock around it.
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use futures::SinkExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, FramedWrite};

use crate::error::FrameError;
use crate::frame::{FrameCodec, HEADER_LEN};
use crate::types::{JsonValue, Request};

const INITIAL_READ_CAPACITY: usize = 8 * 1024;

/// Reads frames from a byte stream, one at a time.
///
/// This is used instead of [`tokio_util::codec::FramedRead`] because a framed reader considers
/// the stream finished as soon as the decoder reports an error, while here a bad frame is
/// something to report and then read past.
pub struct FrameReader<R, T = Request> {
    inner: R,
    codec: FrameCodec<T>,
    buffer: BytesMut,
    eof: bool,
}

impl<R, T> FrameReader<R, T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    pub fn new(inner: R) -> Self {
        Self::with_codec(inner, FrameCodec::new())
    }

    pub fn with_codec(inner: R, codec: FrameCodec<T>) -> Self {
        Self {
            inner,
            codec,
            buffer: BytesMut::with_capacity(INITIAL_READ_CAPACITY),
            eof: false,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` once the stream has ended cleanly.  A frame-level error (see
    /// [`FrameError::is_protocol`]) leaves the reader positioned after the bad frame, so it's fine
    /// to keep calling this after one.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe.  Bytes read from the stream before the future is dropped stay
    /// in the internal buffer and are picked up by the next call.
    pub async fn read_frame(&mut self) -> Result<Option<T>, FrameError> {
        loop {
            if self.eof {
                return self.codec.decode_eof(&mut self.buffer);
            }

            if let Some(item) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(item));
            }

            if self.buffer.capacity() - self.buffer.len() < HEADER_LEN {
                self.buffer.reserve(INITIAL_READ_CAPACITY);
            }

            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                self.eof = true;
            }
        }
    }

    /// Number of bytes read from the stream but not yet returned as part of a frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

impl<R, T> fmt::Debug for FrameReader<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader")
            .field("stream", &std::any::type_name::<R>())
            .field("buffered", &self.buffer.len())
            .field("eof", &self.eof)
            .finish()
    }
}

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Writes whole frames to a byte stream.
///
/// Clones share the same stream.  Each [`Self::write_frame`] holds the lock for the whole frame,
/// so frames from concurrent writers never interleave.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<FramedWrite<BoxedWriter, FrameCodec>>>,
}

impl FrameWriter {
    pub fn new(writer: impl AsyncWrite + Send + 'static) -> Self {
        Self::with_codec(writer, FrameCodec::new())
    }

    pub fn with_codec(writer: impl AsyncWrite + Send + 'static, codec: FrameCodec) -> Self {
        let writer: BoxedWriter = Box::pin(writer);
        Self {
            inner: Arc::new(Mutex::new(FramedWrite::new(writer, codec))),
        }
    }

    /// Serialize `message` and write it as a single frame, flushing the stream afterwards.
    ///
    /// If the message can't be serialized or is too large nothing is written.
    pub async fn write_frame<M: Serialize>(&self, message: M) -> Result<(), FrameError> {
        let mut framed = self.inner.lock().await;
        framed.send(message).await
    }

    /// Flush anything pending and shut down the write side of the stream.
    ///
    /// The remote peer sees this as end of stream.
    pub async fn close(&self) -> Result<(), FrameError> {
        let mut framed = self.inner.lock().await;
        // The codec can encode any serializable type, so the sink has to be told which one it is
        // closing
        SinkExt::<JsonValue>::close(&mut *framed).await
    }
}

impl fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameWriter").finish_non_exhaustive()
    }
}
