//! Wire framing for JSON-RPC messages.
//!
//! Every message on the wire is a 4-byte big-endian length `L`, then `L` bytes of UTF-8 JSON, then
//! a single terminator byte (`\n`).  The length prefix is what delimits frames; the terminator is
//! only there so that a raw capture of the stream is readable, and its value is not checked on
//! the way in.  Newlines inside the JSON payload are therefore harmless.
//!
//! The codec knows nothing about JSON-RPC semantics.  It only turns bytes into values of some
//! deserializable type and back.
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;
use crate::types::Request;

/// Largest payload either side will accept or produce.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Size of the big-endian length prefix
pub const HEADER_LEN: usize = 4;

/// Byte written after every payload
pub const TERMINATOR: u8 = b'\n';

/// [`Decoder`] and [`Encoder`] for length-prefixed JSON frames.
///
/// `T` is the type that decoded payloads are deserialized into.  Anything that implements
/// [`Serialize`] can be encoded regardless of `T`.
#[derive(Debug)]
pub struct FrameCodec<T = Request> {
    max_frame_size: usize,
    _item: PhantomData<fn() -> T>,
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Use a smaller frame limit than the protocol maximum.  Values above [`MAX_FRAME_SIZE`] are
    /// clamped to it.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
            _item: PhantomData,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FrameCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_frame_size(self.max_frame_size)
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let length = u32::from_be_bytes(header) as usize;

        if length > self.max_frame_size {
            // Only the header is consumed.  The peer controls `length` so nothing is read or
            // allocated on its behalf.
            src.advance(HEADER_LEN);
            return Err(FrameError::FrameTooLarge {
                length,
                max: self.max_frame_size,
            });
        }

        let frame_len = HEADER_LEN + length + 1;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(HEADER_LEN);
        frame.truncate(length);

        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|source| FrameError::MalformedPayload { source })
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<T>, FrameError> {
        if let Some(item) = self.decode(buf)? {
            return Ok(Some(item));
        }

        if buf.len() < HEADER_LEN {
            // Not even a complete header: the peer simply stopped talking
            buf.clear();
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&buf[..HEADER_LEN]);
        let expected = u32::from_be_bytes(header) as usize + 1;
        let available = buf.len() - HEADER_LEN;
        buf.clear();

        Err(FrameError::IncompleteFrame { expected, available })
    }
}

impl<T, M: Serialize> Encoder<M> for FrameCodec<T> {
    type Error = FrameError;

    fn encode(&mut self, item: M, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload = serde_json::to_vec(&item).map_err(|source| FrameError::Serialize {
            source,
            type_name: std::any::type_name::<M>(),
        })?;

        if payload.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                length: payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + payload.len() + 1);
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        dst.put_u8(TERMINATOR);

        Ok(())
    }
}
