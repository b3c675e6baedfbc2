//! Length-prefixed framing.
//!
//! Every request and response on the wire is a 2-byte big-endian payload
//! length followed by the payload. A zero-length frame is a valid (empty)
//! request.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest payload a frame can carry.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Prefixes a payload with its length.
///
/// # Errors
///
/// Returns [`Error::FrameTooLarge`] if the payload exceeds [`MAX_FRAME_LEN`].
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(payload.len()));
    }
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Accumulates raw reads and yields complete payloads in arrival order.
///
/// Input may be split at any byte boundary; the decoder only hands out a
/// payload once all of it has arrived.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Creates a decoder rejecting frames longer than `max_frame_len`
    /// (capped at [`MAX_FRAME_LEN`]).
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_len: max_frame_len.min(MAX_FRAME_LEN),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete payload, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`] once a length prefix above the
    /// configured limit has been read. The decoder should be discarded.
    pub fn decode(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if len > self.max_frame_len {
            return Err(Error::FrameTooLarge(len));
        }

        if self.buffer.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_LEN);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    /// Bytes received but not yet returned as part of a payload.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}
