//! Length-prefixed framing.
//!
//! One frame on the wire is a `u16` big-endian length followed by exactly
//! that many payload bytes. [`FrameDecoder`] is the receive-side state
//! machine: it alternates between waiting for the 2-byte length and waiting
//! for the payload, and accepts input in arbitrarily sized chunks.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 2;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD} byte frame limit")]
    PayloadTooLarge(usize),
}

/// Prepends the length prefix to `payload`.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    buf.put_u16(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Which part of a frame the decoder is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    AwaitingLength,
    AwaitingPayload,
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    expected: usize,
    buf: BytesMut,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingLength,
            expected: LENGTH_PREFIX,
            buf: BytesMut::with_capacity(LENGTH_PREFIX),
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Bytes still missing before the current phase completes.
    pub fn remaining(&self) -> usize {
        self.expected - self.buf.len()
    }

    /// Drops any partial frame and returns to the length phase.
    pub fn reset(&mut self) {
        self.state = DecodeState::AwaitingLength;
        self.expected = LENGTH_PREFIX;
        self.buf.clear();
    }

    /// Consumes `src`, pushing every completed payload onto `out`.
    pub fn feed(&mut self, mut src: &[u8], out: &mut Vec<Bytes>) {
        loop {
            if self.buf.len() < self.expected {
                if src.is_empty() {
                    return;
                }
                let take = (self.expected - self.buf.len()).min(src.len());
                self.buf.extend_from_slice(&src[..take]);
                src = &src[take..];
                if self.buf.len() < self.expected {
                    return;
                }
            }

            match self.state {
                DecodeState::AwaitingLength => {
                    let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
                    self.buf.clear();
                    self.buf.reserve(len);
                    self.state = DecodeState::AwaitingPayload;
                    self.expected = len;
                }
                DecodeState::AwaitingPayload => {
                    out.push(self.buf.split().freeze());
                    self.state = DecodeState::AwaitingLength;
                    self.expected = LENGTH_PREFIX;
                }
            }
        }
    }
}
