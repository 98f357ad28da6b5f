//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForKind`: need the 1-byte message kind
//! - `WaitingForLength`: kind known, need the 4-byte body length
//! - `WaitingForBody`: length known, need N more body bytes
//!
//! Unknown kinds are rejected as soon as the kind byte arrives, before
//! any length is read.
//!
//! # Example
//!
//! ```
//! use relaywire::protocol::{FrameBuffer, MessageKind};
//!
//! let mut buffer = FrameBuffer::new();
//! buffer.extend(&[2, 11, 0, 0]);
//! let frame = buffer.next_frame().unwrap().unwrap();
//! assert_eq!(frame.kind, MessageKind::LivenessReady);
//! // Kind 11 arrived, its length is still incomplete.
//! assert!(buffer.next_frame().unwrap().is_none());
//! assert!(buffer.is_mid_frame());
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::frame::Frame;
use super::wire_format::{MessageKind, DEFAULT_MAX_BODY_SIZE, KIND_SIZE, LENGTH_SIZE};
use crate::error::{RelayError, Result};

/// Default initial buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForKind,
    WaitingForLength { kind: MessageKind },
    WaitingForBody { kind: MessageKind, length: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_body_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max body: 1GB.
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a new frame buffer with a custom max body size.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY),
            state: State::WaitingForKind,
            max_body_size,
        }
    }

    /// Append data and extract every complete frame.
    ///
    /// Stops at the first protocol violation; frames before it are lost.
    /// The receive loop uses [`extend`](Self::extend) plus
    /// [`next_frame`](Self::next_frame) instead, so frames ahead of a bad
    /// one are still dispatched.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Append data without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract a single frame.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(ProtocolViolation)` for an unknown kind or an oversized body
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForKind => {
                    if self.buffer.len() < KIND_SIZE {
                        return Ok(None);
                    }
                    let kind = MessageKind::try_from(self.buffer[0])?;
                    self.buffer.advance(KIND_SIZE);

                    if !kind.has_body() {
                        return Ok(Some(Frame::new(kind, Bytes::new())));
                    }
                    self.state = State::WaitingForLength { kind };
                }

                State::WaitingForLength { kind } => {
                    if self.buffer.len() < LENGTH_SIZE {
                        return Ok(None);
                    }
                    let length = self.buffer.get_u32();
                    if length > self.max_body_size {
                        return Err(RelayError::ProtocolViolation(format!(
                            "Body size {} exceeds maximum {}",
                            length, self.max_body_size
                        )));
                    }
                    self.state = State::WaitingForBody {
                        kind,
                        length: length as usize,
                    };
                }

                State::WaitingForBody { kind, length } => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(length).freeze();
                    self.state = State::WaitingForKind;
                    return Ok(Some(Frame::new(kind, body)));
                }
            }
        }
    }

    /// Whether a frame has been started but not completed.
    pub fn is_mid_frame(&self) -> bool {
        !matches!(self.state, State::WaitingForKind) || !self.buffer.is_empty()
    }

    /// Classify an end-of-stream seen by the reader.
    ///
    /// On a frame boundary this is [`RelayError::PeerClosed`]; otherwise the
    /// stream was cut short and this is [`RelayError::TruncatedStream`].
    pub fn end_of_stream(&self) -> RelayError {
        let received = self.buffer.len();
        match self.state {
            State::WaitingForKind if received == 0 => RelayError::PeerClosed,
            State::WaitingForKind => RelayError::TruncatedStream {
                expected: KIND_SIZE,
                received,
            },
            State::WaitingForLength { .. } => RelayError::TruncatedStream {
                expected: LENGTH_SIZE,
                received,
            },
            State::WaitingForBody { length, .. } => RelayError::TruncatedStream {
                expected: length,
                received,
            },
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForKind;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForKind => "WaitingForKind",
            State::WaitingForLength { .. } => "WaitingForLength",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
