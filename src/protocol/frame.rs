//! Frames and the typed messages they carry.
//!
//! A [`Frame`] is the raw unit produced by the [`FrameBuffer`](super::FrameBuffer):
//! a kind plus the undecoded body. A [`Message`] is its typed form.
//!
//! # Example
//!
//! ```
//! use relaywire::protocol::{Message, Readiness};
//!
//! let bytes = Message::Readiness(Readiness::Running).encode_frame().unwrap();
//! assert_eq!(&bytes[..], &[11, 0, 0, 0, 1, 2]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::records::{
    Envelope, ErrorAnnouncement, Readiness, RequestRecord, ResponseRecord, WireRecord,
};
use super::wire_format::{MessageKind, KIND_SIZE, LENGTH_SIZE};
use crate::error::Result;

/// A complete inbound frame with its body still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    /// Body bytes (empty for `LivenessReady`).
    pub body: Bytes,
}

impl Frame {
    pub fn new(kind: MessageKind, body: Bytes) -> Self {
        Self { kind, body }
    }

    /// Decode the body into a typed message.
    pub fn into_message(self) -> Result<Message> {
        Message::decode(self.kind, self.body)
    }
}

/// Every message that can cross the channel, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Response(Envelope<ResponseRecord>),
    LivenessReady,
    Request(Envelope<RequestRecord>),
    Readiness(Readiness),
    Error(ErrorAnnouncement),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Response(_) => MessageKind::Response,
            Message::LivenessReady => MessageKind::LivenessReady,
            Message::Request(_) => MessageKind::Request,
            Message::Readiness(_) => MessageKind::Readiness,
            Message::Error(_) => MessageKind::Error,
        }
    }

    /// Encode as a complete wire frame: kind byte, then length and body
    /// for every kind that has one.
    pub fn encode_frame(&self) -> Result<Bytes> {
        let body = match self {
            Message::Response(envelope) => envelope.to_bytes()?,
            Message::LivenessReady => return Ok(build_frame(MessageKind::LivenessReady, &[])),
            Message::Request(envelope) => envelope.to_bytes()?,
            Message::Readiness(readiness) => readiness.to_bytes()?,
            Message::Error(error) => error.to_bytes()?,
        };
        Ok(build_frame(self.kind(), &body))
    }

    /// Decode a body of the given kind.
    ///
    /// Trailing bytes after a well-formed body are ignored.
    pub fn decode(kind: MessageKind, mut body: Bytes) -> Result<Message> {
        let message = match kind {
            MessageKind::Response => Message::Response(Envelope::decode(&mut body)?),
            MessageKind::LivenessReady => Message::LivenessReady,
            MessageKind::Request => Message::Request(Envelope::decode(&mut body)?),
            MessageKind::Readiness => Message::Readiness(Readiness::decode(&mut body)?),
            MessageKind::Error => Message::Error(ErrorAnnouncement::decode(&mut body)?),
        };
        if !body.is_empty() {
            tracing::debug!(
                "Ignoring {} trailing bytes in {:?} frame",
                body.len(),
                kind
            );
        }
        Ok(message)
    }
}

/// Build a frame from a kind and an already encoded body.
///
/// The body is dropped for kinds without one.
pub fn build_frame(kind: MessageKind, body: &[u8]) -> Bytes {
    if !kind.has_body() {
        return Bytes::copy_from_slice(&[kind.id()]);
    }
    let mut buf = BytesMut::with_capacity(KIND_SIZE + LENGTH_SIZE + body.len());
    buf.put_u8(kind.id());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HeaderField, HttpPayload};

    #[test]
    fn test_liveness_frame_is_single_byte() {
        let bytes = Message::LivenessReady.encode_frame().unwrap();
        assert_eq!(&bytes[..], &[2]);
    }

    #[test]
    fn test_readiness_frame_layout() {
        let bytes = Message::Readiness(Readiness::Hosts).encode_frame().unwrap();
        assert_eq!(&bytes[..], &[11, 0, 0, 0, 1, 0]);
    }

    #[test]
    fn test_error_frame_layout() {
        let bytes = Message::Error(ErrorAnnouncement::non_fatal("x"))
            .encode_frame()
            .unwrap();
        assert_eq!(&bytes[..], &[12, 0, 0, 0, 4, 0, 0, 1, b'x']);
    }

    #[test]
    fn test_request_frame_length_covers_envelope_only() {
        let envelope = Envelope::new(
            5,
            RequestRecord::new("GET", "https://a/", HttpPayload::default()),
        );
        let body = envelope.to_bytes().unwrap();
        let frame = Message::Request(envelope).encode_frame().unwrap();

        assert_eq!(frame[0], 10);
        assert_eq!(&frame[1..5], &(body.len() as u32).to_be_bytes());
        assert_eq!(&frame[5..], &body[..]);
    }

    #[test]
    fn test_decode_response() {
        let envelope = Envelope::new(
            3,
            ResponseRecord::new(
                404,
                HttpPayload::new(vec![HeaderField::single("A", "b")], "missing"),
            ),
        );
        let body = envelope.to_bytes().unwrap();
        let message = Frame::new(MessageKind::Response, body).into_message().unwrap();
        assert_eq!(message, Message::Response(envelope));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let message = Message::decode(MessageKind::Readiness, Bytes::from_static(&[2, 9, 9]))
            .unwrap();
        assert_eq!(message, Message::Readiness(Readiness::Running));
    }

    #[test]
    fn test_build_frame_drops_body_for_liveness() {
        assert_eq!(&build_frame(MessageKind::LivenessReady, b"junk")[..], &[2]);
    }
}
