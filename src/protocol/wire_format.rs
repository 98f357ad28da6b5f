//! Wire format primitives and message kinds.
//!
//! Every frame starts with a one-byte message kind. All kinds except
//! `LivenessReady` carry a length-prefixed body:
//! ```text
//! ┌────────┬─────────────┬──────────────────┐
//! │ Kind   │ Body length │ Body             │
//! │ 1 byte │ 4 bytes BE  │ <length> bytes   │
//! └────────┴─────────────┴──────────────────┘
//! ```
//!
//! Inside bodies:
//! - `int32`: 4 bytes, big endian
//! - `string`: 2-byte unsigned length + UTF-8 bytes
//! - `sequence of T`: 4-byte count + `count` encoded items

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RelayError, Result};

/// Size of the kind byte.
pub const KIND_SIZE: usize = 1;

/// Size of the body length prefix.
pub const LENGTH_SIZE: usize = 4;

/// Maximum encoded string length (2-byte prefix).
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Default maximum inbound body size (1 GiB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 1_073_741_824;

/// Message kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Backend → proxy: response envelope.
    Response = 1,
    /// Backend → proxy: liveness signal, no body.
    LivenessReady = 2,
    /// Proxy → backend: request envelope.
    Request = 10,
    /// Proxy → backend: startup phase announcement.
    Readiness = 11,
    /// Proxy → backend: error announcement.
    Error = 12,
}

impl MessageKind {
    /// Whether frames of this kind carry a length-prefixed body.
    #[inline]
    pub fn has_body(self) -> bool {
        self != MessageKind::LivenessReady
    }

    /// The wire identifier.
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageKind::Response),
            2 => Ok(MessageKind::LivenessReady),
            10 => Ok(MessageKind::Request),
            11 => Ok(MessageKind::Readiness),
            12 => Ok(MessageKind::Error),
            other => Err(RelayError::ProtocolViolation(format!(
                "Unknown message kind {}",
                other
            ))),
        }
    }
}

#[inline]
pub fn put_i32(buf: &mut BytesMut, value: i32) {
    buf.put_i32(value);
}

#[inline]
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Write a 2-byte length prefixed UTF-8 string.
///
/// The length is checked before anything is written, so a failed call
/// leaves `buf` untouched.
pub fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_STRING_LEN {
        return Err(RelayError::EncodingTooLarge { len: bytes.len() });
    }
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
    Ok(())
}

/// Write a 4-byte count followed by each item.
pub fn put_list<T, F>(buf: &mut BytesMut, items: &[T], mut put_item: F) -> Result<()>
where
    F: FnMut(&mut BytesMut, &T) -> Result<()>,
{
    let count = i32::try_from(items.len()).map_err(|_| {
        RelayError::ProtocolViolation(format!("Sequence of {} items is too long", items.len()))
    })?;
    buf.put_i32(count);
    for item in items {
        put_item(buf, item)?;
    }
    Ok(())
}

/// Write a 4-byte length followed by the raw bytes.
pub fn put_blob(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = i32::try_from(data.len()).map_err(|_| {
        RelayError::ProtocolViolation(format!("Blob of {} bytes is too long", data.len()))
    })?;
    buf.put_i32(len);
    buf.put_slice(data);
    Ok(())
}

fn ensure(buf: &Bytes, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(RelayError::ProtocolViolation(format!(
            "Body too short for {}: need {} bytes, {} left",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1, "byte")?;
    Ok(buf.get_u8())
}

pub fn get_bool(buf: &mut Bytes) -> Result<bool> {
    Ok(get_u8(buf)? == 1)
}

pub fn get_i32(buf: &mut Bytes) -> Result<i32> {
    ensure(buf, 4, "int32")?;
    Ok(buf.get_i32())
}

/// Read a non-negative int32 used as a length or count.
fn get_len(buf: &mut Bytes, what: &str) -> Result<usize> {
    let value = get_i32(buf)?;
    usize::try_from(value)
        .map_err(|_| RelayError::ProtocolViolation(format!("Negative {}: {}", what, value)))
}

pub fn get_string(buf: &mut Bytes) -> Result<String> {
    ensure(buf, 2, "string length")?;
    let len = buf.get_u16() as usize;
    ensure(buf, len, "string")?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| RelayError::ProtocolViolation(format!("Invalid UTF-8 string: {}", e)))
}

pub fn get_list<T, F>(buf: &mut Bytes, mut get_item: F) -> Result<Vec<T>>
where
    F: FnMut(&mut Bytes) -> Result<T>,
{
    let count = get_len(buf, "sequence count")?;
    // Every item takes at least one byte; cap the preallocation by what is left.
    let mut items = Vec::with_capacity(count.min(buf.remaining()));
    for _ in 0..count {
        items.push(get_item(buf)?);
    }
    Ok(items)
}

/// Read a 4-byte length and that many raw bytes (zero-copy).
pub fn get_blob(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_len(buf, "content length")?;
    ensure(buf, len, "content")?;
    Ok(buf.split_to(len))
}
