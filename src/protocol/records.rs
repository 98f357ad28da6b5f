//! Request/response records and their body encoding.
//!
//! Layout (all inside a frame body):
//! ```text
//! HeaderField    = string name, sequence<string> values
//! HttpPayload    = sequence<HeaderField> headers, int32 contentLength, bytes
//! RequestRecord  = string uri, string method, HttpPayload
//! ResponseRecord = int32 statusCode, HttpPayload
//! Envelope       = int32 requestId, RequestRecord | ResponseRecord
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{
    get_blob, get_bool, get_i32, get_list, get_string, get_u8, put_blob, put_bool, put_i32,
    put_list, put_string,
};
use crate::error::{RelayError, Result};

/// A type with a fixed body encoding.
pub trait WireRecord: Sized {
    /// Append the encoding of `self` to `buf`.
    fn encode(&self, buf: &mut BytesMut) -> Result<()>;

    /// Decode one value from the front of `buf`.
    fn decode(buf: &mut Bytes) -> Result<Self>;

    /// Encode into a fresh buffer.
    fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// One HTTP header with all its values, in order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderField {
    pub name: String,
    pub values: Vec<String>,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// A header with a single value.
    pub fn single(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, vec![value.into()])
    }
}

impl WireRecord for HeaderField {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_string(buf, &self.name)?;
        put_list(buf, &self.values, |b, v| put_string(b, v))
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let name = get_string(buf)?;
        let values = get_list(buf, get_string)?;
        Ok(Self { name, values })
    }
}

/// Headers and body shared by requests and responses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpPayload {
    pub headers: Vec<HeaderField>,
    pub body: Bytes,
}

impl HttpPayload {
    pub fn new(headers: Vec<HeaderField>, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Values of the first header matching `name` (ASCII case-insensitive).
    pub fn header(&self, name: &str) -> Option<&[String]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.values.as_slice())
    }
}

impl WireRecord for HttpPayload {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_list(buf, &self.headers, |b, h| h.encode(b))?;
        put_blob(buf, &self.body)
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let headers = get_list(buf, HeaderField::decode)?;
        let body = get_blob(buf)?;
        Ok(Self { headers, body })
    }
}

/// A decoded intercepted request, as sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestRecord {
    pub uri: String,
    pub method: String,
    pub payload: HttpPayload,
}

impl RequestRecord {
    pub fn new(method: impl Into<String>, uri: impl Into<String>, payload: HttpPayload) -> Self {
        Self {
            uri: uri.into(),
            method: method.into(),
            payload,
        }
    }
}

impl WireRecord for RequestRecord {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_string(buf, &self.uri)?;
        put_string(buf, &self.method)?;
        self.payload.encode(buf)
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let uri = get_string(buf)?;
        let method = get_string(buf)?;
        let payload = HttpPayload::decode(buf)?;
        Ok(Self {
            uri,
            method,
            payload,
        })
    }
}

/// The backend's answer to a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseRecord {
    pub status_code: i32,
    pub payload: HttpPayload,
}

impl ResponseRecord {
    pub fn new(status_code: i32, payload: HttpPayload) -> Self {
        Self {
            status_code,
            payload,
        }
    }

    /// The response handed back when the backend never answered.
    pub fn internal_error() -> Self {
        Self::new(500, HttpPayload::default())
    }
}

impl WireRecord for ResponseRecord {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_i32(buf, self.status_code);
        self.payload.encode(buf)
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let status_code = get_i32(buf)?;
        let payload = HttpPayload::decode(buf)?;
        Ok(Self {
            status_code,
            payload,
        })
    }
}

/// A record tagged with the id of the call it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<T> {
    pub request_id: i32,
    pub record: T,
}

impl<T> Envelope<T> {
    pub fn new(request_id: i32, record: T) -> Self {
        Self { request_id, record }
    }
}

impl<T: WireRecord> WireRecord for Envelope<T> {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_i32(buf, self.request_id);
        self.record.encode(buf)
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let request_id = get_i32(buf)?;
        let record = T::decode(buf)?;
        Ok(Self { request_id, record })
    }
}

/// Startup phase announced to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Readiness {
    /// Redirection removed; waiting for the backend's liveness signal.
    Hosts = 0,
    /// Redirection and certificate in place; terminator starting.
    Starting = 1,
    /// Fully running.
    Running = 2,
}

impl WireRecord for Readiness {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(*self as u8);
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        match get_u8(buf)? {
            0 => Ok(Readiness::Hosts),
            1 => Ok(Readiness::Starting),
            2 => Ok(Readiness::Running),
            other => Err(RelayError::ProtocolViolation(format!(
                "Unknown readiness value {}",
                other
            ))),
        }
    }
}

/// An error reported to the backend. Fatal errors mean the relay is going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorAnnouncement {
    pub fatal: bool,
    pub text: String,
}

impl ErrorAnnouncement {
    pub fn fatal(text: impl Into<String>) -> Self {
        Self {
            fatal: true,
            text: text.into(),
        }
    }

    pub fn non_fatal(text: impl Into<String>) -> Self {
        Self {
            fatal: false,
            text: text.into(),
        }
    }
}

impl WireRecord for ErrorAnnouncement {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_bool(buf, self.fatal);
        put_string(buf, &self.text)
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let fatal = get_bool(buf)?;
        let text = get_string(buf)?;
        Ok(Self { fatal, text })
    }
}
