//! Protocol module - wire format, records, framing.
//!
//! This module implements the binary protocol spoken with the backend:
//! - primitive encoding (int32, 2-byte prefixed strings, sequences)
//! - request/response records and control payloads
//! - frame building and the frame buffer for partial reads

mod frame;
mod frame_buffer;
mod records;
mod wire_format;

pub use frame::{build_frame, Frame, Message};
pub use frame_buffer::{FrameBuffer, DEFAULT_BUFFER_CAPACITY};
pub use records::{
    Envelope, ErrorAnnouncement, HeaderField, HttpPayload, Readiness, RequestRecord,
    ResponseRecord, WireRecord,
};
pub use wire_format::{
    get_blob, get_bool, get_i32, get_list, get_string, get_u8, put_blob, put_bool, put_i32,
    put_list, put_string, MessageKind, DEFAULT_MAX_BODY_SIZE, KIND_SIZE, LENGTH_SIZE,
    MAX_STRING_LEN,
};
