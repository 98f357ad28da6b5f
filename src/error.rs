//! Error types for relaywire.

use thiserror::Error;

/// Main error type for all relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// I/O error on the transport or a collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A string does not fit the 2-byte wire length prefix. Never sent.
    #[error("Encoded string too large: {len} bytes (max 65535)")]
    EncodingTooLarge { len: usize },

    /// Unknown message kind or malformed frame.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The transport ended in the middle of a frame.
    #[error("Stream truncated: expected {expected} bytes, received {received}")]
    TruncatedStream { expected: usize, received: usize },

    /// The backend closed the transport on a frame boundary.
    #[error("Backend closed the connection")]
    PeerClosed,

    /// Send attempted after the channel terminated.
    #[error("Channel closed")]
    ChannelClosed,

    /// A channel is already attached to this relay.
    #[error("Relay already has a channel")]
    AlreadyAttached,

    /// Call attempted without a live channel.
    #[error("No channel to the backend")]
    NoChannel,

    /// The backend did not answer in time.
    #[error("Call {request_id} timed out")]
    CallTimeout { request_id: i32 },

    /// A gated startup step failed.
    #[error("Startup failed: {0}")]
    Startup(String),
}

impl RelayError {
    /// Whether this error ends the channel when raised by the receive side.
    pub fn is_fatal_to_channel(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_)
                | RelayError::ProtocolViolation(_)
                | RelayError::TruncatedStream { .. }
                | RelayError::PeerClosed
        )
    }
}

/// Result type alias using RelayError.
pub type Result<T> = std::result::Result<T, RelayError>;
