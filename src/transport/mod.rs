//! Transport module - the byte stream under a channel.
//!
//! Any `AsyncRead + AsyncWrite` stream can carry a channel. In production
//! that is a loopback TCP connection to the backend; tests use
//! `tokio::io::duplex`.

mod tcp;

use tokio::io::{AsyncRead, AsyncWrite};

pub use tcp::{connect_backend, BACKEND_HOST};

/// A stream a channel can be opened over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport, as handed to the relay actor.
pub type BoxedTransport = Box<dyn Transport>;
