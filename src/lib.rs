//! # relaywire
//!
//! The private binary channel between an intercepting TLS proxy and the
//! backend process that actually performs its requests.
//!
//! The proxy terminates TLS for an intercepted host, turns each request
//! into a [`RequestRecord`], and forwards it to the backend over a local
//! stream. The backend answers with a [`ResponseRecord`] carrying the same
//! request id.
//!
//! ## Architecture
//!
//! - **Codec** ([`protocol`]): big-endian framing, `kind` then
//!   `length`/`body`, with 2-byte prefixed strings
//! - **Send Pump**: one writer task draining a queue in coalesced writes
//! - **Channel**: owns the transport, runs the receive loop, closes once
//! - **Relay**: single owner of the channel and the table of pending calls
//! - **Startup**: hosts redirect, root certificate, terminator, gated on
//!   the backend's liveness signal
//!
//! ## Example
//!
//! ```ignore
//! use relaywire::{connect_backend, Relay, RequestRecord};
//!
//! #[tokio::main]
//! async fn main() -> relaywire::Result<()> {
//!     let relay = Relay::builder().spawn();
//!     relay.attach(connect_backend(51234).await?).await?;
//!
//!     let request = RequestRecord::from_intercepted("GET", "x", "/y", [], "");
//!     let response = relay.call(request).await?;
//!     println!("{}", response.status_code);
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod correlator;
pub mod error;
pub mod hosts;
pub mod protocol;
pub mod pulse;
pub mod pump;
pub mod relay;
pub mod startup;
pub mod transport;

mod forward;

pub use channel::{Channel, ChannelEvent};
pub use config::RelayConfig;
pub use correlator::{CallOutcome, Correlator};
pub use error::{RelayError, Result};
pub use hosts::HostsFile;
pub use protocol::{
    Envelope, ErrorAnnouncement, HeaderField, HttpPayload, Readiness, RequestRecord,
    ResponseRecord,
};
pub use relay::{Relay, RelayBuilder, RelayHandle, ShutdownCause};
pub use startup::{HostsRedirect, Startup, Terminator, TrustStore};
pub use transport::connect_backend;
