//! Loopback TCP connection to the backend.
//!
//! # Example
//!
//! ```ignore
//! use relaywire::transport::connect_backend;
//!
//! let stream = connect_backend(12345).await?;
//! relay.attach(stream).await?;
//! ```

use tokio::net::TcpStream;

use crate::error::Result;

/// The backend always listens on loopback.
pub const BACKEND_HOST: &str = "127.0.0.1";

/// Connect to the backend on `port` with Nagle's algorithm disabled.
pub async fn connect_backend(port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((BACKEND_HOST, port)).await?;
    stream.set_nodelay(true)?;
    tracing::info!("Connected to backend on {}:{}", BACKEND_HOST, port);
    Ok(stream)
}
