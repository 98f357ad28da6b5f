//! Backend stub - the far end of the channel.
//!
//! Listens on loopback, accepts one relay, answers the `Hosts` readiness
//! announcement with the liveness signal and every request with
//! `200 text/plain "ok"`.
//!
//! ```text
//! cargo run --example backend_stub -- 51234
//! cargo run --example relay -- 51234 /tmp/hosts
//! ```

use relaywire::protocol::{FrameBuffer, Message};
use relaywire::{Envelope, HeaderField, HttpPayload, Readiness, ResponseRecord};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(51234);

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!("Backend stub listening on 127.0.0.1:{}", port);

    let (mut socket, peer) = listener.accept().await?;
    socket.set_nodelay(true)?;
    tracing::info!("Relay connected from {}", peer);

    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            tracing::info!("Relay disconnected");
            return Ok(());
        }

        for frame in frames.push(&buf[..n])? {
            let reply = match frame.into_message()? {
                Message::Readiness(Readiness::Hosts) => {
                    tracing::info!("Relay waiting for us, signalling liveness");
                    Some(Message::LivenessReady)
                }
                Message::Readiness(readiness) => {
                    tracing::info!("Relay is {:?}", readiness);
                    None
                }
                Message::Request(Envelope { request_id, record }) => {
                    tracing::info!("#{} {} {}", request_id, record.method, record.uri);
                    let payload = HttpPayload::new(
                        vec![HeaderField::single("Content-Type", "text/plain")],
                        "ok",
                    );
                    Some(Message::Response(Envelope::new(
                        request_id,
                        ResponseRecord::new(200, payload),
                    )))
                }
                Message::Error(error) if error.fatal => {
                    tracing::error!("Relay gave up: {}", error.text);
                    return Ok(());
                }
                Message::Error(error) => {
                    tracing::warn!("Relay reported: {}", error.text);
                    None
                }
                other => {
                    tracing::warn!("Ignoring {:?}", other.kind());
                    None
                }
            };

            if let Some(reply) = reply {
                socket.write_all(&reply.encode_frame()?).await?;
            }
        }
    }
}
