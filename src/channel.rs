//! A live link to the backend.
//!
//! A [`Channel`] owns one bidirectional transport. Outbound messages go
//! through a [`SendPump`]; a receive loop started at construction decodes
//! inbound frames and reports them as [`ChannelEvent`]s.
//!
//! The channel moves `Open -> Closed` exactly once, on the first of: a
//! receive failure, a pump failure, or [`Channel::close`]. That transition
//! stops the pump, ends the receive loop and emits a single
//! [`ChannelEvent::Disconnected`]. Nothing is emitted after it.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::protocol::{
    Envelope, ErrorAnnouncement, FrameBuffer, Message, Readiness, RequestRecord, ResponseRecord,
};
use crate::pump::SendPump;

/// Something the channel observed.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The backend is up.
    LivenessReady,
    /// A response to an earlier request.
    Response(Envelope<ResponseRecord>),
    /// The channel closed. `None` for an explicit close.
    Disconnected(Option<RelayError>),
}

impl TryFrom<Message> for ChannelEvent {
    type Error = RelayError;

    /// Only responses and the liveness signal may come from the backend.
    fn try_from(message: Message) -> Result<Self> {
        match message {
            Message::LivenessReady => Ok(ChannelEvent::LivenessReady),
            Message::Response(envelope) => Ok(ChannelEvent::Response(envelope)),
            other => Err(RelayError::ProtocolViolation(format!(
                "Unexpected {:?} frame from backend",
                other.kind()
            ))),
        }
    }
}

struct ChannelInner {
    /// `Some` while open. Taking it is the `Open -> Closed` transition.
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    pump: SendPump,
    shutdown: CancellationToken,
}

impl ChannelInner {
    fn emit(&self, event: ChannelEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn terminate(&self, error: Option<RelayError>) {
        let mut events = self.events.lock();
        let Some(tx) = events.take() else {
            return;
        };

        self.shutdown.cancel();
        self.pump.stop();

        match &error {
            Some(e) => tracing::warn!("Channel to backend lost: {}", e),
            None => tracing::info!("Channel to backend closed"),
        }
        let _ = tx.send(ChannelEvent::Disconnected(error));
    }
}

/// Handle to an open (or closed) channel. Clones share the same link.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Take over `transport` and start the send pump and the receive loop.
    ///
    /// Every event, including the final `Disconnected`, goes to `events`.
    pub fn open<T>(
        transport: T,
        config: &RelayConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(transport);

        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let weak = weak.clone();
            let (pump, _task) = SendPump::spawn(writer, move |error| {
                if let Some(inner) = weak.upgrade() {
                    inner.terminate(error);
                }
            });
            ChannelInner {
                events: Mutex::new(Some(events)),
                pump,
                shutdown: CancellationToken::new(),
            }
        });

        tokio::spawn(receive_loop(
            inner.clone(),
            reader,
            FrameBuffer::with_max_body(config.max_body_size),
            config.read_buffer_size.max(1),
        ));

        tracing::info!("Channel to backend open");
        Self { inner }
    }

    /// Encode and queue a message. Fails with `ChannelClosed` once closed.
    pub fn send(&self, message: &Message) -> Result<()> {
        if !self.is_open() {
            return Err(RelayError::ChannelClosed);
        }
        let frame = message.encode_frame()?;
        self.inner.pump.enqueue(frame)
    }

    pub fn send_request(&self, envelope: Envelope<RequestRecord>) -> Result<()> {
        self.send(&Message::Request(envelope))
    }

    pub fn send_readiness(&self, readiness: Readiness) -> Result<()> {
        self.send(&Message::Readiness(readiness))
    }

    pub fn send_error(&self, error: ErrorAnnouncement) -> Result<()> {
        self.send(&Message::Error(error))
    }

    /// Close gracefully. Idempotent.
    pub fn close(&self) {
        self.inner.terminate(None);
    }

    pub fn is_open(&self) -> bool {
        self.inner.events.lock().is_some()
    }
}

async fn receive_loop<R>(
    inner: Arc<ChannelInner>,
    reader: R,
    frames: FrameBuffer,
    read_buffer_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let result = tokio::select! {
        biased;
        _ = inner.shutdown.cancelled() => return,
        result = read_frames(&inner, reader, frames, read_buffer_size) => result,
    };
    match result {
        Ok(()) => inner.terminate(None),
        Err(e) => inner.terminate(Some(e)),
    }
}

/// Read until the stream ends or fails, dispatching every complete frame
/// in arrival order. Only returns with an error.
///
/// The liveness signal may arrive once; a repeat is a protocol violation.
async fn read_frames<R>(
    inner: &ChannelInner,
    mut reader: R,
    mut frames: FrameBuffer,
    read_buffer_size: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; read_buffer_size];
    let mut live = false;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(frames.end_of_stream());
        }

        frames.extend(&buf[..n]);
        while let Some(frame) = frames.next_frame()? {
            let event = ChannelEvent::try_from(frame.into_message()?)?;
            if matches!(event, ChannelEvent::LivenessReady) {
                if live {
                    return Err(RelayError::ProtocolViolation(
                        "Repeated liveness signal from backend".to_string(),
                    ));
                }
                live = true;
                tracing::debug!("Backend signalled liveness");
            }
            inner.emit(event);
        }
    }
}
