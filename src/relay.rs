//! The relay: single owner of the channel and the correlator.
//!
//! [`Relay`] runs as one task. Calls, responses, deadlines and disconnects
//! all arrive as messages on that task, so the correlator table and the
//! channel lifecycle never need a lock. Callers talk to it through a
//! cloneable [`RelayHandle`].
//!
//! # Example
//!
//! ```ignore
//! use relaywire::{connect_backend, Relay, RequestRecord};
//!
//! let relay = Relay::builder()
//!     .call_timeout(Duration::from_secs(10))
//!     .spawn();
//!
//! relay.attach(connect_backend(port).await?).await?;
//! relay.wait_liveness().await?;
//!
//! let response = relay.call(RequestRecord::new("GET", "https://x/y", Default::default())).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::channel::{Channel, ChannelEvent};
use crate::config::RelayConfig;
use crate::correlator::{CallOutcome, Correlator};
use crate::error::{RelayError, Result};
use crate::protocol::{
    Envelope, ErrorAnnouncement, Message, Readiness, RequestRecord, ResponseRecord,
};
use crate::transport::{BoxedTransport, Transport};

/// Capacity of the command queue between handles and the relay task.
pub const COMMAND_CAPACITY: usize = 1024;

/// Why the relay shut down.
#[derive(Debug, Clone)]
pub enum ShutdownCause {
    /// `shutdown()` was called, or every handle was dropped.
    Requested,
    /// The channel went away. `None` for a graceful close.
    Disconnected(Option<Arc<RelayError>>),
}

impl ShutdownCause {
    /// The error that ended the channel, if any.
    pub fn error(&self) -> Option<&RelayError> {
        match self {
            ShutdownCause::Disconnected(Some(e)) => Some(e),
            _ => None,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Attach {
        transport: BoxedTransport,
        reply: Reply<()>,
    },
    Call {
        request: RequestRecord,
        reply: Reply<oneshot::Receiver<CallOutcome>>,
    },
    Send {
        message: Message,
        reply: Reply<()>,
    },
    WaitLiveness {
        reply: Reply<()>,
    },
    Quit {
        reason: String,
    },
    Shutdown,
}

/// Builder for a [`Relay`].
pub struct RelayBuilder {
    config: RelayConfig,
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self {
            config: RelayConfig::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how long a call waits for the backend.
    ///
    /// Default: 30 seconds
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set the largest inbound frame body accepted.
    ///
    /// Default: 1 GiB
    pub fn max_body_size(mut self, size: u32) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Set the receive loop's read buffer size.
    ///
    /// Default: 64 KiB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Start the relay task.
    pub fn spawn(self) -> RelayHandle {
        Relay::spawn(self.config)
    }
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State owned by the relay task.
pub struct Relay {
    config: RelayConfig,
    correlator: Correlator,
    channel: Option<Channel>,
    live: bool,
    liveness_waiters: Vec<Reply<()>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    expired_tx: mpsc::UnboundedSender<i32>,
    state: watch::Sender<Option<ShutdownCause>>,
}

impl Relay {
    pub fn builder() -> RelayBuilder {
        RelayBuilder::new()
    }

    /// Start the relay task and return a handle to it.
    pub fn spawn(config: RelayConfig) -> RelayHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(None);

        let relay = Relay {
            config,
            correlator: Correlator::new(),
            channel: None,
            live: false,
            liveness_waiters: Vec::new(),
            events_tx,
            expired_tx,
            state: state_tx,
        };
        tokio::spawn(relay.run(commands_rx, events_rx, expired_rx));

        RelayHandle {
            commands: commands_tx,
            state: state_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut expired: mpsc::UnboundedReceiver<i32>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(id) = expired.recv() => self.handle_expiry(id),
            }
        }

        self.begin_shutdown(ShutdownCause::Requested);
        tracing::debug!("Relay task exiting");
    }

    fn is_shut_down(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// The channel, if attached and still open.
    fn open_channel(&self) -> Option<&Channel> {
        self.channel.as_ref().filter(|channel| channel.is_open())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Attach { transport, reply } => {
                let _ = reply.send(self.attach(transport));
            }
            Command::Call { request, reply } => {
                let _ = reply.send(self.call(request));
            }
            Command::Send { message, reply } => {
                let result = match self.open_channel() {
                    Some(channel) => channel.send(&message),
                    None => Err(RelayError::NoChannel),
                };
                let _ = reply.send(result);
            }
            Command::WaitLiveness { reply } => {
                if self.live {
                    let _ = reply.send(Ok(()));
                } else if self.is_shut_down() {
                    let _ = reply.send(Err(RelayError::ChannelClosed));
                } else {
                    self.liveness_waiters.push(reply);
                }
            }
            Command::Quit { reason } => self.quit(reason),
            Command::Shutdown => self.begin_shutdown(ShutdownCause::Requested),
        }
    }

    fn attach(&mut self, transport: BoxedTransport) -> Result<()> {
        if self.is_shut_down() {
            return Err(RelayError::ChannelClosed);
        }
        if self.channel.is_some() {
            return Err(RelayError::AlreadyAttached);
        }
        let channel = Channel::open(transport, &self.config, self.events_tx.clone());
        self.channel = Some(channel);
        Ok(())
    }

    fn call(&mut self, request: RequestRecord) -> Result<oneshot::Receiver<CallOutcome>> {
        let Some(channel) = self.open_channel().cloned() else {
            return Err(RelayError::NoChannel);
        };

        let (id, rx) = self.correlator.register();
        self.correlator
            .arm_timer(id, self.config.call_timeout, &self.expired_tx);

        tracing::debug!("Forwarding {} {} as request {}", request.method, request.uri, id);
        if let Err(e) = channel.send_request(Envelope::new(id, request)) {
            self.correlator.cancel(id);
            return Err(e);
        }
        Ok(rx)
    }

    fn quit(&mut self, reason: String) {
        tracing::error!("Quitting: {}", reason);
        let announced = self
            .open_channel()
            .map(|channel| channel.send_error(ErrorAnnouncement::fatal(reason)).is_ok())
            .unwrap_or(false);
        // With the announcement sent, the backend closes the channel.
        if !announced {
            self.begin_shutdown(ShutdownCause::Requested);
        }
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::LivenessReady => {
                // The channel rejects a repeated signal before it gets here.
                self.live = true;
                tracing::info!("Backend is live");
                for waiter in self.liveness_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            ChannelEvent::Response(Envelope { request_id, record }) => {
                let status = record.status_code;
                if self.correlator.resolve(request_id, record) {
                    tracing::debug!("Request {} answered with {}", request_id, status);
                } else {
                    tracing::debug!("Dropping response for unknown request {}", request_id);
                }
            }
            ChannelEvent::Disconnected(error) => {
                self.begin_shutdown(ShutdownCause::Disconnected(error.map(Arc::new)));
            }
        }
    }

    fn handle_expiry(&mut self, id: i32) {
        if self.correlator.expire(id) {
            tracing::warn!("Request {} timed out", id);
        }
    }

    /// Close the channel and settle everything still waiting. Idempotent.
    fn begin_shutdown(&mut self, cause: ShutdownCause) {
        if self.is_shut_down() {
            return;
        }
        match cause.error() {
            Some(e) => tracing::error!("Relay shutting down: {}", e),
            None => tracing::info!("Relay shutting down"),
        }

        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        let abandoned = self.correlator.abandon_all();
        if abandoned > 0 {
            tracing::warn!("Abandoned {} pending requests", abandoned);
        }
        for waiter in self.liveness_waiters.drain(..) {
            let _ = waiter.send(Err(RelayError::ChannelClosed));
        }

        self.state.send_replace(Some(cause));
    }
}

/// Cloneable handle to a running [`Relay`].
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<Option<ShutdownCause>>,
}

impl RelayHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| RelayError::ChannelClosed)?;
        rx.await.map_err(|_| RelayError::ChannelClosed)?
    }

    /// Open the channel over `transport`. A relay takes one channel in its
    /// lifetime.
    pub async fn attach<T: Transport>(&self, transport: T) -> Result<()> {
        let transport: BoxedTransport = Box::new(transport);
        self.request(|reply| Command::Attach { transport, reply })
            .await
    }

    /// Forward a request and wait for its response.
    ///
    /// A timeout or the loss of the channel yields a bare 500. Fails only
    /// when the request could not be sent at all: `NoChannel` without a
    /// channel, `EncodingTooLarge` for an oversized string.
    pub async fn call(&self, request: RequestRecord) -> Result<ResponseRecord> {
        Ok(self.call_outcome(request).await?.into_response())
    }

    /// Like [`call`](Self::call), but reports how the call ended.
    pub async fn call_outcome(&self, request: RequestRecord) -> Result<CallOutcome> {
        let slot = self
            .request(|reply| Command::Call { request, reply })
            .await?;
        slot.await.map_err(|_| RelayError::ChannelClosed)
    }

    /// Wait for the backend's liveness signal.
    pub async fn wait_liveness(&self) -> Result<()> {
        self.request(|reply| Command::WaitLiveness { reply }).await
    }

    pub async fn announce_readiness(&self, readiness: Readiness) -> Result<()> {
        tracing::info!("Announcing {:?}", readiness);
        self.send(Message::Readiness(readiness)).await
    }

    /// Tell the backend about a problem that does not stop the relay.
    pub async fn report_error(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::Error(ErrorAnnouncement::non_fatal(text)))
            .await
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.request(|reply| Command::Send { message, reply }).await
    }

    /// Give up: tell the backend with a fatal error, or shut down directly
    /// when there is no channel to tell.
    pub async fn quit(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let _ = self.commands.send(Command::Quit { reason }).await;
    }

    /// Begin shutdown. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Wait until the relay has shut down.
    pub async fn closed(&self) -> ShutdownCause {
        let mut state = self.state.clone();
        let cause = match state.wait_for(Option::is_some).await {
            Ok(cause) => cause.clone(),
            Err(_) => None,
        };
        cause.unwrap_or(ShutdownCause::Requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, HttpPayload};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn get(uri: &str) -> RequestRecord {
        RequestRecord::new("GET", uri, HttpPayload::default())
    }

    async fn next_message(backend: &mut DuplexStream, frames: &mut FrameBuffer) -> Message {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(frame) = frames.next_frame().unwrap() {
                return frame.into_message().unwrap();
            }
            let n = backend.read(&mut buf).await.unwrap();
            assert!(n > 0, "relay closed the channel");
            frames.extend(&buf[..n]);
        }
    }

    async fn attached() -> (RelayHandle, DuplexStream) {
        let relay = Relay::builder().spawn();
        let (relay_side, backend_side) = duplex(64 * 1024);
        relay.attach(relay_side).await.unwrap();
        (relay, backend_side)
    }

    #[tokio::test]
    async fn test_call_without_channel() {
        let relay = Relay::builder().spawn();
        let err = relay.call(get("https://x/")).await.unwrap_err();
        assert!(matches!(err, RelayError::NoChannel));
    }

    #[tokio::test]
    async fn test_no_channel_does_not_consume_id() {
        let relay = Relay::builder().spawn();
        let _ = relay.call(get("https://x/")).await;

        let (relay_side, mut backend) = duplex(64 * 1024);
        relay.attach(relay_side).await.unwrap();

        let call = tokio::spawn({
            let relay = relay.clone();
            async move { relay.call(get("https://x/")).await }
        });

        let mut frames = FrameBuffer::new();
        match next_message(&mut backend, &mut frames).await {
            Message::Request(envelope) => assert_eq!(envelope.request_id, 0),
            other => panic!("unexpected {:?}", other),
        }
        relay.shutdown().await;
        assert_eq!(call.await.unwrap().unwrap().status_code, 500);
    }

    #[tokio::test]
    async fn test_attach_twice() {
        let (relay, _backend) = attached().await;
        let (second, _other) = duplex(64);
        let err = relay.attach(second).await.unwrap_err();
        assert!(matches!(err, RelayError::AlreadyAttached));
    }

    #[tokio::test]
    async fn test_call_resolved_by_response() {
        let (relay, mut backend) = attached().await;

        let call = tokio::spawn({
            let relay = relay.clone();
            async move { relay.call(get("https://x/y")).await }
        });

        let mut frames = FrameBuffer::new();
        let id = match next_message(&mut backend, &mut frames).await {
            Message::Request(envelope) => envelope.request_id,
            other => panic!("unexpected {:?}", other),
        };
        let reply = Message::Response(Envelope::new(
            id,
            ResponseRecord::new(201, HttpPayload::new(vec![], "made")),
        ));
        backend
            .write_all(&reply.encode_frame().unwrap())
            .await
            .unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status_code, 201);
        assert_eq!(&response.payload.body[..], b"made");
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let relay = Relay::builder()
            .call_timeout(Duration::from_secs(30))
            .spawn();
        let (relay_side, _backend) = duplex(64 * 1024);
        relay.attach(relay_side).await.unwrap();

        let outcome = relay.call_outcome(get("https://x/")).await.unwrap();
        assert_eq!(outcome, CallOutcome::TimedOut { request_id: 0 });
        assert!(!relay.is_closed());
    }

    #[tokio::test]
    async fn test_liveness_waiters_released() {
        let (relay, mut backend) = attached().await;

        let waiter = tokio::spawn({
            let relay = relay.clone();
            async move { relay.wait_liveness().await }
        });
        tokio::task::yield_now().await;

        let live = Message::LivenessReady.encode_frame().unwrap();
        backend.write_all(&live).await.unwrap();

        waiter.await.unwrap().unwrap();
        relay.wait_liveness().await.unwrap();
        assert!(!relay.is_closed());
    }

    #[tokio::test]
    async fn test_repeated_liveness_shuts_down() {
        let (relay, mut backend) = attached().await;

        let live = Message::LivenessReady.encode_frame().unwrap();
        backend.write_all(&live).await.unwrap();
        backend.write_all(&live).await.unwrap();

        let cause = tokio::time::timeout(Duration::from_secs(2), relay.closed())
            .await
            .unwrap();
        assert!(matches!(
            cause.error(),
            Some(RelayError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_abandons_calls() {
        let (relay, mut backend) = attached().await;

        let call = tokio::spawn({
            let relay = relay.clone();
            async move { relay.call_outcome(get("https://x/")).await }
        });
        let mut frames = FrameBuffer::new();
        next_message(&mut backend, &mut frames).await;
        drop(backend);

        let outcome = call.await.unwrap().unwrap();
        assert_eq!(outcome, CallOutcome::Abandoned { request_id: 0 });

        let cause = relay.closed().await;
        assert!(matches!(cause.error(), Some(RelayError::PeerClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (relay, _backend) = attached().await;

        let waiter = tokio::spawn({
            let relay = relay.clone();
            async move { relay.wait_liveness().await }
        });
        tokio::task::yield_now().await;

        relay.shutdown().await;
        relay.shutdown().await;

        assert!(matches!(relay.closed().await, ShutdownCause::Requested));
        assert!(matches!(
            waiter.await.unwrap(),
            Err(RelayError::ChannelClosed)
        ));
        assert!(matches!(
            relay.announce_readiness(Readiness::Running).await,
            Err(RelayError::NoChannel)
        ));
    }

    #[tokio::test]
    async fn test_quit_announces_fatal_error() {
        let (relay, mut backend) = attached().await;

        relay.quit("certificate store unavailable").await;

        let mut frames = FrameBuffer::new();
        match next_message(&mut backend, &mut frames).await {
            Message::Error(error) => {
                assert!(error.fatal);
                assert_eq!(error.text, "certificate store unavailable");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!relay.is_closed());
    }

    #[tokio::test]
    async fn test_quit_without_channel_shuts_down() {
        let relay = Relay::builder().spawn();
        relay.quit("no backend").await;
        assert!(matches!(relay.closed().await, ShutdownCause::Requested));
    }
}
