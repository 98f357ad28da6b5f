//! Startup sequence and teardown of the surrounding process.
//!
//! The relay only forwards traffic. Getting traffic to it takes three
//! collaborators: a [`HostsRedirect`] that points the intercepted hostname
//! at loopback, a [`TrustStore`] that installs the root certificate the
//! terminator signs with, and the [`Terminator`] itself. [`Startup`] drives
//! them in a fixed order, gated on the backend's liveness signal, and keeps
//! the backend informed through readiness announcements.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::error::{RelayError, Result};
use crate::protocol::Readiness;
use crate::relay::RelayHandle;

/// Redirects the intercepted hostname to this machine.
pub trait HostsRedirect: Send + Sync {
    /// Turn the redirect on or off. Returns whether it already was that way.
    fn set_redirect(&self, active: bool) -> io::Result<bool>;
}

/// The system trust store holding the terminator's root certificate.
pub trait TrustStore: Send + Sync {
    /// Install or uninstall the certificate. Returns whether it already was
    /// that way.
    fn set_installed(&self, installed: bool) -> io::Result<bool>;
}

/// The TLS terminator that accepts intercepted connections and forwards
/// each request through the relay.
#[async_trait]
pub trait Terminator: Send + Sync {
    async fn start(&self, relay: RelayHandle) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

const HOSTS_FAILURE: &str =
    "Could not read/write the hosts file. Is the process running with admin rights?";
const TRUST_FAILURE: &str = "Could not install the root certificate";

/// Runs the startup steps and, later, undoes them.
pub struct Startup {
    relay: RelayHandle,
    hosts: Arc<dyn HostsRedirect>,
    trust: Arc<dyn TrustStore>,
    terminator: Arc<dyn Terminator>,
    teardown: OnceCell<()>,
}

impl Startup {
    pub fn new(
        relay: RelayHandle,
        hosts: Arc<dyn HostsRedirect>,
        trust: Arc<dyn TrustStore>,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        Self {
            relay,
            hosts,
            trust,
            terminator,
            teardown: OnceCell::new(),
        }
    }

    /// Run the startup sequence. The relay must already have its channel.
    ///
    /// A failed hosts or certificate step tells the backend to quit and
    /// returns `Startup`. A terminator that fails to start is reported to
    /// the backend, and startup carries on.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Step 2: Removing redirect from hosts");
        match self.hosts.set_redirect(false) {
            Ok(true) => tracing::info!("Redirect not present"),
            Ok(false) => tracing::info!("Redirect removed"),
            Err(e) => return Err(self.fail(HOSTS_FAILURE, e).await),
        }

        // The backend resolves the real address while the redirect is off.
        tracing::info!("Step 3: Waiting for the backend to be ready");
        self.relay.announce_readiness(Readiness::Hosts).await?;
        self.relay.wait_liveness().await?;
        tracing::info!("Backend ready");

        tracing::info!("Step 4: Redirecting intercepted host to loopback");
        match self.hosts.set_redirect(true) {
            Ok(true) => tracing::info!("Redirect already present"),
            Ok(false) => tracing::info!("Redirect added"),
            Err(e) => return Err(self.fail(HOSTS_FAILURE, e).await),
        }

        tracing::info!("Step 5: Installing the root certificate");
        match self.trust.set_installed(true) {
            Ok(true) => tracing::info!("Certificate already present"),
            Ok(false) => tracing::info!("Certificate installed"),
            Err(e) => return Err(self.fail(TRUST_FAILURE, e).await),
        }
        self.relay.announce_readiness(Readiness::Starting).await?;

        tracing::info!("Step 6: Starting the terminator");
        match self.terminator.start(self.relay.clone()).await {
            Ok(()) => tracing::info!("Terminator started"),
            Err(e) => {
                tracing::error!("Terminator failed to start: {}", e);
                if let Err(report) = self
                    .relay
                    .report_error(format!("Terminator failed to start: {}", e))
                    .await
                {
                    tracing::warn!("Could not report terminator failure: {}", report);
                }
            }
        }

        tracing::info!("Ready");
        self.relay.announce_readiness(Readiness::Running).await
    }

    async fn fail(&self, reason: &str, error: io::Error) -> RelayError {
        tracing::error!("{}: {}", reason, error);
        self.relay.quit(reason).await;
        RelayError::Startup(format!("{}: {}", reason, error))
    }

    /// Undo the startup steps. Runs once; later calls wait for the first.
    ///
    /// Failures are logged and do not stop the remaining steps.
    pub async fn teardown(&self) {
        self.teardown
            .get_or_init(|| async {
                tracing::info!("Stopping the terminator");
                if let Err(e) = self.terminator.stop().await {
                    tracing::warn!("Failed to stop the terminator: {}", e);
                }

                tracing::info!("Removing redirect from hosts");
                if let Err(e) = self.hosts.set_redirect(false) {
                    tracing::warn!("Failed to remove hosts file entry: {}", e);
                }

                tracing::info!("Removing root certificate");
                if let Err(e) = self.trust.set_installed(false) {
                    tracing::warn!("Failed to uninstall the root certificate: {}", e);
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, Message};
    use crate::relay::Relay;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    /// Records every call and fails the ones listed in `fail_on`.
    #[derive(Default)]
    struct FakeToggle {
        calls: Mutex<Vec<bool>>,
        fail_on: Option<bool>,
    }

    impl FakeToggle {
        fn failing_on(state: bool) -> Self {
            Self {
                fail_on: Some(state),
                ..Default::default()
            }
        }

        fn toggle(&self, state: bool) -> io::Result<bool> {
            self.calls.lock().push(state);
            if self.fail_on == Some(state) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            Ok(false)
        }
    }

    impl HostsRedirect for FakeToggle {
        fn set_redirect(&self, active: bool) -> io::Result<bool> {
            self.toggle(active)
        }
    }

    impl TrustStore for FakeToggle {
        fn set_installed(&self, installed: bool) -> io::Result<bool> {
            self.toggle(installed)
        }
    }

    #[derive(Default)]
    struct FakeTerminator {
        fail_start: bool,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl Terminator for FakeTerminator {
        async fn start(&self, _relay: RelayHandle) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(RelayError::Io(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "port 443 in use",
                )));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Backend that answers `Hosts` with liveness and forwards everything it
    /// receives.
    fn spawn_backend(mut stream: DuplexStream) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut frames = FrameBuffer::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                frames.extend(&buf[..n]);
                while let Ok(Some(frame)) = frames.next_frame() {
                    let message = frame.into_message().unwrap();
                    if message == Message::Readiness(Readiness::Hosts) {
                        let live = Message::LivenessReady.encode_frame().unwrap();
                        stream.write_all(&live).await.unwrap();
                    }
                    let _ = tx.send(message);
                }
            }
        });
        rx
    }

    struct Fixture {
        startup: Startup,
        hosts: Arc<FakeToggle>,
        trust: Arc<FakeToggle>,
        terminator: Arc<FakeTerminator>,
        backend: mpsc::UnboundedReceiver<Message>,
    }

    async fn fixture(hosts: FakeToggle, trust: FakeToggle, terminator: FakeTerminator) -> Fixture {
        let relay = Relay::builder().spawn();
        let (relay_side, backend_side) = duplex(64 * 1024);
        relay.attach(relay_side).await.unwrap();
        let backend = spawn_backend(backend_side);

        let hosts = Arc::new(hosts);
        let trust = Arc::new(trust);
        let terminator = Arc::new(terminator);
        let startup = Startup::new(relay, hosts.clone(), trust.clone(), terminator.clone());
        Fixture {
            startup,
            hosts,
            trust,
            terminator,
            backend,
        }
    }

    async fn received(backend: &mut mpsc::UnboundedReceiver<Message>, count: usize) -> Vec<Message> {
        let mut messages = Vec::new();
        while messages.len() < count {
            messages.push(backend.recv().await.unwrap());
        }
        messages
    }

    #[tokio::test]
    async fn test_full_sequence() {
        let mut f = fixture(
            FakeToggle::default(),
            FakeToggle::default(),
            FakeTerminator::default(),
        )
        .await;

        f.startup.run().await.unwrap();

        assert_eq!(*f.hosts.calls.lock(), vec![false, true]);
        assert_eq!(*f.trust.calls.lock(), vec![true]);
        assert_eq!(f.terminator.starts.load(Ordering::SeqCst), 1);
        assert_eq!(
            received(&mut f.backend, 3).await,
            vec![
                Message::Readiness(Readiness::Hosts),
                Message::Readiness(Readiness::Starting),
                Message::Readiness(Readiness::Running),
            ]
        );
    }

    #[tokio::test]
    async fn test_redirect_failure_is_fatal() {
        let mut f = fixture(
            FakeToggle::failing_on(true),
            FakeToggle::default(),
            FakeTerminator::default(),
        )
        .await;

        let err = f.startup.run().await.unwrap_err();
        assert!(matches!(err, RelayError::Startup(_)));
        assert!(f.trust.calls.lock().is_empty());
        assert_eq!(f.terminator.starts.load(Ordering::SeqCst), 0);

        let messages = received(&mut f.backend, 2).await;
        assert_eq!(messages[0], Message::Readiness(Readiness::Hosts));
        match &messages[1] {
            Message::Error(error) => assert!(error.fatal),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initial_redirect_removal_failure_is_fatal() {
        let mut f = fixture(
            FakeToggle::failing_on(false),
            FakeToggle::default(),
            FakeTerminator::default(),
        )
        .await;

        let err = f.startup.run().await.unwrap_err();
        assert!(matches!(err, RelayError::Startup(_)));
        assert_eq!(*f.hosts.calls.lock(), vec![false]);
        assert!(f.trust.calls.lock().is_empty());
        assert_eq!(f.terminator.starts.load(Ordering::SeqCst), 0);

        // The first thing the backend hears is the fatal error, not `Hosts`,
        // so it never answers with liveness.
        match received(&mut f.backend, 1).await.remove(0) {
            Message::Error(error) => assert!(error.fatal),
            other => panic!("unexpected {:?}", other),
        }
        tokio::task::yield_now().await;
        assert!(f.backend.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_certificate_failure_is_fatal() {
        let f = fixture(
            FakeToggle::default(),
            FakeToggle::failing_on(true),
            FakeTerminator::default(),
        )
        .await;

        let err = f.startup.run().await.unwrap_err();
        assert!(matches!(err, RelayError::Startup(_)));
        assert_eq!(f.terminator.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_terminator_failure_is_reported_and_startup_continues() {
        let mut f = fixture(
            FakeToggle::default(),
            FakeToggle::default(),
            FakeTerminator {
                fail_start: true,
                ..Default::default()
            },
        )
        .await;

        f.startup.run().await.unwrap();

        let messages = received(&mut f.backend, 4).await;
        assert_eq!(messages[1], Message::Readiness(Readiness::Starting));
        match &messages[2] {
            Message::Error(error) => {
                assert!(!error.fatal);
                assert!(error.text.contains("port 443 in use"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(messages[3], Message::Readiness(Readiness::Running));
    }

    #[tokio::test]
    async fn test_teardown_runs_once() {
        let f = fixture(
            FakeToggle::default(),
            FakeToggle::failing_on(false),
            FakeTerminator::default(),
        )
        .await;

        f.startup.teardown().await;
        f.startup.teardown().await;

        assert_eq!(f.terminator.stops.load(Ordering::SeqCst), 1);
        assert_eq!(*f.hosts.calls.lock(), vec![false]);
        // The failing uninstall was still attempted once.
        assert_eq!(*f.trust.calls.lock(), vec![false]);
    }
}
