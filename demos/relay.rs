//! Relay - connects to a backend and runs the startup sequence.
//!
//! The hosts redirect is applied to the file given on the command line (use
//! a scratch copy, not the real hosts file). The trust store only logs, and
//! the terminator is replaced by a loop that forwards one request a second.
//!
//! ```text
//! cargo run --example backend_stub -- 51234
//! cargo run --example relay -- 51234 /tmp/hosts
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relaywire::{
    connect_backend, HostsFile, Relay, RelayHandle, RequestRecord, Startup, Terminator,
    TrustStore,
};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Trust store that only pretends.
struct LoggingTrustStore;

impl TrustStore for LoggingTrustStore {
    fn set_installed(&self, installed: bool) -> io::Result<bool> {
        let action = if installed { "install" } else { "remove" };
        tracing::info!("(pretending to {} the root certificate)", action);
        Ok(false)
    }
}

/// Stands in for the TLS terminator: forwards a fixed request once a second.
#[derive(Default)]
struct TickingTerminator {
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Terminator for TickingTerminator {
    async fn start(&self, relay: RelayHandle) -> relaywire::Result<()> {
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                let request = RequestRecord::from_intercepted(
                    "GET",
                    "channel-service.example.com",
                    "/status",
                    [("Accept", "*/*")],
                    "",
                );
                match relay.call(request).await {
                    Ok(response) => {
                        let http = response.into_http();
                        tracing::info!("Got {} ({} bytes)", http.status(), http.body().len());
                    }
                    Err(e) => {
                        tracing::warn!("Call failed: {}", e);
                        return;
                    }
                }
            }
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> relaywire::Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().map(|arg| arg.parse()).transpose()?.unwrap_or(51234);
    let hosts_path = args.next().unwrap_or_else(|| "hosts.scratch".to_string());
    if !std::path::Path::new(&hosts_path).exists() {
        std::fs::write(&hosts_path, "127.0.0.1 localhost\n")?;
    }

    let relay = Relay::builder().call_timeout(Duration::from_secs(5)).spawn();

    tracing::info!("Step 1: Connecting to backend on {}", port);
    relay.attach(connect_backend(port).await?).await?;

    let startup = Startup::new(
        relay.clone(),
        Arc::new(HostsFile::new(&hosts_path, "channel-service.example.com", "relaywire-demo")),
        Arc::new(LoggingTrustStore),
        Arc::new(TickingTerminator::default()),
    );

    let result = startup.run().await;
    if let Err(e) = &result {
        tracing::error!("{}", e);
        // Give the fatal announcement time to reach the backend, which
        // closes the channel once it has read it.
        if tokio::time::timeout(Duration::from_secs(5), relay.closed())
            .await
            .is_err()
        {
            tracing::warn!("Backend did not disconnect after the fatal error");
        }
    } else {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                relay.shutdown().await;
            }
            cause = relay.closed() => tracing::info!("Relay closed: {:?}", cause),
        }
    }

    startup.teardown().await;
    relay.shutdown().await;
    result.map_err(Into::into)
}
