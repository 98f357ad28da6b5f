//! Send pump: the single writer for a transport.
//!
//! Any number of callers enqueue encoded frames; one background task drains
//! the queue onto the transport. Enqueueing never waits on I/O.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► queue ─► pulse ─► Pump Task ─► transport
//! Caller N ─┘
//! ```
//!
//! Everything queued while the task is busy (or asleep) goes out as one
//! coalesced write, in enqueue order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::pulse::PulseWait;

/// State shared between the pump handle and its task.
struct PumpShared {
    queue: Mutex<Vec<Bytes>>,
    pulse: PulseWait,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

/// Handle to a running send pump.
///
/// Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct SendPump {
    shared: Arc<PumpShared>,
}

impl SendPump {
    /// Spawn the pump task over `writer`.
    ///
    /// `on_stop` runs exactly once when the task exits: with `None` after
    /// [`stop`](Self::stop), with the error after a failed write.
    pub fn spawn<W, F>(writer: W, on_stop: F) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        F: FnOnce(Option<RelayError>) + Send + 'static,
    {
        let shared = Arc::new(PumpShared {
            queue: Mutex::new(Vec::new()),
            pulse: PulseWait::new(),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        });

        let task_shared = shared.clone();
        let task = tokio::spawn(async move {
            let result = pump_loop(&task_shared, writer).await;
            task_shared.mark_stopped();
            match result {
                Ok(()) => {
                    tracing::debug!("Send pump stopped");
                    on_stop(None);
                }
                Err(e) => {
                    tracing::warn!("Send pump failed: {}", e);
                    on_stop(Some(e));
                }
            }
        });

        (Self { shared }, task)
    }

    /// Queue a buffer for sending. Empty buffers are ignored.
    ///
    /// Fails with `ChannelClosed` once the pump has stopped.
    pub fn enqueue(&self, data: Bytes) -> Result<()> {
        if self.is_stopped() {
            return Err(RelayError::ChannelClosed);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.shared.queue.lock().push(data);
        self.shared.pulse.pulse();
        Ok(())
    }

    /// Stop the pump. Idempotent; an in-flight write is cancelled.
    pub fn stop(&self) {
        self.shared.mark_stopped();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Number of buffers waiting for the next write.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl PumpShared {
    fn mark_stopped(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.lock().clear();
        self.cancel.cancel();
        self.pulse.close();
    }
}

/// Main pump loop: sleep until there is work, then drain everything queued
/// into one write.
async fn pump_loop<W>(shared: &PumpShared, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let batch = loop {
            let waiter = shared.pulse.register();
            if shared.cancel.is_cancelled() {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("Send pump shutdown failed: {}", e);
                }
                return Ok(());
            }
            let batch = std::mem::take(&mut *shared.queue.lock());
            if !batch.is_empty() {
                break batch;
            }
            waiter.wait().await;
        };

        let blob = coalesce(batch);
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Ok(()),
            result = write_blob(&mut writer, &blob) => result?,
        }
    }
}

/// Join queued buffers into one contiguous blob.
fn coalesce(mut batch: Vec<Bytes>) -> Bytes {
    if batch.len() == 1 {
        return batch.swap_remove(0);
    }
    let total: usize = batch.iter().map(Bytes::len).sum();
    let mut blob = BytesMut::with_capacity(total);
    for chunk in &batch {
        blob.extend_from_slice(chunk);
    }
    blob.freeze()
}

async fn write_blob<W>(writer: &mut W, blob: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(blob).await?;
    // No-op for TCP, needed for buffered transports.
    writer.flush().await?;
    Ok(())
}
