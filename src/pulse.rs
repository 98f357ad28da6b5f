//! Pulse-wait: a reusable multi-waiter wake-up signal.
//!
//! [`PulseWait::pulse`] releases every waiter registered at that moment and
//! nobody else; a pulse with no waiters is lost. To avoid missing a pulse
//! between "check the condition" and "start waiting", register first:
//!
//! ```ignore
//! use relaywire::pulse::PulseWait;
//!
//! let pulse = PulseWait::new();
//! let waiter = pulse.register();
//! // ... check the guarded condition here ...
//! pulse.pulse();
//! waiter.wait().await; // returns: registered before the pulse
//! ```

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Multi-waiter signal. Safe to pulse from any number of tasks.
#[derive(Debug, Default)]
pub struct PulseWait {
    notify: Notify,
    waiting: AtomicUsize,
    closed: AtomicBool,
}

/// A registration that will observe the next pulse.
pub struct Waiter<'a> {
    owner: &'a PulseWait,
    notified: Pin<Box<Notified<'a>>>,
}

impl PulseWait {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for the next pulse without suspending yet.
    pub fn register(&self) -> Waiter<'_> {
        let mut notified = Box::pin(self.notify.notified());
        notified.as_mut().enable();
        self.waiting.fetch_add(1, Ordering::SeqCst);
        Waiter {
            owner: self,
            notified,
        }
    }

    /// Suspend until the next pulse.
    pub async fn wait(&self) {
        self.register().wait().await
    }

    /// Suspend until the next pulse or until `timeout` elapses.
    ///
    /// Returns `true` when released by a pulse, `false` on timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        self.register().wait_timeout(timeout).await
    }

    /// Release every currently registered waiter.
    pub fn pulse(&self) {
        self.notify.notify_waiters();
    }

    /// Pulse one last time; later waits return immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of registered waiters.
    pub fn waiters(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

impl Waiter<'_> {
    pub async fn wait(mut self) {
        if self.owner.is_closed() {
            return;
        }
        self.notified.as_mut().await;
    }

    /// Returns `true` when released by a pulse, `false` on timeout.
    pub async fn wait_timeout(mut self, timeout: Duration) -> bool {
        if self.owner.is_closed() {
            return true;
        }
        tokio::time::timeout(timeout, self.notified.as_mut())
            .await
            .is_ok()
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.owner.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}
