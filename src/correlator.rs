//! Request correlation.
//!
//! Every forwarded request gets an id and a pending entry holding a
//! one-shot slot. The entry is removed by whichever comes first: the
//! matching response, the deadline, or channel loss. Removing the entry is
//! what makes the first outcome win; anything later finds no entry and is a
//! no-op.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::error::{RelayError, Result};
use crate::protocol::ResponseRecord;

/// How a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Response(ResponseRecord),
    /// No response before the deadline.
    TimedOut { request_id: i32 },
    /// The channel went away first.
    Abandoned { request_id: i32 },
}

impl CallOutcome {
    /// The response to hand back over HTTP. Anything but a real response
    /// becomes a bare 500.
    pub fn into_response(self) -> ResponseRecord {
        match self {
            CallOutcome::Response(response) => response,
            CallOutcome::TimedOut { .. } | CallOutcome::Abandoned { .. } => {
                ResponseRecord::internal_error()
            }
        }
    }

    pub fn into_result(self) -> Result<ResponseRecord> {
        match self {
            CallOutcome::Response(response) => Ok(response),
            CallOutcome::TimedOut { request_id } => Err(RelayError::CallTimeout { request_id }),
            CallOutcome::Abandoned { .. } => Err(RelayError::ChannelClosed),
        }
    }
}

struct PendingCall {
    slot: oneshot::Sender<CallOutcome>,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn settle(self, outcome: CallOutcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have given up already.
        let _ = self.slot.send(outcome);
    }
}

/// Table of outstanding calls, keyed by request id.
///
/// Not synchronized: one owner drives it, see [`Relay`](crate::Relay).
#[derive(Default)]
pub struct Correlator {
    next_id: i32,
    pending: HashMap<i32, PendingCall>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and a pending entry for a new call.
    ///
    /// Ids start at 0 and wrap; an id still in use is skipped.
    pub fn register(&mut self) -> (i32, oneshot::Receiver<CallOutcome>) {
        let mut id = self.next_id;
        while self.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id = id.wrapping_add(1);

        let (slot, rx) = oneshot::channel();
        self.pending.insert(id, PendingCall { slot, timer: None });
        (id, rx)
    }

    /// Start the deadline for `id`. When it passes, `id` is sent on
    /// `expired` and the owner should call [`expire`](Self::expire).
    pub fn arm_timer(&mut self, id: i32, timeout: Duration, expired: &mpsc::UnboundedSender<i32>) {
        let Some(call) = self.pending.get_mut(&id) else {
            return;
        };
        let expired = expired.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = expired.send(id);
        });
        call.timer = Some(timer.abort_handle());
    }

    /// Complete `id` with a response. Returns false when `id` is not pending.
    pub fn resolve(&mut self, id: i32, response: ResponseRecord) -> bool {
        match self.pending.remove(&id) {
            Some(call) => {
                call.settle(CallOutcome::Response(response));
                true
            }
            None => false,
        }
    }

    /// Complete `id` as timed out. Returns false when `id` is not pending.
    pub fn expire(&mut self, id: i32) -> bool {
        match self.pending.remove(&id) {
            Some(call) => {
                call.settle(CallOutcome::TimedOut { request_id: id });
                true
            }
            None => false,
        }
    }

    /// Drop `id` without completing it; its receiver sees the sender gone.
    pub fn cancel(&mut self, id: i32) -> bool {
        match self.pending.remove(&id) {
            Some(call) => {
                if let Some(timer) = call.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Complete every pending call as abandoned. Returns how many there were.
    pub fn abandon_all(&mut self) -> usize {
        let count = self.pending.len();
        for (id, call) in self.pending.drain() {
            call.settle(CallOutcome::Abandoned { request_id: id });
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: i32) -> bool {
        self.pending.contains_key(&id)
    }

    /// The id the next call will most likely get.
    pub fn next_id(&self) -> i32 {
        self.next_id
    }
}
