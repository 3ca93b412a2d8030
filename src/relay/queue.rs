//! Bounded outbound queue for one session.
//!
//! The dispatcher pushes without ever waiting; the session's write loop is
//! the only consumer. When the queue is full the configured
//! [`OverflowPolicy`] decides what gives.

use crate::error::{RelayError, WriteFailure};
use bytes::Bytes;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// What happens to a line pushed onto a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Discard the incoming line.
    DropNewest,
    /// Discard the oldest queued line to make room.
    DropOldest,
    /// Fail the session so the dispatcher removes it.
    #[default]
    Disconnect,
}

/// Outcome of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    /// The queue was full and the new line was discarded.
    DroppedNewest,
    /// The queue was full and its oldest line was discarded.
    DroppedOldest,
}

struct Inner {
    lines: VecDeque<Bytes>,
    closed: bool,
}

pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                lines: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a line without blocking.
    ///
    /// Fails with `SessionClosed` once the queue is closed. Under
    /// `Disconnect`, overflowing closes the queue and fails with
    /// `WriteFailure::Overflow`.
    pub fn push(&self, line: Bytes) -> Result<Push, RelayError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(RelayError::SessionClosed);
        }

        let outcome = if inner.lines.len() < self.capacity {
            inner.lines.push_back(line);
            Push::Queued
        } else {
            match self.policy {
                OverflowPolicy::DropNewest => return Ok(Push::DroppedNewest),
                OverflowPolicy::DropOldest => {
                    inner.lines.pop_front();
                    inner.lines.push_back(line);
                    Push::DroppedOldest
                }
                OverflowPolicy::Disconnect => {
                    let pending = inner.lines.len();
                    inner.closed = true;
                    inner.lines.clear();
                    drop(inner);
                    self.notify.notify_one();
                    return Err(WriteFailure::Overflow(pending).into());
                }
            }
        };

        drop(inner);
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Wait for the next line. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(line) = inner.lines.pop_front() {
                    return Some(line);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse further pushes. Lines already queued can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }
}
