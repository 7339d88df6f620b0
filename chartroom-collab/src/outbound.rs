//! Bounded per-connection outbound queue.
//!
//! The queue decouples a slow client from the bus subscriber that feeds it:
//! fan-out pushes encoded frames here and returns immediately; a writer
//! task drains them onto the transport at whatever pace the client accepts.
//!
//! Overflow policy, applied on every push once the bound is exceeded:
//!
//! 1. shed the oldest ephemeral frames (cursor, typing, presence) first;
//! 2. chat and document frames are never shed;
//! 3. if the queue is still over bound after shedding, the connection is
//!    marked overflowed and closed. A consumer that cannot keep up with
//!    durable traffic must not be allowed to grow memory without bound.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::protocol::EventClass;

/// A pre-encoded frame awaiting transmission. Encoded once per room, then
/// shared across every member's queue.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub frame: Arc<Vec<u8>>,
    pub class: EventClass,
}

/// Outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Queued,
    /// Queued, after shedding this many ephemeral frames.
    QueuedAfterShedding(usize),
    /// Durable backlog exceeded the bound; the queue is now closed and the
    /// connection must be torn down.
    Overflowed,
    /// The queue was already closed.
    Closed,
}

struct Inner {
    items: VecDeque<QueuedEvent>,
    closed: bool,
    overflowed: bool,
}

pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    bound: usize,
    shed_ephemeral: AtomicU64,
}

impl OutboundQueue {
    pub fn new(bound: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
                overflowed: false,
            }),
            notify: Notify::new(),
            bound,
            shed_ephemeral: AtomicU64::new(0),
        }
    }

    /// Push an encoded frame, applying the overflow policy.
    pub fn push(&self, frame: Arc<Vec<u8>>, class: EventClass) -> PushResult {
        let mut inner = self.inner.lock().expect("outbound queue poisoned");
        if inner.closed {
            return PushResult::Closed;
        }
        inner.items.push_back(QueuedEvent { frame, class });
        if inner.items.len() <= self.bound {
            drop(inner);
            self.notify.notify_one();
            return PushResult::Queued;
        }

        // Over bound: shed oldest ephemeral frames first.
        let mut shed = 0usize;
        let mut kept = VecDeque::with_capacity(inner.items.len());
        let mut over_by = inner.items.len() - self.bound;
        for item in inner.items.drain(..) {
            if over_by > 0 && item.class == EventClass::Ephemeral {
                shed += 1;
                over_by -= 1;
            } else {
                kept.push_back(item);
            }
        }
        inner.items = kept;
        self.shed_ephemeral.fetch_add(shed as u64, Ordering::Relaxed);

        if inner.items.len() > self.bound {
            // Durable frames alone exceed the bound; give up on this peer.
            inner.closed = true;
            inner.overflowed = true;
            drop(inner);
            self.notify.notify_waiters();
            return PushResult::Overflowed;
        }
        drop(inner);
        self.notify.notify_one();
        if shed > 0 {
            PushResult::QueuedAfterShedding(shed)
        } else {
            PushResult::Queued
        }
    }

    /// Pop the next frame, waiting until one is available. Returns `None`
    /// once the queue is closed and drained of durable frames.
    pub async fn pop(&self) -> Option<QueuedEvent> {
        loop {
            {
                let mut inner = self.inner.lock().expect("outbound queue poisoned");
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue, waking the writer. Pending frames are discarded;
    /// the transport is going away with them.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("outbound queue poisoned");
        inner.closed = true;
        inner.items.clear();
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("outbound queue poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("outbound queue poisoned").closed
    }

    /// Whether the queue was closed by the overflow policy rather than a
    /// normal disconnect.
    pub fn overflowed(&self) -> bool {
        self.inner.lock().expect("outbound queue poisoned").overflowed
    }

    /// Total ephemeral frames shed over the queue's lifetime.
    pub fn shed_count(&self) -> u64 {
        self.shed_ephemeral.load(Ordering::Relaxed)
    }
}
