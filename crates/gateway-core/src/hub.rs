//! Per-session fan-out of live notifications.
//!
//! Every attached observer owns a bounded delivery queue. Broadcasting never
//! waits for queue capacity: an observer whose queue is full is marked as
//! overflowed and dropped from the hub, and its next `recv` reports
//! [`ObserverOverflow`] so the connection can resync from the log.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::{Event, Seq};

/// Identifier of an attached observer, unique within one hub.
pub type ObserverId = u64;

/// What happened to the message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAction {
    Added,
    Removed,
    Sent,
    Cleared,
}

/// Message delivered to live observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A persisted event.
    Event(Event),
    /// The agent finished a turn; the session is idle again.
    PromptComplete { last_seq: Seq },
    QueueUpdated {
        length: usize,
        action: QueueAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    QueueTitled { message_id: String, title: String },
    /// Non-persisted error for live observers (persisted errors arrive as events).
    Error { message: String },
    /// The session is gone. No further notifications follow.
    Closed { reason: String },
}

impl Notification {
    /// Sequence number carried by event notifications.
    #[must_use]
    pub const fn seq(&self) -> Option<Seq> {
        match self {
            Self::Event(e) => Some(e.seq),
            _ => None,
        }
    }
}

/// The observer fell behind and was disconnected.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Observer {0} overflowed its delivery queue and must resync")]
pub struct ObserverOverflow(pub ObserverId);

struct Slot {
    tx: mpsc::Sender<Notification>,
    overflowed: Arc<AtomicBool>,
    label: String,
}

struct Inner {
    observers: BTreeMap<ObserverId, Slot>,
    closed: bool,
}

/// Registry of live observers for one session.
pub struct ObserverHub {
    session_id: String,
    capacity: usize,
    next_id: AtomicU64,
    last_seq: AtomicU64,
    inner: RwLock<Inner>,
}

impl ObserverHub {
    /// Create a hub whose log currently ends at `last_seq`.
    #[must_use]
    pub fn new(session_id: impl Into<String>, capacity: usize, last_seq: Seq) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            last_seq: AtomicU64::new(last_seq),
            inner: RwLock::new(Inner {
                observers: BTreeMap::new(),
                closed: false,
            }),
        })
    }

    /// Register a new observer.
    ///
    /// The returned subscription receives every notification broadcast after
    /// this call, in order. `attached_at` is the last sequence number that was
    /// broadcast before the observer joined; anything up to it must come from
    /// the log.
    ///
    /// Attaching to a closed hub yields a subscription that immediately sees
    /// the end of the stream.
    #[must_use]
    pub fn attach(self: &Arc<Self>, label: impl Into<String>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let overflowed = Arc::new(AtomicBool::new(false));
        let label = label.into();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        // Read under the write lock: no broadcast can interleave.
        let attached_at = self.last_seq.load(Ordering::Acquire);
        if inner.closed {
            drop(tx);
        } else {
            tracing::debug!(session_id = %self.session_id, observer_id = id, %label, "Observer attached");
            inner.observers.insert(
                id,
                Slot {
                    tx,
                    overflowed: overflowed.clone(),
                    label,
                },
            );
        }

        Subscription {
            id,
            attached_at,
            rx,
            overflowed,
            hub: Arc::downgrade(self),
        }
    }

    /// Remove an observer. Idempotent; safe after close.
    pub fn detach(&self, id: ObserverId) {
        let removed = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .remove(&id);
        if removed.is_some() {
            tracing::debug!(session_id = %self.session_id, observer_id = id, "Observer detached");
        }
    }

    /// Deliver a notification to every attached observer without waiting.
    pub fn broadcast(&self, notification: Notification) {
        let mut dead = Vec::new();
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if inner.closed {
                return;
            }
            if let Some(seq) = notification.seq() {
                self.last_seq.fetch_max(seq, Ordering::AcqRel);
            }
            for (id, slot) in &inner.observers {
                if slot.overflowed.load(Ordering::Acquire) {
                    continue;
                }
                match slot.tx.try_send(notification.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        slot.overflowed.store(true, Ordering::Release);
                        tracing::warn!(
                            session_id = %self.session_id,
                            observer_id = id,
                            label = %slot.label,
                            "Observer queue full, disconnecting"
                        );
                        dead.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            for id in dead {
                inner.observers.remove(&id);
            }
        }
    }

    /// Send a final `Closed` notification and drop every observer.
    pub fn close(&self, reason: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return;
        }
        inner.closed = true;
        for slot in inner.observers.values() {
            // A full queue still ends the stream once the sender is dropped.
            let _ = slot.tx.try_send(Notification::Closed {
                reason: reason.to_string(),
            });
        }
        inner.observers.clear();
        tracing::debug!(session_id = %self.session_id, %reason, "Observer hub closed");
    }

    /// Number of attached observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .len()
    }

    /// Highest sequence number broadcast so far.
    #[must_use]
    pub fn last_seq(&self) -> Seq {
        self.last_seq.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).closed
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Receiving side of an attached observer.
///
/// Dropping the subscription detaches it. The hub only keeps the sending half
/// of the queue, so it never keeps a dead connection alive.
pub struct Subscription {
    id: ObserverId,
    attached_at: Seq,
    rx: mpsc::Receiver<Notification>,
    overflowed: Arc<AtomicBool>,
    hub: Weak<ObserverHub>,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> ObserverId {
        self.id
    }

    /// Last sequence number broadcast before this observer was attached.
    #[must_use]
    pub const fn attached_at(&self) -> Seq {
        self.attached_at
    }

    /// Wait for the next notification. `Ok(None)` means the session closed.
    ///
    /// # Errors
    /// Returns [`ObserverOverflow`] once the observer has been disconnected for
    /// falling behind. Queued notifications are discarded in that case.
    pub async fn recv(&mut self) -> Result<Option<Notification>, ObserverOverflow> {
        if self.overflowed.load(Ordering::Acquire) {
            return Err(ObserverOverflow(self.id));
        }
        Ok(self.rx.recv().await)
    }

    /// Non-blocking variant of [`Self::recv`]. `Ok(None)` means nothing is queued.
    ///
    /// # Errors
    /// Returns [`ObserverOverflow`] if the observer was disconnected.
    pub fn try_recv(&mut self) -> Result<Option<Notification>, ObserverOverflow> {
        if self.overflowed.load(Ordering::Acquire) {
            return Err(ObserverOverflow(self.id));
        }
        Ok(self.rx.try_recv().ok())
    }

    /// Explicitly detach. Also happens on drop.
    pub fn detach(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.detach(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::event::EventPayload;

    fn event(seq: Seq) -> Notification {
        Notification::Event(
            EventPayload::agent_message(format!("msg {seq}"))
                .into_event(seq, Utc::now())
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_fan_out_isolation() {
        let hub = ObserverHub::new("s1", 16, 0);
        let mut a = hub.attach("a");
        let mut b = hub.attach("b");

        hub.broadcast(event(1));
        assert_eq!(a.recv().await.unwrap().unwrap().seq(), Some(1));
        assert_eq!(b.recv().await.unwrap().unwrap().seq(), Some(1));

        b.detach();
        hub.broadcast(event(2));
        assert_eq!(a.recv().await.unwrap().unwrap().seq(), Some(2));
        assert!(b.try_recv().unwrap().is_none());
        assert_eq!(hub.observer_count(), 1);
    }

    #[test]
    fn test_detach_is_idempotent() {
        let hub = ObserverHub::new("s1", 4, 0);
        let sub = hub.attach("a");
        hub.detach(sub.id());
        hub.detach(sub.id());
        hub.close("done");
        hub.detach(sub.id());
        drop(sub);
        assert_eq!(hub.observer_count(), 0);
    }

    #[test]
    fn test_attached_at_tracks_broadcasts() {
        let hub = ObserverHub::new("s1", 4, 3);
        assert_eq!(hub.attach("a").attached_at(), 3);
        hub.broadcast(event(4));
        assert_eq!(hub.attach("b").attached_at(), 4);
    }

    #[tokio::test]
    async fn test_overflow_disconnects_only_slow_observer() {
        let hub = ObserverHub::new("s1", 2, 0);
        let mut slow = hub.attach("slow");
        let mut fast = hub.attach("fast");

        for seq in 1..=3 {
            hub.broadcast(event(seq));
            assert_eq!(fast.recv().await.unwrap().unwrap().seq(), Some(seq));
        }

        assert_eq!(slow.recv().await, Err(ObserverOverflow(slow.id())));
        assert_eq!(hub.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let hub = ObserverHub::new("s1", 4, 0);
        let mut sub = hub.attach("a");
        hub.close("user_close");

        assert!(matches!(
            sub.recv().await.unwrap(),
            Some(Notification::Closed { ref reason }) if reason == "user_close"
        ));
        assert!(sub.recv().await.unwrap().is_none());

        let mut late = hub.attach("late");
        assert!(late.recv().await.unwrap().is_none());
    }

    #[test]
    fn test_broadcast_wakes_waiting_observer() {
        let hub = ObserverHub::new("s1", 4, 0);
        let mut sub = hub.attach("a");
        let mut recv = tokio_test::task::spawn(sub.recv());

        tokio_test::assert_pending!(recv.poll());
        hub.broadcast(event(1));
        assert!(recv.is_woken());
        let received = tokio_test::assert_ready_ok!(recv.poll());
        assert_eq!(received.and_then(|n| n.seq()), Some(1));
    }

    #[test]
    fn test_dropped_subscription_detaches() {
        let hub = ObserverHub::new("s1", 4, 0);
        {
            let _sub = hub.attach("a");
            assert_eq!(hub.observer_count(), 1);
        }
        assert_eq!(hub.observer_count(), 0);
    }
}
