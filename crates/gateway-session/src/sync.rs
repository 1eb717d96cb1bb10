//! Catch-up for reconnecting observers.
//!
//! The observer is attached to the hub *before* the log is read, so every
//! event appended from that instant arrives on the live feed. The log is
//! replayed after the client's `last_seq` up to the attach point, and the
//! live feed is deduplicated against what replay already delivered. Every
//! seq is yielded exactly once and in order.

use futures::StreamExt;
use gateway_core::{Event, Notification, ObserverOverflow, Seq, Subscription};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    background::BackgroundSession,
    storage::{EventStream, SessionHandle, StoreError},
};

/// Why a resync did not start where the client asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncWarning {
    /// The client announced a seq past the end of the log.
    ClientAhead,
}

/// One step of a resync.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncItem {
    /// Always first. `reset` means the client must drop its local history.
    Started {
        after_seq: Seq,
        reset: bool,
        warning: Option<SyncWarning>,
    },
    /// A historical event from the log.
    Replay(Event),
    /// The log is missing events. `found` is the next seq present, if any.
    Gap { expected: Seq, found: Option<Seq> },
    /// Replay is done; everything up to `last_seq` has been delivered.
    Complete { last_seq: Seq },
    /// Live traffic after the catch-up.
    Live(Notification),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Overflow(#[from] ObserverOverflow),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Replay,
    Complete,
    Live,
    Done,
}

/// A resync in progress. Drive it with [`Resync::next`].
pub struct Resync {
    session_id: String,
    subscription: Option<Subscription>,
    replay: Option<EventStream>,
    /// Highest seq handed out so far.
    cursor: Seq,
    /// Seq current at attach time; replay stops there.
    upper: Seq,
    phase: Phase,
    buffered: Option<SyncItem>,
}

impl Resync {
    /// Attach to a live session and start catching up from `last_seq`.
    ///
    /// # Errors
    /// Returns error if the log cannot be opened.
    pub async fn attach(
        session: &BackgroundSession,
        last_seq: Seq,
        label: impl Into<String>,
    ) -> Result<Self, SyncError> {
        let subscription = session.attach(label);
        let upper = subscription.attached_at();
        Self::start(session.handle(), Some(subscription), upper, last_seq).await
    }

    /// Replay a session without a live feed (archived or not loaded).
    ///
    /// # Errors
    /// Returns error if the metadata or log cannot be read.
    pub async fn replay_only(handle: &SessionHandle, last_seq: Seq) -> Result<Self, SyncError> {
        let upper = handle.metadata().await?.last_seq;
        Self::start(handle, None, upper, last_seq).await
    }

    async fn start(
        handle: &SessionHandle,
        subscription: Option<Subscription>,
        upper: Seq,
        last_seq: Seq,
    ) -> Result<Self, SyncError> {
        let (after_seq, reset, warning) = if last_seq > upper {
            tracing::warn!(
                session_id = %handle.id(),
                client_seq = last_seq,
                server_seq = upper,
                "Client is ahead of the log, forcing full resync"
            );
            (0, true, Some(SyncWarning::ClientAhead))
        } else {
            (last_seq, false, None)
        };

        let replay = if after_seq < upper {
            Some(handle.read_from(after_seq).await?)
        } else {
            None
        };
        tracing::debug!(session_id = %handle.id(), after_seq, upper, "Resync started");

        Ok(Self {
            session_id: handle.id().to_string(),
            subscription,
            replay,
            cursor: after_seq,
            upper,
            phase: Phase::Replay,
            buffered: Some(SyncItem::Started {
                after_seq,
                reset,
                warning,
            }),
        })
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Highest seq delivered so far.
    #[must_use]
    pub const fn last_seq(&self) -> Seq {
        self.cursor
    }

    /// The next item, or `None` once the session has closed (or replay is
    /// done, for replay-only resyncs). Cancel safe.
    ///
    /// # Errors
    /// Returns `Overflow` if the observer fell behind during or after replay;
    /// the client has to resync again.
    pub async fn next(&mut self) -> Result<Option<SyncItem>, SyncError> {
        loop {
            if let Some(item) = self.buffered.take() {
                return Ok(Some(item));
            }
            match self.phase {
                Phase::Replay => {
                    if let Some(item) = self.next_replayed().await? {
                        return Ok(Some(item));
                    }
                }
                Phase::Complete => {
                    self.phase = if self.subscription.is_some() {
                        Phase::Live
                    } else {
                        Phase::Done
                    };
                    return Ok(Some(SyncItem::Complete { last_seq: self.cursor }));
                }
                Phase::Live => {
                    let Some(subscription) = self.subscription.as_mut() else {
                        self.phase = Phase::Done;
                        continue;
                    };
                    match subscription.recv().await? {
                        None => self.phase = Phase::Done,
                        Some(Notification::Event(event)) => {
                            if event.seq <= self.cursor {
                                continue;
                            }
                            self.cursor = event.seq;
                            return Ok(Some(SyncItem::Live(Notification::Event(event))));
                        }
                        Some(other) => return Ok(Some(SyncItem::Live(other))),
                    }
                }
                Phase::Done => return Ok(None),
            }
        }
    }

    /// One replay step. `None` means "nothing to yield, loop again".
    async fn next_replayed(&mut self) -> Result<Option<SyncItem>, SyncError> {
        let next = match self.replay.as_mut() {
            Some(replay) => replay.next().await,
            None => None,
        };

        match next {
            Some(Ok(event)) if event.seq <= self.cursor => Ok(None),
            Some(Ok(event)) if event.seq > self.upper => Ok(self.finish_replay()),
            Some(Ok(event)) => {
                let expected = self.cursor + 1;
                self.cursor = event.seq;
                if event.seq == expected {
                    return Ok(Some(SyncItem::Replay(event)));
                }
                tracing::warn!(session_id = %self.session_id, expected, found = event.seq, "Gap in session log");
                self.buffered = Some(SyncItem::Replay(event.clone()));
                Ok(Some(SyncItem::Gap {
                    expected,
                    found: Some(event.seq),
                }))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(self.finish_replay()),
        }
    }

    fn finish_replay(&mut self) -> Option<SyncItem> {
        self.replay = None;
        self.phase = Phase::Complete;
        if self.cursor >= self.upper {
            return None;
        }
        // The log ends before the attach point.
        let expected = self.cursor + 1;
        tracing::warn!(session_id = %self.session_id, expected, upper = self.upper, "Session log ends early");
        self.cursor = self.upper;
        Some(SyncItem::Gap { expected, found: None })
    }
}
