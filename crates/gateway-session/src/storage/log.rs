//! Append-only event log.
//!
//! [`SessionHandle`] gives read access to a session without locking it.
//! [`SessionWriter`] holds the session's writer lock and is the only way to
//! append, so there is exactly one writer per session.

use std::{
    collections::HashSet,
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};

use chrono::Utc;
use futures::{StreamExt, stream::BoxStream};
use gateway_core::{Event, EventPayload, Seq};
use serde::Serialize;
use tokio::{
    fs,
    io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, Take},
};
use tokio_util::sync::CancellationToken;

use super::{
    EVENTS_FILE, LOCK_FILE, METADATA_FILE, QUEUE_FILE, StoreError,
    lock::{self, LockGuard, LockInfo, LockPolicy},
    metadata::Metadata,
    queue::MessageQueue,
    read_json, write_json_atomic,
};

/// Lazy stream of events read from a log snapshot.
pub type EventStream = BoxStream<'static, Result<Event, StoreError>>;

/// Read access to one persisted session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    dir: PathBuf,
    lock_policy: LockPolicy,
}

impl SessionHandle {
    pub(crate) const fn new(id: String, dir: PathBuf, lock_policy: LockPolicy) -> Self {
        Self { id, dir, lock_policy }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Current metadata cache.
    ///
    /// # Errors
    /// Returns `NotFound` if the metadata file is missing.
    pub async fn metadata(&self) -> Result<Metadata, StoreError> {
        read_json(&self.metadata_path())
            .await?
            .ok_or_else(|| StoreError::NotFound(self.id.clone()))
    }

    /// Current lock record, if the session is locked.
    ///
    /// # Errors
    /// Returns error on I/O failure.
    pub async fn lock_info(&self) -> Result<Option<LockInfo>, StoreError> {
        lock::read_lock(&self.dir.join(LOCK_FILE)).await
    }

    /// Pending-message queue of this session.
    #[must_use]
    pub fn queue(&self, max_size: usize) -> MessageQueue {
        MessageQueue::new(self.dir.join(QUEUE_FILE), max_size)
    }

    /// Events with `seq > after`, in log order.
    ///
    /// The stream covers the log as it was when this call returned: events
    /// appended later are not included, and the stream can be requested again
    /// with any starting point. Malformed lines are skipped with a warning.
    ///
    /// # Errors
    /// Returns error if the log cannot be opened.
    pub async fn read_from(&self, after: Seq) -> Result<EventStream, StoreError> {
        let cursor = LogCursor::open(&self.log_path()).await?;
        let session_id = self.id.clone();

        let stream = futures::stream::try_unfold(cursor, move |cursor| {
            let session_id = session_id.clone();
            async move {
                let Some(mut cursor) = cursor else {
                    return Ok(None);
                };
                loop {
                    match cursor.next_record().await? {
                        None | Some((_, Record::Truncated)) => return Ok(None),
                        Some((_, Record::Event(event))) if event.seq <= after => {}
                        Some((_, Record::Event(event))) => return Ok(Some((event, Some(cursor)))),
                        Some((line, Record::Malformed(reason))) => {
                            tracing::warn!(%session_id, line, "Skipping malformed log record: {reason}");
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    /// The last `limit` events of the log.
    ///
    /// # Errors
    /// Returns error if the log cannot be read.
    pub async fn read_last(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let mut events = std::collections::VecDeque::with_capacity(limit.min(1024));
        let mut stream = self.read_from(0).await?;
        while let Some(event) = stream.next().await {
            if limit == 0 {
                continue;
            }
            if events.len() == limit {
                events.pop_front();
            }
            events.push_back(event?);
        }
        Ok(events.into())
    }

    /// Scan the whole log and report integrity problems.
    ///
    /// Never fails on bad records; only I/O errors abort the scan.
    ///
    /// # Errors
    /// Returns error if the log cannot be read.
    pub async fn validate(&self) -> Result<ValidationReport, StoreError> {
        let mut report = ValidationReport {
            session_id: self.id.clone(),
            lines: 0,
            events: 0,
            last_seq: 0,
            issues: Vec::new(),
        };
        let Some(mut cursor) = LogCursor::open(&self.log_path()).await? else {
            return Ok(report);
        };

        let mut seen = HashSet::new();
        while let Some((line, record)) = cursor.next_record().await? {
            report.lines = line;
            let kind = match record {
                Record::Event(event) => {
                    report.events += 1;
                    let previous = report.last_seq;
                    report.last_seq = previous.max(event.seq);
                    if event.seq == 0 || !seen.insert(event.seq) {
                        Some(IssueKind::DuplicateSeq { seq: event.seq })
                    } else if event.seq < previous {
                        Some(IssueKind::OutOfOrder {
                            previous,
                            found: event.seq,
                        })
                    } else if event.seq > previous + 1 {
                        Some(IssueKind::Gap {
                            expected: previous + 1,
                            found: event.seq,
                        })
                    } else {
                        None
                    }
                }
                Record::Malformed(reason) => Some(IssueKind::Malformed { reason }),
                Record::Truncated => Some(IssueKind::Truncated),
            };
            if let Some(kind) = kind {
                report.issues.push(ValidationIssue { line, kind });
            }
        }
        Ok(report)
    }

    /// Metadata recomputed from the log, on top of the stored identity fields.
    async fn derive_metadata(&self) -> Result<(Metadata, bool), StoreError> {
        let mut metadata = self.metadata().await?;
        metadata.reset_counters();
        let mut truncated_tail = false;

        if let Some(mut cursor) = LogCursor::open(&self.log_path()).await? {
            while let Some((_, record)) = cursor.next_record().await? {
                match record {
                    Record::Event(event) => metadata.apply(&event),
                    Record::Malformed(_) => {}
                    Record::Truncated => truncated_tail = true,
                }
            }
        }
        Ok((metadata, truncated_tail))
    }

    /// Last line of the log, read backwards from the end.
    async fn read_tail(&self) -> Result<Tail, StoreError> {
        let mut file = match fs::File::open(self.log_path()).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Tail::Empty),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(Tail::Empty);
        }

        let mut line = Vec::new();
        let mut chunk = vec![0; TAIL_CHUNK];
        let mut end = len;
        loop {
            let step = usize::try_from(end).map_or(TAIL_CHUNK, |end| end.min(TAIL_CHUNK));
            let start = end - step as u64;
            file.seek(SeekFrom::Start(start)).await?;
            file.read_exact(&mut chunk[..step]).await?;
            let mut joined = chunk[..step].to_vec();
            joined.append(&mut line);
            line = joined;

            // Skip the log's final newline, which ends the last record.
            let search = if end == len {
                if line.last() != Some(&b'\n') {
                    return Ok(Tail::Torn);
                }
                step - 1
            } else {
                step
            };
            if let Some(pos) = line[..search].iter().rposition(|&b| b == b'\n') {
                line.drain(..=pos);
                break;
            }
            if start == 0 {
                break;
            }
            end = start;
        }

        Ok(serde_json::from_slice::<Event>(&line).map_or(Tail::Unreadable, |event| Tail::Complete(event.seq)))
    }

    /// Take the session's writer lock.
    ///
    /// Checks the metadata cache against the last log record first. If they
    /// disagree (crash between log write and cache write, or a torn final
    /// record) the cache is rebuilt from the whole log.
    ///
    /// # Errors
    /// Returns `SessionBusy` if another live writer holds the lock.
    pub async fn acquire_lock(&self) -> Result<SessionWriter, StoreError> {
        let guard = lock::acquire(&self.dir.join(LOCK_FILE), &self.id, self.lock_policy).await?;
        SessionWriter::open(self.clone(), guard).await
    }
}

/// Exclusive append access to a session.
#[derive(Debug)]
pub struct SessionWriter {
    handle: SessionHandle,
    lock: Option<LockGuard>,
    file: fs::File,
    metadata: Metadata,
    failed: bool,
}

impl SessionWriter {
    async fn open(handle: SessionHandle, lock: LockGuard) -> Result<Self, StoreError> {
        let stored = handle.metadata().await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(handle.log_path())
            .await?;

        let metadata = match handle.read_tail().await? {
            Tail::Empty if stored.last_seq == 0 => stored,
            Tail::Complete(seq) if seq == stored.last_seq => stored,
            _ => {
                let (derived, truncated_tail) = handle.derive_metadata().await?;
                if truncated_tail {
                    // Terminate the torn record so the next append starts on its own line.
                    tracing::warn!(session_id = %handle.id, "Log ends with a truncated record");
                    file.write_all(b"\n").await?;
                    file.sync_data().await?;
                }
                if derived.last_seq == stored.last_seq && derived.message_count == stored.message_count {
                    stored
                } else {
                    tracing::warn!(
                        session_id = %handle.id,
                        cached = stored.last_seq,
                        log = derived.last_seq,
                        "Metadata out of date, rebuilding from log"
                    );
                    write_json_atomic(&handle.metadata_path(), &derived).await?;
                    derived
                }
            }
        };

        Ok(Self {
            handle,
            lock: Some(lock),
            file,
            metadata,
            failed: false,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.handle.id
    }

    #[must_use]
    pub const fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Sequence number of the last appended event (0 for an empty log).
    #[must_use]
    pub const fn last_seq(&self) -> Seq {
        self.metadata.last_seq
    }

    /// Append an event with the next sequence number.
    ///
    /// Returns once the record is flushed to disk and the metadata cache is
    /// updated. After a failed append the writer refuses further appends.
    ///
    /// # Errors
    /// Returns error on I/O failure, or `Closed` after an earlier failure.
    pub async fn append(&mut self, payload: EventPayload) -> Result<Event, StoreError> {
        if self.failed {
            return Err(StoreError::Closed);
        }

        let event = payload.into_event(self.metadata.last_seq + 1, Utc::now())?;
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let result = async {
            self.file.write_all(&line).await?;
            self.file.sync_data().await?;
            let mut next = self.metadata.clone();
            next.apply(&event);
            write_json_atomic(&self.handle.metadata_path(), &next).await?;
            self.metadata = next;
            Ok::<_, StoreError>(())
        }
        .await;

        if let Err(e) = result {
            self.failed = true;
            tracing::error!(session_id = %self.handle.id, seq = event.seq, "Failed to append event: {e}");
            return Err(e);
        }

        tracing::trace!(session_id = %self.handle.id, seq = event.seq, event_type = %event.kind, "Appended event");
        Ok(event)
    }

    /// Change non-derived metadata fields (title, status).
    ///
    /// # Errors
    /// Returns error if the metadata cannot be written.
    pub async fn update_metadata<F>(&mut self, f: F) -> Result<Metadata, StoreError>
    where
        F: FnOnce(&mut Metadata) + Send,
    {
        let mut next = self.metadata.clone();
        f(&mut next);
        next.last_seq = self.metadata.last_seq;
        next.message_count = self.metadata.message_count;
        next.updated_at = Utc::now();
        write_json_atomic(&self.handle.metadata_path(), &next).await?;
        self.metadata = next;
        Ok(self.metadata.clone())
    }

    /// Recompute the metadata cache by replaying the whole log.
    ///
    /// # Errors
    /// Returns error if the log cannot be read or the cache written.
    pub async fn rebuild_metadata(&mut self) -> Result<Metadata, StoreError> {
        let (mut derived, _) = self.handle.derive_metadata().await?;
        derived.title.clone_from(&self.metadata.title);
        derived.status = self.metadata.status;
        write_json_atomic(&self.handle.metadata_path(), &derived).await?;
        self.metadata = derived;
        Ok(self.metadata.clone())
    }

    /// Release the writer lock.
    ///
    /// # Errors
    /// Returns error if the lock file cannot be removed.
    pub async fn release(mut self) -> Result<(), StoreError> {
        if let Some(lock) = self.lock.take() {
            lock.release().await?;
        }
        tracing::debug!(session_id = %self.handle.id, "Released session writer");
        Ok(())
    }

    /// Heartbeat task for the writer lock; ends when `cancel` fires or the
    /// writer is released.
    pub fn keep_alive(&self, cancel: CancellationToken) -> Option<impl Future<Output = ()> + Send + 'static> {
        self.lock.as_ref().map(|lock| lock.keep_alive(cancel))
    }
}

/// Integrity report for a session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub session_id: String,
    /// Number of lines scanned.
    pub lines: usize,
    /// Number of well-formed records.
    pub events: usize,
    pub last_seq: Seq,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    /// Turn the first issue into a `Corruption` error.
    ///
    /// # Errors
    /// Returns `Corruption` if any issue was found.
    pub fn into_result(self) -> Result<Self, StoreError> {
        match self.issues.first() {
            None => Ok(self),
            Some(issue) => Err(StoreError::Corruption {
                session_id: self.session_id.clone(),
                line: issue.line,
                detail: issue.kind.to_string(),
            }),
        }
    }
}

/// One problem found by validation. Lines are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub line: usize,
    #[serde(flatten)]
    pub kind: IssueKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueKind {
    #[error("malformed record: {reason}")]
    Malformed { reason: String },
    #[error("truncated record")]
    Truncated,
    #[error("duplicate seq {seq}")]
    DuplicateSeq { seq: Seq },
    #[error("seq {found} after {previous}")]
    OutOfOrder { previous: Seq, found: Seq },
    #[error("missing seq {expected}..{found}")]
    Gap { expected: Seq, found: Seq },
}

/// Size of the blocks read when scanning back for the last record.
const TAIL_CHUNK: usize = 4096;

enum Tail {
    Empty,
    Complete(Seq),
    /// No final newline.
    Torn,
    /// The last line is not a record.
    Unreadable,
}

enum Record {
    Event(Event),
    Malformed(String),
    /// Final line without a newline: a write in progress or a torn write.
    Truncated,
}

/// Line reader over a log snapshot, bounded to the length at open time.
struct LogCursor {
    reader: BufReader<Take<fs::File>>,
    line: usize,
    buf: String,
}

impl LogCursor {
    async fn open(path: &Path) -> Result<Option<Self>, StoreError> {
        let file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        Ok(Some(Self {
            reader: BufReader::new(file.take(len)),
            line: 0,
            buf: String::new(),
        }))
    }

    async fn next_record(&mut self) -> Result<Option<(usize, Record)>, StoreError> {
        loop {
            self.buf.clear();
            let read = match self.reader.read_line(&mut self.buf).await {
                Ok(read) => read,
                Err(e) if e.kind() == ErrorKind::InvalidData => {
                    self.line += 1;
                    return Ok(Some((self.line, Record::Malformed("invalid UTF-8".to_string()))));
                }
                Err(e) => return Err(e.into()),
            };
            if read == 0 {
                return Ok(None);
            }
            self.line += 1;

            if !self.buf.ends_with('\n') {
                return Ok(Some((self.line, Record::Truncated)));
            }
            let text = self.buf.trim();
            if text.is_empty() {
                continue;
            }
            let record = match serde_json::from_str::<Event>(text) {
                Ok(event) => Record::Event(event),
                Err(e) => Record::Malformed(e.to_string()),
            };
            return Ok(Some((self.line, record)));
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::storage::{SessionStore, metadata::Metadata};

    async fn writer() -> (tempfile::TempDir, SessionStore, SessionWriter) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open_dir(dir.path()).await.unwrap();
        let writer = store.create(Metadata::new("s1", "/proj", "mock")).await.unwrap();
        (dir, store, writer)
    }

    fn seqs(events: &[Event]) -> Vec<Seq> {
        events.iter().map(|e| e.seq).collect()
    }

    #[tokio::test]
    async fn test_append_assigns_consecutive_seqs() {
        let (_dir, _store, mut writer) = writer().await;
        let mut last = 0;
        for i in 0..20 {
            let event = writer.append(EventPayload::agent_message(format!("m{i}"))).await.unwrap();
            assert_eq!(event.seq, last + 1);
            last = event.seq;
        }
        assert_eq!(writer.last_seq(), 20);
        assert_eq!(writer.metadata().message_count, 20);
    }

    #[tokio::test]
    async fn test_read_from_is_exclusive_and_snapshot() {
        let (_dir, _store, mut writer) = writer().await;
        for i in 0..5 {
            writer.append(EventPayload::agent_message(format!("m{i}"))).await.unwrap();
        }
        let handle = writer.handle().clone();

        let snapshot = handle.read_from(2).await.unwrap();
        writer.append(EventPayload::agent_message("late")).await.unwrap();
        let events: Vec<Event> = snapshot.try_collect().await.unwrap();
        assert_eq!(seqs(&events), vec![3, 4, 5]);

        // Re-invocable with another starting point.
        let again: Vec<Event> = handle.read_from(2).await.unwrap().try_collect().await.unwrap();
        assert_eq!(seqs(&again), vec![3, 4, 5, 6]);
        assert_eq!(again[..3], events[..]);
    }

    #[tokio::test]
    async fn test_round_trip_across_reopen() {
        let (_dir, store, mut writer) = writer().await;
        let prompt = writer.append(EventPayload::user_prompt("hello")).await.unwrap();
        let reply = writer.append(EventPayload::agent_message("hi there")).await.unwrap();
        writer.release().await.unwrap();

        let handle = store.open("s1").await.unwrap();
        let events: Vec<Event> = handle.read_from(0).await.unwrap().try_collect().await.unwrap();
        assert_eq!(events, vec![prompt, reply]);

        let mut writer = handle.acquire_lock().await.unwrap();
        assert_eq!(writer.append(EventPayload::agent_message("more")).await.unwrap().seq, 3);
    }

    #[tokio::test]
    async fn test_read_last() {
        let (_dir, _store, mut writer) = writer().await;
        for i in 0..10 {
            writer.append(EventPayload::agent_message(format!("m{i}"))).await.unwrap();
        }
        let last = writer.handle().read_last(3).await.unwrap();
        assert_eq!(seqs(&last), vec![8, 9, 10]);
        assert!(writer.handle().read_last(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_line_is_reported_and_skipped() {
        let (_dir, _store, mut writer) = writer().await;
        writer.append(EventPayload::user_prompt("one")).await.unwrap();
        let handle = writer.handle().clone();
        writer.release().await.unwrap();

        let log = handle.dir().join(EVENTS_FILE);
        let mut contents = fs::read_to_string(&log).await.unwrap();
        contents.push_str("{\"seq\": oops\n");
        let tail = EventPayload::agent_message("two").into_event(2, Utc::now()).unwrap();
        contents.push_str(&serde_json::to_string(&tail).unwrap());
        contents.push('\n');
        fs::write(&log, contents).await.unwrap();

        let report = handle.validate().await.unwrap();
        assert_eq!(report.events, 2);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].line, 2);
        assert!(matches!(report.issues[0].kind, IssueKind::Malformed { .. }));
        assert!(matches!(
            report.into_result(),
            Err(StoreError::Corruption { line: 2, .. })
        ));

        let events: Vec<Event> = handle.read_from(0).await.unwrap().try_collect().await.unwrap();
        assert_eq!(seqs(&events), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_validate_detects_gaps_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open_dir(dir.path()).await.unwrap();
        let handle = {
            let writer = store.create(Metadata::new("s1", "/proj", "mock")).await.unwrap();
            let handle = writer.handle().clone();
            writer.release().await.unwrap();
            handle
        };

        let mut contents = String::new();
        for seq in [1, 2, 2, 5] {
            let event = EventPayload::agent_message("x").into_event(seq, Utc::now()).unwrap();
            contents.push_str(&serde_json::to_string(&event).unwrap());
            contents.push('\n');
        }
        fs::write(handle.dir().join(EVENTS_FILE), contents).await.unwrap();

        let report = handle.validate().await.unwrap();
        let kinds: Vec<_> = report.issues.iter().map(|i| (i.line, i.kind.clone())).collect();
        assert_eq!(
            kinds,
            vec![
                (3, IssueKind::DuplicateSeq { seq: 2 }),
                (4, IssueKind::Gap { expected: 3, found: 5 }),
            ]
        );
    }

    #[tokio::test]
    async fn test_reopen_reconciles_lagging_metadata_and_torn_tail() {
        let (_dir, store, mut writer) = writer().await;
        writer.append(EventPayload::user_prompt("one")).await.unwrap();
        writer.append(EventPayload::agent_message("two")).await.unwrap();
        let handle = writer.handle().clone();
        writer.release().await.unwrap();

        // Simulate a crash after the log write but before the cache write,
        // plus a torn final record.
        let mut stale = handle.metadata().await.unwrap();
        stale.last_seq = 1;
        stale.message_count = 1;
        write_json_atomic(&handle.dir().join(METADATA_FILE), &stale).await.unwrap();
        let log = handle.dir().join(EVENTS_FILE);
        let mut contents = fs::read_to_string(&log).await.unwrap();
        contents.push_str("{\"seq\":3,\"ty");
        fs::write(&log, contents).await.unwrap();

        let mut writer = store.open("s1").await.unwrap().acquire_lock().await.unwrap();
        assert_eq!(writer.last_seq(), 2);
        assert_eq!(handle.metadata().await.unwrap().message_count, 2);

        let next = writer.append(EventPayload::agent_message("three")).await.unwrap();
        assert_eq!(next.seq, 3);
        let events: Vec<Event> = handle.read_from(0).await.unwrap().try_collect().await.unwrap();
        assert_eq!(seqs(&events), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reopen_trusts_cache_when_tail_agrees() {
        let (_dir, store, mut writer) = writer().await;
        writer.append(EventPayload::user_prompt("one")).await.unwrap();
        writer.append(EventPayload::agent_message("two")).await.unwrap();
        let handle = writer.handle().clone();
        writer.release().await.unwrap();

        // Only the last record is checked, so a count the tail cannot
        // contradict survives until an explicit rebuild.
        let mut cached = handle.metadata().await.unwrap();
        cached.message_count = 7;
        write_json_atomic(&handle.dir().join(METADATA_FILE), &cached).await.unwrap();

        let mut writer = store.open("s1").await.unwrap().acquire_lock().await.unwrap();
        assert_eq!(writer.metadata().message_count, 7);
        assert_eq!(writer.rebuild_metadata().await.unwrap().message_count, 2);
    }

    #[tokio::test]
    async fn test_tail_spans_several_chunks() {
        let (_dir, _store, mut writer) = writer().await;
        assert!(matches!(writer.handle().read_tail().await.unwrap(), Tail::Empty));

        writer.append(EventPayload::user_prompt("short")).await.unwrap();
        writer
            .append(EventPayload::agent_message("x".repeat(3 * TAIL_CHUNK)))
            .await
            .unwrap();
        assert!(matches!(writer.handle().read_tail().await.unwrap(), Tail::Complete(2)));

        let log = writer.handle().dir().join(EVENTS_FILE);
        let mut contents = fs::read_to_string(&log).await.unwrap();
        contents.push_str("{\"seq\":3");
        fs::write(&log, &contents).await.unwrap();
        assert!(matches!(writer.handle().read_tail().await.unwrap(), Tail::Torn));

        contents.push('\n');
        fs::write(&log, &contents).await.unwrap();
        assert!(matches!(writer.handle().read_tail().await.unwrap(), Tail::Unreadable));
    }

    #[tokio::test]
    async fn test_update_metadata_keeps_counters() {
        let (_dir, _store, mut writer) = writer().await;
        writer.append(EventPayload::user_prompt("one")).await.unwrap();
        let meta = writer
            .update_metadata(|m| {
                m.title = "Renamed".to_string();
                m.last_seq = 99;
            })
            .await
            .unwrap();
        assert_eq!(meta.title, "Renamed");
        assert_eq!(meta.last_seq, 1);

        let rebuilt = writer.rebuild_metadata().await.unwrap();
        assert_eq!(rebuilt.title, "Renamed");
        assert_eq!(rebuilt.last_seq, 1);
        assert_eq!(rebuilt.message_count, 1);
    }
}
