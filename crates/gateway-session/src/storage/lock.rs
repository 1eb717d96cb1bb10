//! Advisory per-session writer lock.
//!
//! The lock is an exclusive OS file lock on the session's `.lock` file. The
//! kernel drops it when the holding process exits, so a crashed writer never
//! blocks the session. While held, the file carries a JSON record of the
//! holder whose heartbeat is refreshed periodically; a record from another
//! host counts as held until its heartbeat goes stale.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::StoreError;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

/// Heartbeat timing of session locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// How often a held lock refreshes its heartbeat.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a holder on another host is presumed gone.
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// Identity of a lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub hostname: String,
    /// Random per-process id; tells a reused pid apart from this process.
    pub instance_id: String,
}

impl LockHolder {
    /// Holder identity of the current process.
    #[must_use]
    pub fn current() -> Self {
        static CURRENT: OnceLock<LockHolder> = OnceLock::new();
        CURRENT
            .get_or_init(|| Self {
                pid: std::process::id(),
                hostname: local_hostname(),
                instance_id: uuid::Uuid::new_v4().simple().to_string(),
            })
            .clone()
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} on {}", self.pid, self.hostname)
    }
}

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder: LockHolder,
    pub acquired_at: DateTime<Utc>,
    /// Last time the holder proved it was alive.
    pub heartbeat: DateTime<Utc>,
}

impl LockInfo {
    fn new(holder: LockHolder) -> Self {
        let now = Utc::now();
        Self {
            holder,
            acquired_at: now,
            heartbeat: now,
        }
    }

    /// Whether the heartbeat is older than `stale_after` at `now`.
    #[must_use]
    pub fn is_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(stale_after).is_ok_and(|limit| now.signed_duration_since(self.heartbeat) > limit)
    }
}

/// Held lock. Dropping it releases the OS lock but leaves the record behind;
/// [`LockGuard::release`] clears the record too.
#[derive(Debug)]
pub struct LockGuard {
    file: Arc<Mutex<Option<File>>>,
    info: LockInfo,
    policy: LockPolicy,
}

impl LockGuard {
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Clear the lock record and release the lock.
    ///
    /// # Errors
    /// Returns error if the record cannot be cleared.
    pub async fn release(self) -> Result<(), StoreError> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let Some(file) = file.lock().unwrap_or_else(PoisonError::into_inner).take() else {
                return Ok(());
            };
            file.set_len(0)?;
            FileExt::unlock(&file)
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(())
    }

    /// Refresh the heartbeat every `heartbeat_interval` until `cancel` fires,
    /// the lock is released or the guard is dropped.
    pub fn keep_alive(&self, cancel: CancellationToken) -> impl Future<Output = ()> + Send + 'static {
        let file = Arc::downgrade(&self.file);
        let mut info = self.info.clone();
        let interval = self.policy.heartbeat_interval;

        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let Some(file) = file.upgrade() else {
                    break;
                };

                info.heartbeat = Utc::now();
                let record = info.clone();
                let refreshed = tokio::task::spawn_blocking(move || {
                    let guard = file.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.as_ref().map(|file| write_record(file, &record)).transpose()
                })
                .await;

                match refreshed {
                    Ok(Ok(Some(()))) => {}
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        tracing::warn!(holder = %info.holder, "Failed to refresh session lock heartbeat: {e}");
                    }
                    Err(e) => {
                        tracing::warn!(holder = %info.holder, "Session lock heartbeat task failed: {e}");
                        break;
                    }
                }
            }
        }
    }
}

/// Read the lock record, if any.
///
/// A record left by a holder that exited without releasing is reported until
/// the lock is next taken.
///
/// # Errors
/// Returns error on I/O failure. An empty or unreadable record yields `Ok(None)`.
pub async fn read_lock(path: &Path) -> Result<Option<LockInfo>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Acquire the lock at `path` for `session_id`.
///
/// # Errors
/// Returns `SessionBusy` if another writer holds the lock, or a fresh record
/// from another host is present.
pub async fn acquire(path: &Path, session_id: &str, policy: LockPolicy) -> Result<LockGuard, StoreError> {
    let path = path.to_path_buf();
    let session_id = session_id.to_string();
    tokio::task::spawn_blocking(move || try_acquire(&path, &session_id, policy))
        .await
        .map_err(std::io::Error::other)?
}

fn try_acquire(path: &Path, session_id: &str, policy: LockPolicy) -> Result<LockGuard, StoreError> {
    let me = LockHolder::current();
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    if let Err(e) = file.try_lock_exclusive() {
        if e.raw_os_error() != fs2::lock_contended_error().raw_os_error() {
            return Err(e.into());
        }
        // The holder may not have written its record yet.
        let holder = read_record(&mut file)?.map_or(me, |info| info.holder);
        return Err(StoreError::SessionBusy {
            session_id: session_id.to_string(),
            holder,
        });
    }

    if let Some(previous) = read_record(&mut file)? {
        if previous.holder.hostname != me.hostname && !previous.is_stale(policy.stale_after, Utc::now()) {
            // File locks may not reach across hosts sharing the directory.
            return Err(StoreError::SessionBusy {
                session_id: session_id.to_string(),
                holder: previous.holder,
            });
        }
        tracing::warn!(
            %session_id,
            holder = %previous.holder,
            heartbeat = %previous.heartbeat,
            "Session lock acquired over a stale record"
        );
    }

    let info = LockInfo::new(me);
    write_record(&file, &info)?;
    tracing::debug!(%session_id, "Acquired session lock");
    Ok(LockGuard {
        file: Arc::new(Mutex::new(Some(file))),
        info,
        policy,
    })
}

fn read_record(file: &mut File) -> std::io::Result<Option<LockInfo>> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)?;
    Ok(serde_json::from_slice(&bytes).ok())
}

fn write_record(mut file: &File, info: &LockInfo) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(info)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    file.set_len(bytes.len() as u64)?;
    file.sync_data()
}

fn local_hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string())
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foreign(hostname: &str, heartbeat: DateTime<Utc>) -> LockInfo {
        LockInfo {
            holder: LockHolder {
                pid: 1,
                hostname: hostname.to_string(),
                instance_id: "x".to_string(),
            },
            acquired_at: heartbeat,
            heartbeat,
        }
    }

    async fn write_lock(path: &Path, info: &LockInfo) {
        tokio::fs::write(path, serde_json::to_vec(info).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");

        let guard = acquire(&path, "s1", LockPolicy::default()).await.unwrap();
        assert_eq!(read_lock(&path).await.unwrap().as_ref(), Some(guard.info()));
        assert!(matches!(
            acquire(&path, "s1", LockPolicy::default()).await,
            Err(StoreError::SessionBusy { .. })
        ));

        tokio_test::assert_ok!(guard.release().await);
        assert!(read_lock(&path).await.unwrap().is_none());
        tokio_test::assert_ok!(acquire(&path, "s1", LockPolicy::default()).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_acquire_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join(".lock"));

        for _ in 0..50 {
            let barrier = Arc::new(tokio::sync::Barrier::new(8));
            let attempts: Vec<_> = (0..8)
                .map(|_| {
                    let path = Arc::clone(&path);
                    let barrier = Arc::clone(&barrier);
                    tokio::spawn(async move {
                        barrier.wait().await;
                        acquire(&path, "s1", LockPolicy::default()).await
                    })
                })
                .collect();

            let mut winners = Vec::new();
            for attempt in attempts {
                match attempt.await.unwrap() {
                    Ok(guard) => winners.push(guard),
                    Err(StoreError::SessionBusy { .. }) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            assert_eq!(winners.len(), 1);
            winners.pop().unwrap().release().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        {
            let _guard = acquire(&path, "s1", LockPolicy::default()).await.unwrap();
        }
        // The record outlives the guard, the lock does not.
        assert!(read_lock(&path).await.unwrap().is_some());
        let guard = acquire(&path, "s1", LockPolicy::default()).await.unwrap();
        assert_eq!(guard.info().holder, LockHolder::current());
    }

    #[tokio::test]
    async fn test_record_from_this_host_without_lock_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let crashed = foreign(&LockHolder::current().hostname, Utc::now());
        write_lock(&path, &crashed).await;

        let guard = acquire(&path, "s1", LockPolicy::default()).await.unwrap();
        assert_eq!(guard.info().holder, LockHolder::current());
    }

    #[tokio::test]
    async fn test_other_host_is_busy_until_heartbeat_goes_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");

        write_lock(&path, &foreign("elsewhere.example", Utc::now())).await;
        assert!(matches!(
            acquire(&path, "s1", LockPolicy::default()).await,
            Err(StoreError::SessionBusy { holder, .. }) if holder.hostname == "elsewhere.example"
        ));

        let silent = Utc::now() - chrono::Duration::seconds(120);
        write_lock(&path, &foreign("elsewhere.example", silent)).await;
        let guard = acquire(&path, "s1", LockPolicy::default()).await.unwrap();
        assert_eq!(guard.info().holder, LockHolder::current());
    }

    #[tokio::test]
    async fn test_keep_alive_refreshes_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let policy = LockPolicy {
            heartbeat_interval: Duration::from_millis(20),
            stale_after: Duration::from_millis(200),
        };

        let guard = acquire(&path, "s1", policy).await.unwrap();
        let cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(guard.keep_alive(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(120)).await;
        let record = read_lock(&path).await.unwrap().unwrap();
        assert!(record.heartbeat > guard.info().acquired_at);
        assert_eq!(record.acquired_at, guard.info().acquired_at);

        cancel.cancel();
        heartbeat.await.unwrap();
        guard.release().await.unwrap();
        assert!(read_lock(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keep_alive_stops_when_guard_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let policy = LockPolicy {
            heartbeat_interval: Duration::from_millis(10),
            ..LockPolicy::default()
        };

        let guard = acquire(&path, "s1", policy).await.unwrap();
        let heartbeat = tokio::spawn(guard.keep_alive(CancellationToken::new()));
        guard.release().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), heartbeat).await.unwrap().unwrap();
        assert!(read_lock(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(acquire(&path, "s1", LockPolicy::default()).await.is_ok());
    }
}
