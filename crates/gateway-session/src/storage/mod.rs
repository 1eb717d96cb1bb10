//! File-backed session storage.
//!
//! One directory per session under the store's base directory:
//!
//! ```text
//! <base>/<session_id>/
//!     events.jsonl    append-only event log, one JSON record per line
//!     metadata.json   summary cache, rebuilt from the log on demand
//!     queue.json      pending messages
//!     .lock           advisory writer lock
//! ```

pub mod lock;
pub mod log;
pub mod metadata;
pub mod queue;

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use gateway_core::Seq;
use serde::Serialize;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

pub use lock::{LockGuard, LockHolder, LockInfo, LockPolicy};
pub use log::{EventStream, IssueKind, SessionHandle, SessionWriter, ValidationIssue, ValidationReport};
pub use metadata::{Metadata, SessionState, derive_title};
pub use queue::{MessageQueue, QueuedMessage};

pub(crate) const EVENTS_FILE: &str = "events.jsonl";
pub(crate) const METADATA_FILE: &str = "metadata.json";
pub(crate) const QUEUE_FILE: &str = "queue.json";
pub(crate) const LOCK_FILE: &str = ".lock";

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session already exists: {0}")]
    AlreadyExists(String),
    #[error("Session {session_id} is locked by {holder}")]
    SessionBusy { session_id: String, holder: LockHolder },
    #[error("Corrupt log for session {session_id} at line {line}: {detail}")]
    Corruption {
        session_id: String,
        line: usize,
        detail: String,
    },
    #[error("Sequence gap in session {session_id}: expected {expected}, found {found}")]
    Gap {
        session_id: String,
        expected: Seq,
        found: Seq,
    },
    #[error("Message queue is full ({0} messages)")]
    QueueFull(usize),
    #[error("Queued message not found: {0}")]
    QueuedMessageNotFound(String),
    #[error("Session writer is closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Root of all persisted sessions.
#[derive(Debug, Clone)]
pub struct SessionStore {
    base_dir: PathBuf,
    lock_policy: LockPolicy,
}

impl SessionStore {
    /// Open (and create if needed) a store rooted at `base_dir`.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created.
    pub async fn open_dir(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            lock_policy: LockPolicy::default(),
        })
    }

    /// Use `policy` for the heartbeat of every lock taken through this store.
    #[must_use]
    pub const fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    #[must_use]
    pub const fn lock_policy(&self) -> LockPolicy {
        self.lock_policy
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory of one session. Ids never contain path separators.
    #[must_use]
    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    /// Whether a session directory with metadata exists.
    pub async fn exists(&self, id: &str) -> bool {
        is_valid_id(id)
            && fs::try_exists(self.session_dir(id).join(METADATA_FILE))
                .await
                .unwrap_or(false)
    }

    /// Create a new session and take its writer lock.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if the id is taken, or an I/O error.
    pub async fn create(&self, metadata: Metadata) -> Result<SessionWriter, StoreError> {
        if !is_valid_id(&metadata.id) {
            return Err(StoreError::NotFound(metadata.id));
        }
        let dir = self.session_dir(&metadata.id);
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(metadata.id));
            }
            Err(e) => return Err(e.into()),
        }

        write_json_atomic(&dir.join(METADATA_FILE), &metadata).await?;
        tracing::info!(session_id = %metadata.id, "Created session");

        let handle = SessionHandle::new(metadata.id.clone(), dir, self.lock_policy);
        handle.acquire_lock().await
    }

    /// Open an existing session for reading.
    ///
    /// # Errors
    /// Returns `NotFound` if the session does not exist.
    pub async fn open(&self, id: &str) -> Result<SessionHandle, StoreError> {
        if !self.exists(id).await {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(SessionHandle::new(id.to_string(), self.session_dir(id), self.lock_policy))
    }

    /// Metadata of every persisted session, most recently updated first.
    /// Directories without readable metadata are skipped.
    ///
    /// # Errors
    /// Returns error if the base directory cannot be read.
    pub async fn list(&self) -> Result<Vec<Metadata>, StoreError> {
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path().join(METADATA_FILE);
            match read_json::<Metadata>(&path).await {
                Ok(Some(meta)) => sessions.push(meta),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping session with unreadable metadata: {e}");
                }
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Delete a session and everything in it.
    ///
    /// # Errors
    /// Returns `SessionBusy` if a live writer holds the session.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let handle = self.open(id).await?;
        let guard = lock::acquire(&handle.dir().join(LOCK_FILE), id, self.lock_policy).await?;
        fs::remove_dir_all(handle.dir()).await?;
        drop(guard);
        tracing::info!(session_id = %id, "Deleted session");
        Ok(())
    }

    /// Delete a session whose writer is held by the caller.
    pub(crate) async fn delete_locked(&self, writer: SessionWriter) -> Result<(), StoreError> {
        let id = writer.id().to_string();
        let dir = writer.handle().dir().to_path_buf();
        fs::remove_dir_all(&dir).await?;
        drop(writer);
        tracing::info!(session_id = %id, "Deleted session");
        Ok(())
    }
}

/// Generate a time-derived session id: `YYYYMMDD-HHMMSS-xxxxxxxx`.
#[must_use]
pub fn generate_session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Write JSON so that readers see either the old or the new file, never a mix.
pub(crate) async fn write_json_atomic<T: Serialize + Sync>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read a JSON file; a missing file is `Ok(None)`.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open_dir(dir.path().join("sessions")).await.unwrap();
        (dir, store)
    }

    #[test]
    fn test_generated_id_shape() {
        let id = generate_session_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
        assert!(is_valid_id(&id));
    }

    #[test]
    fn test_path_like_ids_are_rejected() {
        assert!(!is_valid_id(".."));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id(""));
    }

    #[tokio::test]
    async fn test_create_open_list_delete() {
        let (_dir, store) = store().await;
        let writer = store.create(Metadata::new("s1", "/proj", "mock")).await.unwrap();

        assert!(store.exists("s1").await);
        assert!(matches!(
            store.create(Metadata::new("s1", "/proj", "mock")).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(store.open("nope").await, Err(StoreError::NotFound(_))));

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "s1");

        // Held by the writer.
        assert!(matches!(store.delete("s1").await, Err(StoreError::SessionBusy { .. })));
        writer.release().await.unwrap();

        store.delete("s1").await.unwrap();
        assert!(!store.exists("s1").await);
    }

    #[tokio::test]
    async fn test_list_skips_broken_metadata() {
        let (_dir, store) = store().await;
        store
            .create(Metadata::new("good", "/proj", "mock"))
            .await
            .unwrap()
            .release()
            .await
            .unwrap();
        let broken = store.session_dir("broken");
        fs::create_dir(&broken).await.unwrap();
        fs::write(broken.join(METADATA_FILE), b"{").await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "good");
    }

    #[tokio::test]
    async fn test_atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        write_json_atomic(&path, &Metadata::new("s1", "/p", "mock")).await.unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("metadata.json")]);
    }
}
