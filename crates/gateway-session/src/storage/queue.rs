//! Persistent queue of messages waiting for the agent to become idle.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{StoreError, read_json, write_json_atomic};

/// Default maximum number of queued messages.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub message: String,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    messages: Vec<QueuedMessage>,
}

/// FIFO stored in `queue.json`. Every mutation rewrites the file atomically.
#[derive(Debug)]
pub struct MessageQueue {
    path: PathBuf,
    max_size: usize,
    lock: Mutex<()>,
}

impl MessageQueue {
    #[must_use]
    pub fn new(path: PathBuf, max_size: usize) -> Self {
        Self {
            path,
            max_size,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<QueueFile, StoreError> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    async fn save(&self, queue: &QueueFile) -> Result<(), StoreError> {
        write_json_atomic(&self.path, queue).await
    }

    /// Append a message.
    ///
    /// # Errors
    /// Returns `QueueFull` when the queue is at capacity.
    pub async fn add(&self, message: impl Into<String>) -> Result<QueuedMessage, StoreError> {
        let _guard = self.lock.lock().await;
        let mut queue = self.load().await?;
        if queue.messages.len() >= self.max_size {
            return Err(StoreError::QueueFull(self.max_size));
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        let entry = QueuedMessage {
            id: id[..12].to_string(),
            message: message.into(),
            queued_at: Utc::now(),
            title: None,
        };
        queue.messages.push(entry.clone());
        self.save(&queue).await?;
        Ok(entry)
    }

    /// All queued messages, oldest first.
    ///
    /// # Errors
    /// Returns error if the queue file cannot be read.
    pub async fn list(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.messages)
    }

    /// # Errors
    /// Returns error if the queue file cannot be read.
    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.list().await?.len())
    }

    /// # Errors
    /// Returns error if the queue file cannot be read.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Remove one message by id.
    ///
    /// # Errors
    /// Returns `QueuedMessageNotFound` if no message has that id.
    pub async fn remove(&self, id: &str) -> Result<QueuedMessage, StoreError> {
        let _guard = self.lock.lock().await;
        let mut queue = self.load().await?;
        let pos = queue
            .messages
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| StoreError::QueuedMessageNotFound(id.to_string()))?;
        let removed = queue.messages.remove(pos);
        self.save(&queue).await?;
        Ok(removed)
    }

    /// Take the oldest message.
    ///
    /// # Errors
    /// Returns error if the queue file cannot be read or written.
    pub async fn pop(&self) -> Result<Option<QueuedMessage>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut queue = self.load().await?;
        if queue.messages.is_empty() {
            return Ok(None);
        }
        let first = queue.messages.remove(0);
        self.save(&queue).await?;
        Ok(Some(first))
    }

    /// Put a taken message back at the head. It already held a slot, so the
    /// capacity is not checked.
    ///
    /// # Errors
    /// Returns error if the queue file cannot be read or written.
    pub async fn push_front(&self, message: QueuedMessage) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut queue = self.load().await?;
        queue.messages.insert(0, message);
        self.save(&queue).await
    }

    /// Set the title of a queued message. Returns false if it is gone.
    ///
    /// # Errors
    /// Returns error if the queue file cannot be read or written.
    pub async fn update_title(&self, id: &str, title: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut queue = self.load().await?;
        let Some(entry) = queue.messages.iter_mut().find(|m| m.id == id) else {
            return Ok(false);
        };
        entry.title = Some(title.to_string());
        self.save(&queue).await?;
        Ok(true)
    }

    /// Drop every message, returning how many there were.
    ///
    /// # Errors
    /// Returns error if the queue file cannot be read or written.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;
        let queue = self.load().await?;
        let count = queue.messages.len();
        if count > 0 {
            self.save(&QueueFile::default()).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(dir: &tempfile::TempDir, max: usize) -> MessageQueue {
        MessageQueue::new(dir.path().join("queue.json"), max)
    }

    #[tokio::test]
    async fn test_fifo_order_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir, 10);
        let a = q.add("first").await.unwrap();
        q.add("second").await.unwrap();

        // A second handle on the same file sees the same queue.
        let reopened = queue(&dir, 10);
        assert_eq!(reopened.len().await.unwrap(), 2);
        assert_eq!(reopened.pop().await.unwrap().unwrap(), a);
        assert_eq!(q.pop().await.unwrap().unwrap().message, "second");
        assert!(q.pop().await.unwrap().is_none());
        assert!(q.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir, 2);
        q.add("a").await.unwrap();
        q.add("b").await.unwrap();
        assert!(matches!(q.add("c").await, Err(StoreError::QueueFull(2))));
    }

    #[tokio::test]
    async fn test_push_front_goes_ahead_of_newer_messages() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir, 2);
        q.add("a").await.unwrap();
        q.add("b").await.unwrap();

        let a = q.pop().await.unwrap().unwrap();
        q.add("c").await.unwrap();
        q.push_front(a.clone()).await.unwrap();

        let messages: Vec<String> = q.list().await.unwrap().into_iter().map(|m| m.message).collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
        assert_eq!(q.pop().await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_remove_title_clear() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir, 10);
        let a = q.add("a").await.unwrap();
        let b = q.add("b").await.unwrap();

        assert!(q.update_title(&b.id, "Bee").await.unwrap());
        assert!(!q.update_title("missing", "x").await.unwrap());
        assert_eq!(q.remove(&a.id).await.unwrap().message, "a");
        assert!(matches!(
            q.remove(&a.id).await,
            Err(StoreError::QueuedMessageNotFound(_))
        ));
        assert_eq!(q.list().await.unwrap()[0].title.as_deref(), Some("Bee"));
        assert_eq!(q.clear().await.unwrap(), 1);
        assert_eq!(q.len().await.unwrap(), 0);
    }
}
