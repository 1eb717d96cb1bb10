//! Durable sessions for the agent gateway.
//!
//! Provides:
//! - `SessionStore` - Per-session event log, metadata, lock and message queue
//! - `BackgroundSession` - The live state machine driving one agent connection
//! - `SessionManager` - Registry of live sessions with exactly-once construction
//! - `Resync` - Catch-up for reconnecting observers

pub mod background;
pub mod config;
pub mod manager;
pub mod storage;
pub mod sync;

pub use background::{BackgroundSession, PromptAck, SessionError, SessionParams};
pub use config::{SessionConfig, TITLE_MAX_CHARS};
pub use manager::{ManagerError, SessionKey, SessionManager};
pub use storage::{
    LockPolicy, Metadata, QueuedMessage, SessionHandle, SessionState, SessionStore, SessionWriter, StoreError,
    ValidationReport, generate_session_id,
};
pub use sync::{Resync, SyncError, SyncItem, SyncWarning};
