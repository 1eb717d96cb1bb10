//! Session manager: the registry of live sessions.
//!
//! Sessions are keyed by (working directory, agent server). Resolution checks
//! the registry under a short lock, then builds the session with the lock
//! released while holding a per-key (and per-id) build gate, so concurrent
//! callers wait for the build in progress instead of starting their own.
//! Installing re-checks the registry; a build that still loses the race is
//! torn down and the winner returned.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use chrono::Utc;
use gateway_core::{AgentConnector, EventPayload, MessageHook, event::SessionEndData};
use thiserror::Error;
use tokio::{
    sync::{Mutex as AsyncMutex, OwnedMutexGuard},
    time::MissedTickBehavior,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    background::{BackgroundSession, SessionError, SessionParams},
    config::SessionConfig,
    storage::{
        Metadata, SessionHandle, SessionState, SessionStore, SessionWriter, StoreError, ValidationReport,
        generate_session_id,
    },
};

/// How often a build that hit a busy lock is retried before giving up.
const BUILD_ATTEMPTS: u32 = 5;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Session manager error.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session {0} is archived")]
    Archived(String),
    #[error("Session manager is shutting down")]
    ShuttingDown,
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Identity a session is resolved by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub working_dir: PathBuf,
    pub agent_server: String,
}

impl SessionKey {
    fn of(meta: &Metadata) -> Self {
        Self {
            working_dir: meta.working_dir.clone(),
            agent_server: meta.agent_server.clone(),
        }
    }

    fn of_context(session: &BackgroundSession) -> Self {
        let ctx = session.context();
        Self {
            working_dir: ctx.working_dir.clone(),
            agent_server: ctx.agent_server.clone(),
        }
    }
}

/// What a build gate serializes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BuildSlot {
    Key(SessionKey),
    Id(String),
}

#[derive(Default)]
struct Registry {
    live: HashMap<String, Arc<BackgroundSession>>,
    by_key: HashMap<SessionKey, String>,
    building: HashMap<BuildSlot, Arc<AsyncMutex<()>>>,
    shutting_down: bool,
}

impl Registry {
    fn live_session(&self, id: &str) -> Option<Arc<BackgroundSession>> {
        self.live
            .get(id)
            .filter(|s| !s.state().is_terminal())
            .cloned()
    }
}

/// Held while building the session for one slot. Gates nobody waits on are
/// dropped from the registry.
struct BuildGate<'a> {
    manager: &'a SessionManager,
    slot: BuildSlot,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for BuildGate<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut registry = self.manager.registry();
        if registry
            .building
            .get(&self.slot)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            registry.building.remove(&self.slot);
        }
    }
}

enum Install {
    Won(Arc<BackgroundSession>),
    Lost(Arc<BackgroundSession>),
    ShuttingDown,
}

/// Owns every live session of the process.
pub struct SessionManager {
    store: SessionStore,
    connector: Arc<dyn AgentConnector>,
    hooks: Vec<Arc<dyn MessageHook>>,
    config: Arc<SessionConfig>,
    registry: StdMutex<Registry>,
    idle_marks: StdMutex<HashMap<String, Instant>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: SessionStore, connector: Arc<dyn AgentConnector>, config: SessionConfig) -> Self {
        Self {
            store,
            connector,
            hooks: Vec::new(),
            config: Arc::new(config),
            registry: StdMutex::new(Registry::default()),
            idle_marks: StdMutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Message hooks applied, in order, to every prompt.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Vec<Arc<dyn MessageHook>>) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub const fn store(&self) -> &SessionStore {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the key index from disk so that resolving a known workspace
    /// resumes its most recent session. Sessions are started lazily.
    ///
    /// # Errors
    /// Returns error if the store cannot be listed.
    pub async fn rehydrate(&self) -> Result<usize, ManagerError> {
        let sessions = self.store.list().await?;
        let mut registry = self.registry();
        let mut count = 0;
        // Most recently updated first, so the first session per key wins.
        for meta in sessions.iter().filter(|m| m.status != SessionState::Archived) {
            registry.by_key.entry(SessionKey::of(meta)).or_insert_with(|| {
                count += 1;
                meta.id.clone()
            });
        }
        drop(registry);
        tracing::info!(sessions = sessions.len(), keys = count, "Rehydrated session index");
        Ok(count)
    }

    /// The live session for a workspace and agent server, resuming or
    /// creating one as needed. Concurrent calls for the same key all get the
    /// same instance.
    ///
    /// # Errors
    /// Returns error if the session cannot be created or its agent connected.
    pub async fn resolve(
        &self,
        working_dir: impl AsRef<Path>,
        agent_server: Option<&str>,
    ) -> Result<Arc<BackgroundSession>, ManagerError> {
        let key = SessionKey {
            working_dir: canonical_dir(working_dir.as_ref()).await,
            agent_server: agent_server.map_or_else(|| self.config.default_agent_server.clone(), ToString::to_string),
        };

        let _gate = self.build_gate(BuildSlot::Key(key.clone())).await;
        let mut attempt = 1;
        loop {
            let known = {
                let registry = self.registry();
                if registry.shutting_down {
                    return Err(ManagerError::ShuttingDown);
                }
                match registry.by_key.get(&key) {
                    Some(id) => {
                        if let Some(session) = registry.live_session(id) {
                            return Ok(session);
                        }
                        Some(id.clone())
                    }
                    None => None,
                }
            };

            let built = match &known {
                Some(id) => self.load_existing(id, Some(key.clone())).await,
                None => match self.build_new(&key).await {
                    Ok(session) => self.install(Some(key.clone()), session, true).await,
                    Err(e) => Err(e),
                },
            };
            match built {
                Ok(session) => return Ok(session),
                Err(ManagerError::Store(StoreError::SessionBusy { .. })) if attempt < BUILD_ATTEMPTS => {
                    tracing::debug!(?known, attempt, "Session busy during resolve, retrying");
                    attempt += 1;
                    tokio::time::sleep(BUSY_RETRY_DELAY).await;
                }
                Err(ManagerError::NotFound(_) | ManagerError::Archived(_)) if known.is_some() => {
                    // Stale index entry; start over with a new session.
                    let mut registry = self.registry();
                    if registry.by_key.get(&key) == known.as_ref() {
                        registry.by_key.remove(&key);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The live session with `id`, resuming it from disk if needed.
    ///
    /// # Errors
    /// Returns `NotFound`, `Archived`, or the error that prevented resuming.
    pub async fn open_session(&self, id: &str) -> Result<Arc<BackgroundSession>, ManagerError> {
        let mut attempt = 1;
        loop {
            match self.load_existing(id, None).await {
                Ok(session) => return Ok(session),
                Err(ManagerError::Store(StoreError::SessionBusy { .. })) if attempt < BUILD_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(BUSY_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The live session `id`, or build and install it from disk. Callers
    /// racing on the same id wait for the first one's build.
    async fn load_existing(&self, id: &str, key: Option<SessionKey>) -> Result<Arc<BackgroundSession>, ManagerError> {
        let _gate = self.build_gate(BuildSlot::Id(id.to_string())).await;
        {
            let registry = self.registry();
            if registry.shutting_down {
                return Err(ManagerError::ShuttingDown);
            }
            if let Some(session) = registry.live_session(id) {
                return Ok(session);
            }
        }
        let session = self.build_existing(id).await?;
        self.install(key, session, false).await
    }

    async fn build_gate(&self, slot: BuildSlot) -> BuildGate<'_> {
        let gate = Arc::clone(self.registry().building.entry(slot.clone()).or_default());
        let guard = gate.lock_owned().await;
        BuildGate {
            manager: self,
            slot,
            guard: Some(guard),
        }
    }

    /// The live session with `id`, if it is loaded.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<BackgroundSession>> {
        self.registry().live_session(id)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.registry().live.len()
    }

    /// Metadata of every session, with live state where loaded.
    ///
    /// # Errors
    /// Returns error if the store cannot be listed.
    pub async fn list(&self) -> Result<Vec<Metadata>, ManagerError> {
        let mut sessions = self.store.list().await?;
        let registry = self.registry();
        for meta in &mut sessions {
            if let Some(session) = registry.live_session(&meta.id) {
                meta.status = session.state();
            }
        }
        Ok(sessions)
    }

    /// Metadata of one session, with live state where loaded.
    ///
    /// # Errors
    /// Returns `NotFound` if no such session exists.
    pub async fn metadata(&self, id: &str) -> Result<Metadata, ManagerError> {
        if let Some(session) = self.get(id) {
            return Ok(session.metadata().await?);
        }
        Ok(self.open_handle(id).await?.metadata().await?)
    }

    /// Close a session, live or not, recording a `session_end`.
    ///
    /// # Errors
    /// Returns `NotFound`, or `SessionBusy` if another process owns it.
    pub async fn close_session(&self, id: &str, reason: &str) -> Result<(), ManagerError> {
        let live = self.registry().live.remove(id);
        if let Some(session) = live.filter(|s| !s.state().is_terminal()) {
            self.forget_idle(id);
            session.close(reason).await?;
            return Ok(());
        }

        let handle = self.open_handle(id).await?;
        let meta = handle.metadata().await?;
        if matches!(meta.status, SessionState::Closed | SessionState::Archived) {
            return Ok(());
        }
        let mut writer = handle.acquire_lock().await?;
        let result = end_stored(&mut writer, reason).await;
        release_writer(writer).await;
        result?;
        tracing::info!(session_id = %id, %reason, "Closed stored session");
        Ok(())
    }

    /// Close a session and mark it archived. Archived sessions are read-only
    /// and no longer resolved by their workspace.
    ///
    /// # Errors
    /// Returns `NotFound`, or an error if the session cannot be closed.
    pub async fn archive_session(&self, id: &str) -> Result<Metadata, ManagerError> {
        self.close_session(id, "archived").await?;

        let handle = self.open_handle(id).await?;
        let mut writer = handle.acquire_lock().await?;
        let archived = writer
            .update_metadata(|m| {
                m.status = SessionState::Archived;
                m.archived_at = Some(Utc::now());
            })
            .await;
        release_writer(writer).await;
        let meta = archived?;

        self.registry().by_key.retain(|_, session_id| session_id != id);
        tracing::info!(session_id = %id, "Archived session");
        Ok(meta)
    }

    /// Set a session's title.
    ///
    /// # Errors
    /// Returns `NotFound`, or `SessionBusy` if another process owns it.
    pub async fn rename_session(&self, id: &str, title: &str) -> Result<Metadata, ManagerError> {
        if let Some(session) = self.get(id) {
            return Ok(session.rename(title).await?);
        }
        let handle = self.open_handle(id).await?;
        let mut writer = handle.acquire_lock().await?;
        let renamed = writer.update_metadata(|m| m.title = title.to_string()).await;
        release_writer(writer).await;
        Ok(renamed?)
    }

    /// Integrity report for a session's log.
    ///
    /// # Errors
    /// Returns `NotFound` or an I/O error.
    pub async fn validate(&self, id: &str) -> Result<ValidationReport, ManagerError> {
        Ok(self.open_handle(id).await?.validate().await?)
    }

    /// Run [`SessionManager::reap_idle`] every `reap_interval` until shutdown.
    pub fn start_reaper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let mut interval = tokio::time::interval(manager.config.reap_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        manager.reap_idle().await;
                    }
                }
            }
            tracing::debug!("Idle reaper stopped");
        });
    }

    /// Evict sessions nobody is watching. A session idle for `idle_timeout`
    /// is marked, and suspended on a later pass once `reconnect_grace` has
    /// passed without an observer or activity. Returns how many were evicted.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let live: Vec<(String, Arc<BackgroundSession>)> = {
            let mut registry = self.registry();
            registry.live.retain(|_, s| !s.state().is_terminal());
            registry.live.iter().map(|(id, s)| (id.clone(), Arc::clone(s))).collect()
        };

        let mut due = Vec::new();
        {
            let mut marks = self.idle_marks.lock().unwrap_or_else(PoisonError::into_inner);
            marks.retain(|id, _| live.iter().any(|(live_id, _)| live_id == id));
            for (id, session) in live {
                if !self.is_idle(&session, now) {
                    marks.remove(&id);
                    continue;
                }
                match marks.get(&id) {
                    None => {
                        tracing::debug!(session_id = %id, "Session idle, starting reconnect grace");
                        marks.insert(id, now);
                    }
                    Some(marked) if now.duration_since(*marked) >= self.config.reconnect_grace => {
                        marks.remove(&id);
                        due.push((id, session));
                    }
                    Some(_) => {}
                }
            }
        }

        let mut evicted = 0;
        for (id, session) in due {
            let removed = {
                let mut registry = self.registry();
                let still_ours = registry.live.get(&id).is_some_and(|s| Arc::ptr_eq(s, &session));
                if still_ours && self.is_idle(&session, Instant::now()) {
                    registry.live.remove(&id);
                    true
                } else {
                    false
                }
            };
            if !removed {
                continue;
            }
            if let Err(e) = session.suspend("idle_evicted").await {
                tracing::warn!(session_id = %id, "Failed to suspend idle session: {e}");
            }
            tracing::info!(session_id = %id, "Evicted idle session");
            evicted += 1;
        }
        evicted
    }

    /// Suspend every live session and wait for all session tasks to finish.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut registry = self.registry();
            registry.shutting_down = true;
            registry.live.drain().map(|(_, s)| s).collect()
        };
        tracing::info!(sessions = sessions.len(), "Shutting down session manager");

        futures::future::join_all(sessions.iter().map(|session| async move {
            if let Err(e) = session.suspend("server_shutdown").await {
                tracing::warn!(session_id = %session.id(), "Failed to suspend session: {e}");
            }
        }))
        .await;

        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Session manager stopped");
    }

    fn is_idle(&self, session: &BackgroundSession, now: Instant) -> bool {
        session.state() == SessionState::Idle
            && session.hub().observer_count() == 0
            && now.saturating_duration_since(session.last_activity()) >= self.config.idle_timeout
    }

    fn forget_idle(&self, id: &str) {
        self.idle_marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    async fn open_handle(&self, id: &str) -> Result<SessionHandle, ManagerError> {
        self.store.open(id).await.map_err(|e| match e {
            StoreError::NotFound(id) => ManagerError::NotFound(id),
            other => other.into(),
        })
    }

    fn params(&self, writer: SessionWriter, fresh: bool) -> SessionParams {
        SessionParams {
            writer,
            connector: Arc::clone(&self.connector),
            hooks: self.hooks.clone(),
            config: Arc::clone(&self.config),
            shutdown: self.shutdown.clone(),
            tasks: self.tasks.clone(),
            fresh,
        }
    }

    async fn build_new(&self, key: &SessionKey) -> Result<Arc<BackgroundSession>, ManagerError> {
        let meta = Metadata::new(generate_session_id(), key.working_dir.clone(), key.agent_server.clone());
        let id = meta.id.clone();
        let writer = self.store.create(meta).await?;
        match BackgroundSession::start(self.params(writer, true)).await {
            Ok(session) => Ok(session),
            Err(e) => {
                if let Err(cleanup) = self.store.delete(&id).await {
                    tracing::warn!(session_id = %id, "Failed to remove unstarted session: {cleanup}");
                }
                Err(e.into())
            }
        }
    }

    async fn build_existing(&self, id: &str) -> Result<Arc<BackgroundSession>, ManagerError> {
        let handle = self.open_handle(id).await?;
        let meta = handle.metadata().await?;
        if meta.status == SessionState::Archived {
            return Err(ManagerError::Archived(id.to_string()));
        }
        let writer = handle.acquire_lock().await?;
        if meta.status == SessionState::Closed {
            tracing::info!(session_id = %id, "Resuming closed session");
        }
        Ok(BackgroundSession::start(self.params(writer, false)).await?)
    }

    async fn install(
        &self,
        key: Option<SessionKey>,
        session: Arc<BackgroundSession>,
        fresh: bool,
    ) -> Result<Arc<BackgroundSession>, ManagerError> {
        let outcome = {
            let mut registry = self.registry();
            let winner = key
                .as_ref()
                .and_then(|k| registry.by_key.get(k))
                .and_then(|id| registry.live_session(id))
                .or_else(|| registry.live_session(session.id()));

            if registry.shutting_down {
                Install::ShuttingDown
            } else if let Some(existing) = winner {
                Install::Lost(existing)
            } else {
                let id = session.id().to_string();
                let key = key.unwrap_or_else(|| SessionKey::of_context(&session));
                registry.by_key.entry(key).or_insert_with(|| id.clone());
                registry.live.insert(id, Arc::clone(&session));
                Install::Won(session.clone())
            }
        };

        match outcome {
            Install::Won(session) => Ok(session),
            Install::Lost(existing) => {
                tracing::debug!(
                    session_id = %existing.id(),
                    discarded = %session.id(),
                    "Lost construction race, using existing session"
                );
                self.dispose(&session, fresh).await;
                Ok(existing)
            }
            Install::ShuttingDown => {
                self.dispose(&session, false).await;
                Err(ManagerError::ShuttingDown)
            }
        }
    }

    async fn dispose(&self, session: &BackgroundSession, fresh: bool) {
        let Some(writer) = session.discard().await else {
            return;
        };
        if fresh {
            if let Err(e) = self.store.delete_locked(writer).await {
                tracing::warn!(session_id = %session.id(), "Failed to delete duplicate session: {e}");
            }
        } else {
            release_writer(writer).await;
        }
    }
}

async fn canonical_dir(dir: &Path) -> PathBuf {
    tokio::fs::canonicalize(dir).await.unwrap_or_else(|_| dir.to_path_buf())
}

async fn end_stored(writer: &mut SessionWriter, reason: &str) -> Result<(), StoreError> {
    let event_count = writer.last_seq() + 1;
    writer
        .append(EventPayload::SessionEnd(SessionEndData {
            reason: reason.to_string(),
            event_count,
        }))
        .await?;
    writer.update_metadata(|m| m.status = SessionState::Closed).await?;
    Ok(())
}

async fn release_writer(writer: SessionWriter) {
    let id = writer.id().to_string();
    if let Err(e) = writer.release().await {
        tracing::warn!(session_id = %id, "Failed to release session lock: {e}");
    }
}
