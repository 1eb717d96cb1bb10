//! One live session: the state machine between the agent connection, the
//! event log and the observers.
//!
//! ```text
//! Created -> Idle <-> Prompting -> Closing -> Closed
//! ```
//!
//! Every event goes through [`BackgroundSession::persist`], which appends to
//! the log and broadcasts while holding the writer lock. Observers therefore
//! see events in sequence order, and never before they are durable.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Instant,
};

use futures::StreamExt;
use gateway_core::{
    AgentConnection, AgentConnector, AgentError, AgentNotification, AgentRequest, Event,
    EventPayload, ExecutionContext, HookError, HookErrorPolicy, MessageHook, Notification,
    NotificationStream, ObserverHub, PermissionOutcome, PermissionRequest, QueueAction, Seq,
    Subscription,
    event::{
        PermissionData, PlanData, SessionEndData, SessionStartData, TextData, ToolCallData,
        ToolCallUpdateData, UserPromptData,
    },
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::{SessionConfig, TITLE_MAX_CHARS},
    storage::{
        MessageQueue, Metadata, QueuedMessage, SessionHandle, SessionState, SessionWriter,
        StoreError, derive_title,
    },
};

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Unknown permission request: {0}")]
    UnknownPermission(String),
    #[error("Unknown option {option_id} for permission request {request_id}")]
    UnknownPermissionOption { request_id: String, option_id: String },
    #[error("Session is closed")]
    Closed,
}

/// Acknowledgment of an accepted prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptAck {
    /// Sequence number of the persisted `user_prompt` event.
    pub seq: Seq,
    pub prompt_id: Option<String>,
}

/// Everything needed to bring a session to life.
pub struct SessionParams {
    /// Writer for the session, lock already held.
    pub writer: SessionWriter,
    pub connector: Arc<dyn AgentConnector>,
    pub hooks: Vec<Arc<dyn MessageHook>>,
    pub config: Arc<SessionConfig>,
    /// Parent cancellation signal (process shutdown).
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
    /// Whether the session was just created and needs a `session_start` event.
    pub fresh: bool,
}

/// A live session.
pub struct BackgroundSession {
    id: String,
    ctx: ExecutionContext,
    handle: SessionHandle,
    hub: Arc<ObserverHub>,
    writer: Mutex<Option<SessionWriter>>,
    queue: MessageQueue,
    state: watch::Sender<SessionState>,
    connection: Arc<dyn AgentConnection>,
    hooks: Vec<Arc<dyn MessageHook>>,
    auto_approve: bool,
    pending: StdMutex<HashMap<String, PermissionRequest>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    last_activity: StdMutex<Instant>,
}

impl BackgroundSession {
    /// Connect the agent and start driving the session.
    ///
    /// On failure the writer lock is released before returning.
    ///
    /// # Errors
    /// Returns error if the agent cannot be connected or the log written.
    pub async fn start(params: SessionParams) -> Result<Arc<Self>, SessionError> {
        let SessionParams {
            mut writer,
            connector,
            hooks,
            config,
            shutdown,
            tasks,
            fresh,
        } = params;

        let meta = writer.metadata().clone();
        let ctx = ExecutionContext::new(meta.id.clone(), meta.working_dir.clone(), meta.agent_server.clone());

        let channel = match connector.connect(&ctx).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(session_id = %ctx.session_id, "Failed to connect agent: {e}");
                release_quietly(writer).await;
                return Err(e.into());
            }
        };

        let prepared = async {
            if fresh {
                writer
                    .append(EventPayload::SessionStart(SessionStartData {
                        session_id: meta.id.clone(),
                        agent_server: meta.agent_server.clone(),
                        working_dir: meta.working_dir.display().to_string(),
                    }))
                    .await?;
            }
            writer.update_metadata(|m| m.status = SessionState::Idle).await
        }
        .await;
        if let Err(e) = prepared {
            channel.connection.close().await;
            release_quietly(writer).await;
            return Err(e.into());
        }

        let cancel = shutdown.child_token();
        let heartbeat = writer.keep_alive(cancel.clone());
        let session = Arc::new(Self {
            id: meta.id.clone(),
            handle: writer.handle().clone(),
            hub: ObserverHub::new(meta.id.clone(), config.observer_queue_capacity, writer.last_seq()),
            queue: writer.handle().queue(config.max_queue_size),
            writer: Mutex::new(Some(writer)),
            state: watch::channel(SessionState::Created).0,
            connection: channel.connection,
            hooks,
            auto_approve: config.auto_approves(&meta.agent_server),
            pending: StdMutex::new(HashMap::new()),
            cancel,
            tasks,
            last_activity: StdMutex::new(Instant::now()),
            ctx,
        });

        if let Some(heartbeat) = heartbeat {
            session.tasks.spawn(heartbeat);
        }
        session.tasks.spawn(session.clone().drive(channel.notifications));
        session.state.send_replace(SessionState::Idle);
        tracing::info!(
            session_id = %session.id,
            agent_server = %session.ctx.agent_server,
            fresh,
            "Session started"
        );
        Ok(session)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Read access to the session's log.
    #[must_use]
    pub const fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    #[must_use]
    pub const fn hub(&self) -> &Arc<ObserverHub> {
        &self.hub
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Highest sequence number broadcast to observers.
    #[must_use]
    pub fn last_seq(&self) -> Seq {
        self.hub.last_seq()
    }

    /// Attach a live observer.
    #[must_use]
    pub fn attach(&self, label: impl Into<String>) -> Subscription {
        self.touch();
        self.hub.attach(label)
    }

    /// Time of the last event, prompt or attach.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Current metadata with the live state as status.
    ///
    /// # Errors
    /// Returns error if the session is no longer live and its metadata cannot be read.
    pub async fn metadata(&self) -> Result<Metadata, StoreError> {
        let cached = self.writer.lock().await.as_ref().map(|w| w.metadata().clone());
        let mut meta = match cached {
            Some(meta) => meta,
            None => self.handle.metadata().await?,
        };
        let state = self.state();
        if !matches!(state, SessionState::Created) {
            meta.status = state;
        }
        Ok(meta)
    }

    /// Permission requests waiting for a decision.
    #[must_use]
    pub fn pending_permissions(&self) -> Vec<PermissionRequest> {
        let mut pending: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        pending
    }

    /// Start a turn with `text`. Only valid while `Idle`.
    ///
    /// Message hooks run before anything is persisted; the log records the
    /// transformed message.
    ///
    /// # Errors
    /// Returns `InvalidState` unless idle, or the hook/agent/storage failure.
    pub async fn start_prompt(
        &self,
        text: impl Into<String>,
        prompt_id: Option<String>,
    ) -> Result<PromptAck, SessionError> {
        self.begin_turn("start a prompt")?;
        self.run_prompt(text.into(), prompt_id).await
    }

    /// Ask the agent to cancel the current turn. The session stays
    /// `Prompting` until the agent reports the turn as complete.
    ///
    /// # Errors
    /// Returns `InvalidState` unless prompting.
    pub async fn cancel(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Prompting {
            return Err(SessionError::InvalidState {
                operation: "cancel",
                state,
            });
        }
        if let Err(e) = self.connection.send(AgentRequest::Cancel).await {
            self.on_agent_error(e.to_string(), e.is_fatal()).await?;
            return Err(e.into());
        }
        tracing::info!(session_id = %self.id, "Cancel requested");
        Ok(())
    }

    /// Answer a pending permission request.
    ///
    /// # Errors
    /// Returns error if the request or option is unknown.
    pub async fn respond_permission(&self, request_id: &str, option_id: &str) -> Result<(), SessionError> {
        if self.state().is_terminal() {
            return Err(SessionError::Closed);
        }
        let request = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let request = pending
                .remove(request_id)
                .ok_or_else(|| SessionError::UnknownPermission(request_id.to_string()))?;
            if request.option(option_id).is_none() {
                pending.insert(request_id.to_string(), request);
                return Err(SessionError::UnknownPermissionOption {
                    request_id: request_id.to_string(),
                    option_id: option_id.to_string(),
                });
            }
            request
        };

        self.resolve_permission(
            &request,
            PermissionOutcome::Selected {
                option_id: option_id.to_string(),
            },
        )
        .await
    }

    /// Set the session title.
    ///
    /// # Errors
    /// Returns `Closed` if the session is no longer live.
    pub async fn rename(&self, title: impl Into<String>) -> Result<Metadata, SessionError> {
        let title = title.into();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::Closed)?;
        Ok(writer.update_metadata(|m| m.title = title).await?)
    }

    /// Queue a message for the next turn. If the session is idle the queue is
    /// dispatched right away.
    ///
    /// # Errors
    /// Returns `QueueFull` or a storage error.
    pub async fn enqueue(self: &Arc<Self>, message: impl Into<String>) -> Result<QueuedMessage, SessionError> {
        if self.state().is_terminal() {
            return Err(SessionError::Closed);
        }
        let entry = self.queue.add(message).await?;
        self.broadcast_queue(QueueAction::Added, Some(entry.id.clone())).await;

        let session = Arc::clone(self);
        let (id, text) = (entry.id.clone(), entry.message.clone());
        self.tasks.spawn(async move { session.title_queued(&id, &text).await });

        if self.state() == SessionState::Idle {
            self.dispatch_queue().await;
        }
        Ok(entry)
    }

    /// Remove a queued message.
    ///
    /// # Errors
    /// Returns error if the message is not queued.
    pub async fn dequeue(&self, message_id: &str) -> Result<QueuedMessage, SessionError> {
        let removed = self.queue.remove(message_id).await?;
        self.broadcast_queue(QueueAction::Removed, Some(removed.id.clone())).await;
        Ok(removed)
    }

    /// # Errors
    /// Returns error if the queue cannot be read.
    pub async fn queued(&self) -> Result<Vec<QueuedMessage>, SessionError> {
        Ok(self.queue.list().await?)
    }

    /// Drop every queued message.
    ///
    /// # Errors
    /// Returns error if the queue cannot be written.
    pub async fn clear_queue(&self) -> Result<usize, SessionError> {
        let count = self.queue.clear().await?;
        self.broadcast_queue(QueueAction::Cleared, None).await;
        Ok(count)
    }

    /// Close the session: cancel any turn, append `session_end`, release the
    /// lock and notify observers. Idempotent.
    ///
    /// # Errors
    /// Returns error if `session_end` cannot be written. The session is
    /// closed regardless.
    pub async fn close(&self, reason: &str) -> Result<(), SessionError> {
        self.shut_down(reason, true).await
    }

    /// Drop the live instance without ending the session. The log and
    /// metadata stay resumable.
    ///
    /// # Errors
    /// Returns error if the metadata cannot be written.
    pub async fn suspend(&self, reason: &str) -> Result<(), SessionError> {
        self.shut_down(reason, false).await
    }

    /// Tear down a duplicate built by a losing constructor. Hands back the
    /// writer so the caller can delete what it created.
    pub(crate) async fn discard(&self) -> Option<SessionWriter> {
        self.state.send_replace(SessionState::Closing);
        self.cancel.cancel();
        let writer = self.writer.lock().await.take();
        self.connection.close().await;
        self.state.send_replace(SessionState::Closed);
        self.hub.close("discarded");
        tracing::debug!(session_id = %self.id, "Discarded duplicate session");
        writer
    }

    async fn shut_down(&self, reason: &str, end: bool) -> Result<(), SessionError> {
        let Some(previous) = self.begin_closing() else {
            return Ok(());
        };
        self.cancel.cancel();
        if previous == SessionState::Prompting {
            if let Err(e) = self.connection.send(AgentRequest::Cancel).await {
                tracing::debug!(session_id = %self.id, "Cancel on close failed: {e}");
            }
        }
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();

        // Waits for an in-flight append to finish.
        let writer = self.writer.lock().await.take();
        let mut result = Ok(());
        if let Some(mut writer) = writer {
            if end {
                let payload = EventPayload::SessionEnd(SessionEndData {
                    reason: reason.to_string(),
                    event_count: writer.last_seq() + 1,
                });
                match writer.append(payload).await {
                    Ok(event) => self.hub.broadcast(Notification::Event(event)),
                    Err(e) => {
                        self.hub.broadcast(Notification::Error {
                            message: format!("Failed to record session end: {e}"),
                        });
                        result = Err(e.into());
                    }
                }
            }
            let status = if end { SessionState::Closed } else { SessionState::Idle };
            if let Err(e) = writer.update_metadata(|m| m.status = status).await {
                tracing::warn!(session_id = %self.id, "Failed to update metadata on close: {e}");
            }
            release_quietly(writer).await;
        }

        self.connection.close().await;
        self.state.send_replace(SessionState::Closed);
        self.hub.close(reason);
        tracing::info!(session_id = %self.id, %reason, ended = end, "Session closed");
        result
    }

    /// Append and broadcast one event. A storage failure closes the session.
    async fn persist(&self, payload: EventPayload) -> Result<Event, SessionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::Closed)?;
        match writer.append(payload).await {
            Ok(event) => {
                self.hub.broadcast(Notification::Event(event.clone()));
                drop(guard);
                self.touch();
                Ok(event)
            }
            Err(e) => {
                let writer = guard.take();
                drop(guard);
                self.fail_storage(writer, &e).await;
                Err(e.into())
            }
        }
    }

    async fn fail_storage(&self, writer: Option<SessionWriter>, error: &StoreError) {
        tracing::error!(session_id = %self.id, "Storage failure, closing session: {error}");
        self.state.send_replace(SessionState::Closing);
        self.cancel.cancel();
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
        if let Some(writer) = writer {
            release_quietly(writer).await;
        }
        self.hub.broadcast(Notification::Error {
            message: format!("Storage failure: {error}"),
        });
        self.connection.close().await;
        self.state.send_replace(SessionState::Closed);
        self.hub.close("storage_failure");
    }

    fn begin_turn(&self, operation: &'static str) -> Result<(), SessionError> {
        let mut current = SessionState::Idle;
        let reserved = self.state.send_if_modified(|state| {
            current = *state;
            if *state == SessionState::Idle {
                *state = SessionState::Prompting;
                true
            } else {
                false
            }
        });
        if reserved {
            return Ok(());
        }
        if current.is_terminal() {
            Err(SessionError::Closed)
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: current,
            })
        }
    }

    fn end_turn(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Prompting {
                *state = SessionState::Idle;
                true
            } else {
                false
            }
        })
    }

    fn begin_closing(&self) -> Option<SessionState> {
        let mut previous = None;
        self.state.send_if_modified(|state| match *state {
            SessionState::Created | SessionState::Idle | SessionState::Prompting => {
                previous = Some(*state);
                *state = SessionState::Closing;
                true
            }
            _ => false,
        });
        previous
    }

    /// Second half of a prompt, once the state is `Prompting`.
    async fn run_prompt(&self, text: String, prompt_id: Option<String>) -> Result<PromptAck, SessionError> {
        let message = self.prepare_prompt(&text).await?;
        let event = self.record_prompt(&message, prompt_id.clone()).await?;
        self.deliver_prompt(message, &event).await?;
        Ok(PromptAck {
            seq: event.seq,
            prompt_id,
        })
    }

    /// Run the message hooks. Ends the turn on failure.
    async fn prepare_prompt(&self, text: &str) -> Result<String, SessionError> {
        match self.apply_hooks(text).await {
            Ok(message) => Ok(message),
            Err(e) => {
                self.end_turn();
                Err(e.into())
            }
        }
    }

    async fn record_prompt(&self, message: &str, prompt_id: Option<String>) -> Result<Event, SessionError> {
        let event = self
            .persist(EventPayload::UserPrompt(UserPromptData {
                message: message.to_string(),
                prompt_id,
            }))
            .await?;
        self.title_from_prompt(message).await;
        Ok(event)
    }

    async fn deliver_prompt(&self, message: String, event: &Event) -> Result<(), SessionError> {
        if let Err(e) = self.connection.send(AgentRequest::Prompt { text: message }).await {
            self.on_agent_error(e.to_string(), e.is_fatal()).await?;
            return Err(e.into());
        }
        tracing::debug!(session_id = %self.id, seq = event.seq, "Prompt sent");
        Ok(())
    }

    async fn apply_hooks(&self, text: &str) -> Result<String, HookError> {
        let mut message = text.to_string();
        for hook in &self.hooks {
            match hook.transform(&self.ctx, &message).await {
                Ok(transformed) => message = transformed,
                Err(e) if e.policy == HookErrorPolicy::Skip => {
                    tracing::warn!(session_id = %self.id, "{e}, continuing without it");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(message)
    }

    async fn title_from_prompt(&self, message: &str) {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return;
        };
        if !writer.metadata().title.is_empty() {
            return;
        }
        let title = derive_title(message, TITLE_MAX_CHARS);
        if title.is_empty() {
            return;
        }
        if let Err(e) = writer.update_metadata(|m| m.title = title).await {
            tracing::warn!(session_id = %self.id, "Failed to set session title: {e}");
        }
    }

    async fn drive(self: Arc<Self>, mut notifications: NotificationStream) {
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => break,
                next = notifications.next() => next,
            };

            let Some(notification) = next else {
                if matches!(self.state(), SessionState::Idle | SessionState::Prompting) {
                    tracing::warn!(session_id = %self.id, "Agent connection ended");
                    if let Err(e) = self.on_agent_error("Agent connection lost".to_string(), true).await {
                        tracing::debug!(session_id = %self.id, "Failed to record agent loss: {e}");
                    }
                }
                break;
            };

            if let Err(e) = self.handle_notification(notification).await {
                if matches!(e, SessionError::Closed | SessionError::Store(_)) {
                    break;
                }
                tracing::warn!(session_id = %self.id, "Failed to handle agent notification: {e}");
            }
        }
        tracing::debug!(session_id = %self.id, "Session driver stopped");
    }

    async fn handle_notification(&self, notification: AgentNotification) -> Result<(), SessionError> {
        match notification {
            AgentNotification::AgentMessage { text } => {
                self.persist(EventPayload::AgentMessage(TextData { text })).await?;
            }
            AgentNotification::AgentThought { text } => {
                self.persist(EventPayload::AgentThought(TextData { text })).await?;
            }
            AgentNotification::ToolCall {
                tool_call_id,
                title,
                status,
                kind,
                raw_input,
            } => {
                self.persist(EventPayload::ToolCall(ToolCallData {
                    tool_call_id,
                    title,
                    status,
                    kind,
                    raw_input,
                }))
                .await?;
            }
            AgentNotification::ToolCallUpdate {
                tool_call_id,
                status,
                title,
            } => {
                self.persist(EventPayload::ToolCallUpdate(ToolCallUpdateData {
                    tool_call_id,
                    status,
                    title,
                }))
                .await?;
            }
            AgentNotification::Plan { entries } => {
                self.persist(EventPayload::Plan(PlanData { entries })).await?;
            }
            AgentNotification::PermissionRequest(request) => self.on_permission_request(request).await?,
            AgentNotification::TurnComplete { stop_reason } => self.on_turn_complete(stop_reason).await,
            AgentNotification::Error { message, fatal } => self.on_agent_error(message, fatal).await?,
        }
        Ok(())
    }

    async fn on_permission_request(&self, request: PermissionRequest) -> Result<(), SessionError> {
        self.persist(EventPayload::Permission(PermissionData {
            request_id: request.request_id.clone(),
            title: request.title.clone(),
            options: request.options.clone(),
            outcome: None,
        }))
        .await?;

        if self.auto_approve {
            if let Some(option) = request.auto_approve_option() {
                let outcome = PermissionOutcome::AutoApproved {
                    option_id: option.option_id.clone(),
                };
                return self.resolve_permission(&request, outcome).await;
            }
        }

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.request_id.clone(), request);
        Ok(())
    }

    async fn resolve_permission(
        &self,
        request: &PermissionRequest,
        outcome: PermissionOutcome,
    ) -> Result<(), SessionError> {
        self.persist(EventPayload::Permission(PermissionData {
            request_id: request.request_id.clone(),
            title: request.title.clone(),
            options: Vec::new(),
            outcome: Some(outcome.clone()),
        }))
        .await?;

        let response = AgentRequest::PermissionResponse {
            request_id: request.request_id.clone(),
            outcome,
        };
        if let Err(e) = self.connection.send(response).await {
            self.on_agent_error(e.to_string(), e.is_fatal()).await?;
            return Err(e.into());
        }
        Ok(())
    }

    async fn on_turn_complete(&self, stop_reason: Option<String>) {
        if !self.end_turn() {
            tracing::debug!(session_id = %self.id, state = %self.state(), "Ignoring turn completion");
            return;
        }
        tracing::debug!(session_id = %self.id, ?stop_reason, "Turn complete");
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.hub.broadcast(Notification::PromptComplete {
            last_seq: self.last_seq(),
        });
        self.dispatch_queue().await;
    }

    /// Record an agent error. Fatal errors close the session, recoverable
    /// ones end the current turn.
    async fn on_agent_error(&self, message: String, fatal: bool) -> Result<(), SessionError> {
        tracing::warn!(session_id = %self.id, fatal, "Agent error: {message}");
        self.persist(EventPayload::error(message)).await?;
        if fatal {
            return self.close("agent_failure").await;
        }
        if self.end_turn() {
            self.hub.broadcast(Notification::PromptComplete {
                last_seq: self.last_seq(),
            });
        }
        Ok(())
    }

    /// Start the oldest queued message if the session is idle.
    async fn dispatch_queue(&self) {
        if self.begin_turn("dispatch the queue").is_err() {
            return;
        }
        let next = match self.queue.pop().await {
            Ok(Some(next)) => next,
            Ok(None) => {
                self.end_turn();
                return;
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, "Failed to read message queue: {e}");
                self.end_turn();
                return;
            }
        };
        self.broadcast_queue(QueueAction::Sent, Some(next.id.clone())).await;

        let recorded = match self.prepare_prompt(&next.message).await {
            Ok(message) => self
                .record_prompt(&message, Some(next.id.clone()))
                .await
                .map(|event| (message, event)),
            Err(e) => Err(e),
        };
        let result = match recorded {
            Ok((message, event)) => self.deliver_prompt(message, &event).await,
            Err(e) => {
                // Never reached the log: keep it at the head of the queue.
                self.requeue(next).await;
                Err(e)
            }
        };

        if let Err(e) = result {
            tracing::warn!(session_id = %self.id, "Failed to send queued message: {e}");
            self.hub.broadcast(Notification::Error {
                message: format!("Failed to send queued message: {e}"),
            });
        }
    }

    async fn requeue(&self, message: QueuedMessage) {
        let id = message.id.clone();
        match self.queue.push_front(message).await {
            Ok(()) => self.broadcast_queue(QueueAction::Added, Some(id)).await,
            Err(e) => tracing::error!(session_id = %self.id, message_id = %id, "Failed to requeue message: {e}"),
        }
    }

    async fn title_queued(&self, message_id: &str, message: &str) {
        let title = derive_title(message, TITLE_MAX_CHARS);
        match self.queue.update_title(message_id, &title).await {
            Ok(true) => self.hub.broadcast(Notification::QueueTitled {
                message_id: message_id.to_string(),
                title,
            }),
            Ok(false) => {}
            Err(e) => tracing::warn!(session_id = %self.id, "Failed to title queued message: {e}"),
        }
    }

    async fn broadcast_queue(&self, action: QueueAction, message_id: Option<String>) {
        let length = self.queue.len().await.unwrap_or_default();
        self.hub.broadcast(Notification::QueueUpdated {
            length,
            action,
            message_id,
        });
    }
}

async fn release_quietly(writer: SessionWriter) {
    let id = writer.id().to_string();
    if let Err(e) = writer.release().await {
        tracing::warn!(session_id = %id, "Failed to release session lock: {e}");
    }
}
