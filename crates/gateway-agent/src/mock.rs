//! Scripted in-process agent.
//!
//! Registered as the `mock` agent server, and used by tests throughout the
//! workspace. Each prompt is answered with the notifications produced by a
//! script, followed by a turn completion unless the agent is configured to
//! hold turns open.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use gateway_core::{
    AgentChannel, AgentConnection, AgentConnector, AgentError, AgentNotification, AgentRequest,
    ExecutionContext,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Script = Arc<dyn Fn(&str) -> Vec<AgentNotification> + Send + Sync>;

/// Connector producing [`MockConnection`]s.
#[derive(Clone)]
pub struct MockAgent {
    script: Script,
    hold_turns: bool,
    connect_delay: Option<Duration>,
    fail_connect: Option<AgentError>,
    connects: Arc<AtomicUsize>,
    connections: Arc<Mutex<Vec<Arc<MockConnection>>>>,
}

impl Default for MockAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAgent {
    /// Agent that echoes every prompt back as one message.
    #[must_use]
    pub fn new() -> Self {
        Self::with_script(|text| {
            vec![AgentNotification::AgentMessage {
                text: format!("Echo: {text}"),
            }]
        })
    }

    /// Agent answering each prompt with `script(prompt)`.
    #[must_use]
    pub fn with_script<F>(script: F) -> Self
    where
        F: Fn(&str) -> Vec<AgentNotification> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            hold_turns: false,
            connect_delay: None,
            fail_connect: None,
            connects: Arc::new(AtomicUsize::new(0)),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Keep turns open until [`MockConnection::complete_turn`] or a cancel.
    #[must_use]
    pub const fn holding_turns(mut self) -> Self {
        self.hold_turns = true;
        self
    }

    /// Sleep before every connect.
    #[must_use]
    pub const fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Refuse every connect with `error`.
    #[must_use]
    pub fn failing(mut self, error: AgentError) -> Self {
        self.fail_connect = Some(error);
        self
    }

    /// Number of connect calls so far, including failed ones.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections handed out so far, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recent connection.
    #[must_use]
    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

#[async_trait]
impl AgentConnector for MockAgent {
    async fn connect(&self, ctx: &ExecutionContext) -> Result<AgentChannel, AgentError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.fail_connect {
            return Err(error.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(MockConnection {
            session_id: ctx.session_id.clone(),
            script: self.script.clone(),
            hold_turns: self.hold_turns,
            tx: Mutex::new(Some(tx)),
            requests: Mutex::new(Vec::new()),
            in_turn: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(connection.clone());

        Ok(AgentChannel {
            connection,
            notifications: UnboundedReceiverStream::new(rx).boxed(),
        })
    }
}

/// One scripted agent connection.
pub struct MockConnection {
    session_id: String,
    script: Script,
    hold_turns: bool,
    tx: Mutex<Option<mpsc::UnboundedSender<AgentNotification>>>,
    requests: Mutex<Vec<AgentRequest>>,
    in_turn: AtomicBool,
    closed: AtomicBool,
}

impl MockConnection {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Prompt texts received, in order.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                AgentRequest::Prompt { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Push an arbitrary notification to the session.
    pub fn emit(&self, notification: AgentNotification) {
        if let Some(tx) = self.tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            let _ = tx.send(notification);
        }
    }

    /// Finish a held turn.
    pub fn complete_turn(&self) {
        if self.in_turn.swap(false, Ordering::SeqCst) {
            self.emit(AgentNotification::TurnComplete {
                stop_reason: Some("end_turn".to_string()),
            });
        }
    }

    /// Simulate the agent process going away: the notification stream ends.
    pub fn disconnect(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[async_trait]
impl AgentConnection for MockConnection {
    async fn send(&self, request: AgentRequest) -> Result<(), AgentError> {
        if self.is_closed() {
            return Err(AgentError::Fatal("Mock agent is closed".to_string()));
        }
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        match request {
            AgentRequest::Prompt { text } => {
                for notification in (self.script)(&text) {
                    self.emit(notification);
                }
                self.in_turn.store(true, Ordering::SeqCst);
                if !self.hold_turns {
                    self.complete_turn();
                }
            }
            AgentRequest::Cancel => {
                if self.in_turn.swap(false, Ordering::SeqCst) {
                    self.emit(AgentNotification::TurnComplete {
                        stop_reason: Some("cancelled".to_string()),
                    });
                }
            }
            AgentRequest::PermissionResponse { .. } => {}
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.disconnect();
    }
}
