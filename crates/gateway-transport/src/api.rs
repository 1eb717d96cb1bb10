//! HTTP session API and router assembly.

use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{StreamExt, TryStreamExt};
use gateway_core::{Event, OriginGuard, Seq};
use gateway_session::{
    ManagerError, Metadata, SessionError, SessionManager, StoreError, ValidationReport,
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::{defense, websocket};

/// Maximum events returned by one `/events` request.
const MAX_EVENTS_PAGE: usize = 1000;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub guard: Arc<dyn OriginGuard>,
}

/// Error returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::Manager(ManagerError::NotFound(_)) | Self::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Manager(ManagerError::Archived(_) | ManagerError::Store(StoreError::SessionBusy { .. }))
            | Self::Store(StoreError::SessionBusy { .. })
            | Self::Session(SessionError::InvalidState { .. }) => StatusCode::CONFLICT,
            Self::Manager(ManagerError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Manager(ManagerError::Session(SessionError::Agent(_))) | Self::Session(SessionError::Agent(_)) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Session(SessionError::Closed) => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the full HTTP + WebSocket router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(resolve_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/events", get(session_events))
        .route("/api/sessions/{id}/close", post(close_session))
        .route("/api/sessions/{id}/archive", post(archive_session))
        .route("/api/sessions/{id}/validate", get(validate_session))
        .route("/api/sessions/{id}/ws", get(websocket::session_socket))
        .route("/api/ws", get(websocket::workspace_socket))
        .layer(middleware::from_fn_with_state(state.clone(), defense::guard_origin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<Metadata>>, ApiError> {
    Ok(Json(state.manager.list().await?))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    working_dir: PathBuf,
    #[serde(default)]
    agent_server: Option<String>,
}

async fn resolve_session(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Metadata>, ApiError> {
    let session = state
        .manager
        .resolve(&request.working_dir, request.agent_server.as_deref())
        .await?;
    Ok(Json(session.metadata().await?))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Metadata>, ApiError> {
    Ok(Json(state.manager.metadata(&id).await?))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after: Seq,
    #[serde(default)]
    limit: Option<usize>,
}

async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let handle = state.manager.store().open(&id).await?;
    let limit = query.limit.unwrap_or(MAX_EVENTS_PAGE).min(MAX_EVENTS_PAGE);
    let events: Vec<Event> = handle.read_from(query.after).await?.take(limit).try_collect().await?;
    Ok(Json(events))
}

async fn close_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.manager.close_session(&id, "user_close").await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn archive_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Metadata>, ApiError> {
    Ok(Json(state.manager.archive_session(&id).await?))
}

async fn validate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ValidationReport>, ApiError> {
    Ok(Json(state.manager.validate(&id).await?))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::{
        body::{Body, to_bytes},
        extract::ConnectInfo,
        http::{Method, Request},
    };
    use gateway_agent::MockAgent;
    use gateway_session::{SessionConfig, SessionStore};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::defense::StaticBlocklist;

    async fn app(dir: &tempfile::TempDir, blocked: &[&str]) -> Router {
        let store = SessionStore::open_dir(dir.path().join("sessions")).await.unwrap();
        let manager = SessionManager::new(store, Arc::new(MockAgent::new()), SessionConfig::default());
        router(AppState {
            manager: Arc::new(manager),
            guard: Arc::new(StaticBlocklist::new(blocked.iter().map(|ip| ip.parse().unwrap()))),
        })
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let mut request = request.body(body).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, &[]).await;
        let workspace = dir.path().to_string_lossy().into_owned();

        let (status, created) = call(
            &app,
            Method::POST,
            "/api/sessions",
            Some(json!({ "working_dir": workspace, "agent_server": "mock" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["status"], "idle");
        let id = created["id"].as_str().unwrap().to_string();

        let (_, again) = call(
            &app,
            Method::POST,
            "/api/sessions",
            Some(json!({ "working_dir": workspace, "agent_server": "mock" })),
        )
        .await;
        assert_eq!(again["id"], id.as_str());

        let (status, listed) = call(&app, Method::GET, "/api/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, events) = call(&app, Method::GET, &format!("/api/sessions/{id}/events?after=0"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(events[0]["type"], "session_start");

        let (status, _) = call(&app, Method::POST, &format!("/api/sessions/{id}/close"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, meta) = call(&app, Method::GET, &format!("/api/sessions/{id}"), None).await;
        assert_eq!(meta["status"], "closed");

        let (status, report) = call(&app, Method::GET, &format!("/api/sessions/{id}/validate"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["issues"], json!([]));
        assert_eq!(report["last_seq"], 2);

        let (status, archived) = call(&app, Method::POST, &format!("/api/sessions/{id}/archive"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(archived["status"], "archived");
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, &[]).await;
        let (status, body) = call(&app, Method::GET, "/api/sessions/20240101-000000-deadbeef", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_blocked_origin_never_reaches_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, &["127.0.0.1"]).await;
        let (status, _) = call(
            &app,
            Method::POST,
            "/api/sessions",
            Some(json!({ "working_dir": "/tmp", "agent_server": "mock" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(std::fs::read_dir(dir.path().join("sessions")).unwrap().next().is_none());
    }
}
