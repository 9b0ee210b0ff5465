//! HTTP server implementation using Axum.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path, State, WebSocketUpgrade},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::error::Error;
use crate::jobs::{JobDetail, JobSummary};
use crate::session::CreatedSession;
use crate::state::AppState;

/// Header carrying the caller identity, set by the upstream auth proxy.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Path of the language server WebSocket endpoint.
pub const BRIDGE_PATH: &str = "/lsp";

// Request/Response types
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    #[serde(flatten)]
    session: CreatedSession,
    websocket: WebsocketInfo,
}

#[derive(Serialize)]
struct WebsocketInfo {
    url: String,
    path: &'static str,
}

#[derive(Deserialize)]
struct UpdateFileRequest {
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateFileResponse {
    file_path: String,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobRequest {
    #[serde(default)]
    session_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobResponse {
    id: String,
    status: &'static str,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    active_sessions: i64,
    bridge_connections: usize,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Capacity(_) => "CAPACITY_EXCEEDED",
            Error::Validation(_) => "BAD_REQUEST",
            Error::Timeout(_) => "TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = if self.is_infrastructure() {
            error!(error_code = code, error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            debug!(error_code = code, message = %self, "Client error");
            self.to_string()
        };
        (status, Json(ErrorBody { error: message, code })).into_response()
    }
}

/// Identity of the caller.
#[derive(Debug, Clone)]
pub struct Requester {
    pub user_id: String,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Requester {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Unauthorized("Missing user identity".to_string()))?;
        Ok(Requester {
            user_id: user_id.to_string(),
        })
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Sessions
        .route("/sessions", post(create_session))
        .route("/sessions/:id", delete(close_session))
        .route("/sessions/:id/files", put(update_file))
        .route("/sessions/:id/renew", post(renew_session))
        .route("/sessions/:id/execution-jobs", get(list_session_jobs))
        // Execution jobs
        .route("/execution-jobs", post(submit_job).get(list_jobs))
        .route("/execution-jobs/:id", get(get_job))
        // Language server bridge
        .route(BRIDGE_PATH, get(lsp_socket))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given port until `shutdown` is cancelled.
pub async fn run_server(port: u16, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, Error> {
    Ok(Json(HealthResponse {
        status: "ok",
        active_sessions: state.sessions.active_count().await?,
        bridge_connections: state.bridge.registry().len(),
    }))
}

async fn create_session(
    State(state): State<AppState>,
    requester: Requester,
) -> Result<(StatusCode, Json<CreateSessionResponse>), Error> {
    let session = state.sessions.create_session(&requester.user_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session,
            websocket: WebsocketInfo {
                url: state.config.bridge.public_url.clone(),
                path: BRIDGE_PATH,
            },
        }),
    ))
}

async fn update_file(
    State(state): State<AppState>,
    requester: Requester,
    Path(id): Path<String>,
    Json(req): Json<UpdateFileRequest>,
) -> Result<Json<UpdateFileResponse>, Error> {
    let file_path = state
        .sessions
        .update_file_from_base64(&id, &requester.user_id, &req.content)
        .await?;
    Ok(Json(UpdateFileResponse { file_path }))
}

async fn renew_session(
    State(state): State<AppState>,
    requester: Requester,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, Error> {
    state.sessions.renew_session(&id, &requester.user_id).await?;
    Ok(Json(MessageResponse {
        message: "Session renewed successfully",
    }))
}

async fn close_session(
    State(state): State<AppState>,
    requester: Requester,
    Path(id): Path<String>,
) -> Result<StatusCode, Error> {
    state.sessions.close_session(&id, &requester.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_job(
    State(state): State<AppState>,
    requester: Requester,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), Error> {
    let job = state
        .executions
        .submit(&requester.user_id, &req.session_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            id: job.id,
            status: "QUEUED",
            created_at: job.created_at,
        }),
    ))
}

async fn list_jobs(
    State(state): State<AppState>,
    requester: Requester,
) -> Result<Json<Vec<JobSummary>>, Error> {
    let jobs = state.executions.list_by_user(&requester.user_id).await?;
    Ok(Json(jobs.iter().map(|j| j.summary()).collect()))
}

async fn list_session_jobs(
    State(state): State<AppState>,
    requester: Requester,
    Path(id): Path<String>,
) -> Result<Json<Vec<JobSummary>>, Error> {
    let jobs = state
        .executions
        .list_by_session(&requester.user_id, &id)
        .await?;
    Ok(Json(jobs.iter().map(|j| j.summary()).collect()))
}

async fn get_job(
    State(state): State<AppState>,
    requester: Requester,
    Path(id): Path<String>,
) -> Result<Json<JobDetail>, Error> {
    let job = state.executions.get(&requester.user_id, &id).await?;
    Ok(Json(job.detail()))
}

async fn lsp_socket(
    State(state): State<AppState>,
    requester: Requester,
    ws: WebSocketUpgrade,
) -> Response {
    let bridge = state.bridge.clone();
    ws.on_upgrade(move |socket| bridge.serve(socket, requester.user_id))
}
