//! HTTP server implementation using Axum.

use crate::dispatch::{CommandRequest, CommandResult};
use crate::error::TerminalError;
use crate::executor::{Executor, RunConfig};
use crate::remote::{ConnectionStatus, SshAuth, SshTarget};
use crate::state::{AppState, Session, SessionStore, DEFAULT_SESSION_ID};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, Instrument};

// Request/Response types
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalRequest {
    command: Option<String>,
    session_id: Option<String>,
    cwd: Option<String>,
}

#[derive(Serialize)]
struct TerminalResponse {
    #[serde(flatten)]
    result: CommandResult,
    command: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TerminalRejection {
    #[serde(skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    error: String,
    output: String,
    exit_code: i32,
    cwd: String,
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum SshRequest {
    Connect(ConnectRequest),
    Execute(ExecuteRequest),
    Disconnect(SessionRef),
    Status(SessionRef),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest {
    session_id: Option<String>,
    host: Option<String>,
    #[serde(default = "default_ssh_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    private_key: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest {
    session_id: Option<String>,
    command: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRef {
    session_id: Option<String>,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct SshResponse {
    status: Option<ConnectionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionInfo {
    id: String,
    cwd: String,
    env_vars: usize,
    age_secs: u64,
    idle_secs: u64,
}

fn session_id_or_default(id: Option<String>) -> String {
    id.filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string())
}

/// Build the router with every route and layer.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Terminal
        .route("/api/terminal", post(run_terminal_command))
        // Remote execution
        .route("/api/ssh", post(ssh_action))
        // Session inspection
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session))
        // Health check
        .route("/health", get(health))
        .with_state(state)
        .layer(CatchPanicLayer::custom(internal_error))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically evict sessions idle for longer than `ttl`.
fn spawn_session_sweeper(
    sessions: Arc<SessionStore>,
    ttl: Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval(every);
        loop {
            interval.tick().await;
            let removed = sessions.cleanup_expired(ttl).await;
            if removed > 0 {
                let remaining = sessions.len().await;
                info!(removed, remaining, "Evicted idle sessions");
            }
        }
    })
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    if let Some(ttl) = state.config.session_ttl {
        spawn_session_sweeper(state.sessions.clone(), ttl, SWEEP_INTERVAL);
    }

    info!(root = ?state.config.project_root, "Serving project");
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn health() -> &'static str {
    "OK"
}

async fn run_terminal_command(
    State(state): State<AppState>,
    Json(req): Json<TerminalRequest>,
) -> Response {
    let session_id = session_id_or_default(req.session_id);
    let command = req.command.unwrap_or_default();
    let cwd = req.cwd;
    let span = info_span!("terminal", request_id = %uuid::Uuid::new_v4(), session = %session_id);

    async move {
        info!(command = %command, "POST /api/terminal");
        let dispatched = state
            .dispatcher
            .dispatch(CommandRequest {
                session_id,
                command: command.clone(),
                cwd,
            })
            .await;

        match dispatched {
            Ok(result) => {
                info!(exit_code = result.exit_code, cwd = %result.cwd, "Command completed");
                Json(TerminalResponse { result, command }).into_response()
            }
            Err(rejection) => {
                let (status, success) = match rejection.error {
                    TerminalError::InvalidCommand => (StatusCode::BAD_REQUEST, None),
                    _ => (StatusCode::OK, Some(false)),
                };
                let body = TerminalRejection {
                    success,
                    error: rejection.error.to_string(),
                    output: String::new(),
                    exit_code: rejection.error.exit_code(),
                    cwd: rejection.cwd,
                };
                (status, Json(body)).into_response()
            }
        }
    }
    .instrument(span)
    .await
}

async fn ssh_action(State(state): State<AppState>, Json(req): Json<SshRequest>) -> Response {
    match req {
        SshRequest::Connect(req) => ssh_connect(&state, req).await,
        SshRequest::Execute(req) => ssh_execute(&state, req).await,
        SshRequest::Disconnect(req) => {
            let session_id = session_id_or_default(req.session_id);
            match state.remote.disconnect(&session_id).await {
                Ok(status) => ssh_ok(SshResponse {
                    status: Some(status),
                    message: Some("Disconnected".to_string()),
                    ..Default::default()
                }),
                Err(e) => ssh_error(&state, &session_id, e).await,
            }
        }
        SshRequest::Status(req) => {
            let session_id = session_id_or_default(req.session_id);
            ssh_ok(SshResponse {
                status: Some(state.remote.status(&session_id).await),
                ..Default::default()
            })
        }
    }
}

async fn ssh_connect(state: &AppState, req: ConnectRequest) -> Response {
    let session_id = session_id_or_default(req.session_id);
    let auth = match (req.private_key, req.password) {
        (Some(key), _) if !key.trim().is_empty() => Some(SshAuth::PrivateKey(key)),
        (_, Some(password)) => Some(SshAuth::Password(password)),
        _ => None,
    };
    let (Some(host), Some(username), Some(auth)) = (req.host, req.username, auth) else {
        return ssh_bad_request("host, username and a password or privateKey are required");
    };

    let target = SshTarget {
        host,
        port: req.port,
        username,
        auth,
    };
    let host = target.host.clone();
    match state.remote.connect(&session_id, target).await {
        Ok(status) => ssh_ok(SshResponse {
            status: Some(status),
            message: Some(format!("Connected to {}", host)),
            ..Default::default()
        }),
        Err(e) => ssh_error(state, &session_id, e).await,
    }
}

async fn ssh_execute(state: &AppState, req: ExecuteRequest) -> Response {
    let session_id = session_id_or_default(req.session_id);
    let Some(command) = req.command.filter(|c| !c.trim().is_empty()) else {
        return ssh_bad_request("No command provided");
    };

    let run = RunConfig {
        session_id: session_id.clone(),
        command,
        cwd: state.config.project_root.clone(),
        env: Arc::new(HashMap::new()),
        timeout: state.config.command_timeout,
        max_output_bytes: state.config.max_output_bytes,
    };
    match state.remote.run(run).await {
        Ok(result) => ssh_ok(SshResponse {
            status: Some(ConnectionStatus::Connected),
            output: Some(result.combined_output()),
            exit_code: Some(result.exit_code),
            ..Default::default()
        }),
        Err(e) => ssh_error(state, &session_id, e).await,
    }
}

fn ssh_ok(body: SshResponse) -> Response {
    Json(body).into_response()
}

fn ssh_bad_request(message: &str) -> Response {
    let body = SshResponse {
        error: Some(message.to_string()),
        ..Default::default()
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

async fn ssh_error(state: &AppState, session_id: &str, err: TerminalError) -> Response {
    let status_code = match err {
        TerminalError::RemoteSessionNotFound(_) => StatusCode::NOT_FOUND,
        TerminalError::InvalidCommand => StatusCode::BAD_REQUEST,
        TerminalError::DangerousCommand { .. }
        | TerminalError::Timeout { .. }
        | TerminalError::OutputTooLarge { .. }
        | TerminalError::SpawnFailure { .. } => StatusCode::OK,
        _ => StatusCode::BAD_GATEWAY,
    };
    let body = SshResponse {
        status: Some(state.remote.status(session_id).await),
        error: Some(err.to_string()),
        exit_code: Some(err.exit_code()),
        ..Default::default()
    };
    (status_code, Json(body)).into_response()
}

fn session_info(state: &AppState, session: &Session) -> SessionInfo {
    let now = Instant::now();
    SessionInfo {
        id: session.id.clone(),
        cwd: state.dispatcher.translator().to_virtual(&session.cwd),
        env_vars: session.env.len(),
        age_secs: now.duration_since(session.created_at).as_secs(),
        idle_secs: now.duration_since(session.last_used).as_secs(),
    }
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let sessions = state.sessions.list().await;
    Json(sessions.iter().map(|s| session_info(&state, s)).collect())
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, StatusCode> {
    let session = state.sessions.peek(&id).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(session_info(&state, &session)))
}

fn internal_error(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(detail, "Request handler panicked");
    let body = serde_json::json!({ "error": "Internal server error" });
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
