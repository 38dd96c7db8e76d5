//! WebSocket server + REST endpoints for the job system.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{JobAction, WsMessage};
use crate::error::JobError;
use crate::jobs::{JobManager, JobType, JobTypeInfo, TaskRequest, TaskRunner};
use crate::notifier::ChangeNotifier;
use crate::store::SessionStore;

/// Observer settings advertised to clients on `/health`.
#[derive(Debug, Clone, Copy)]
pub struct ClientHints {
    pub poll_interval: Duration,
    pub stall_threshold: Duration,
}

impl Default for ClientHints {
    fn default() -> Self {
        Self {
            poll_interval: super::poller::DEFAULT_POLL_INTERVAL,
            stall_threshold: Duration::from_secs(120),
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<TaskRunner>,
    pub notifier: Arc<ChangeNotifier>,
    pub sessions: Arc<SessionStore>,
    pub hints: ClientHints,
}

impl AppState {
    fn manager(&self) -> &JobManager {
        self.runner.manager()
    }
}

/// Build the Axum router with job WebSocket and REST routes.
pub fn job_routes(
    runner: Arc<TaskRunner>,
    notifier: Arc<ChangeNotifier>,
    sessions: Arc<SessionStore>,
    hints: ClientHints,
) -> Router {
    let state = AppState {
        runner,
        notifier,
        sessions,
        hints,
    };

    Router::new()
        .route("/ws/jobs", get(ws_handler))
        .route("/health", get(health))
        .route("/api/job-types", get(list_job_types))
        .route("/api/jobs", get(list_jobs).post(start_job))
        .route("/api/jobs/active", get(list_active_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .with_state(state)
}

/// Map a lifecycle error to an HTTP response with an `{"error": ..}` body.
fn error_response(e: JobError) -> Response {
    let status = match e {
        JobError::NotFound { .. } => StatusCode::NOT_FOUND,
        JobError::InvalidState { .. } | JobError::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => {
            error!(error = %e, "Job request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({"error": e.to_string()}))).into_response()
}

fn parse_job_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid job ID"})),
        )
            .into_response()
    })
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ai-jobs",
        "pollIntervalMs": state.hints.poll_interval.as_millis() as u64,
        "stallThresholdSecs": state.hints.stall_threshold.as_secs(),
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_json(socket: &mut WebSocket, msg: &WsMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!(error = %e, "Failed to serialize push message");
            true
        }
    }
}

/// Send a `jobs:init` snapshot. If the snapshot cannot be read the socket
/// is closed, since updates alone would leave the client without a base.
async fn send_init(socket: &mut WebSocket, manager: &JobManager) -> bool {
    match manager.list_active_jobs().await {
        Ok(jobs) => send_json(socket, &WsMessage::Init { jobs }).await,
        Err(e) => {
            warn!(error = %e, "Failed to list active jobs for init, closing socket");
            let frame = CloseFrame {
                code: close_code::ERROR,
                reason: "job snapshot unavailable".into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            false
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("WebSocket client connected");

    // Subscribe before the snapshot so nothing falls between them.
    let mut subscription = state.notifier.subscribe();

    if !send_init(&mut socket, state.manager()).await {
        warn!("Initial sync failed, dropping client");
        return;
    }

    loop {
        tokio::select! {
            // Forward debounced job changes to this client
            result = subscription.recv() => {
                match result {
                    Ok(job) => {
                        if !send_json(&mut socket, &WsMessage::Update { job }).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind job updates");
                        if !send_init(&mut socket, state.manager()).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Job notifications closed");
                        break;
                    }
                }
            }

            // Receive actions from client
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, &state).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

async fn handle_client_message(text: &str, state: &AppState) {
    match serde_json::from_str::<JobAction>(text) {
        Ok(JobAction::Cancel { job_id }) => match state.manager().cancel_job(job_id).await {
            Ok(_) => {
                info!(job_id = %job_id, "Job cancelled via WS");
                state.notifier.touch(job_id);
            }
            Err(e) => warn!(job_id = %job_id, error = %e, "Cancel failed via WS"),
        },
        Err(e) => {
            debug!(error = %e, text = text, "Unrecognized WS message from client");
        }
    }
}

// ── REST Endpoints ──────────────────────────────────────────────────────

async fn list_job_types() -> Json<Vec<JobTypeInfo>> {
    Json(JobType::ALL.into_iter().map(JobTypeInfo::from).collect())
}

async fn list_jobs(State(state): State<AppState>) -> Response {
    match state.manager().list_all_jobs().await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_active_jobs(State(state): State<AppState>) -> Response {
    match state.manager().list_active_jobs().await {
        Ok(jobs) => ([(header::CACHE_CONTROL, "no-store")], Json(jobs)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.manager().get_job(job_id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.manager().cancel_job(job_id).await {
        Ok(job) => {
            info!(job_id = %job_id, "Job cancelled via REST");
            state.notifier.touch(job_id);
            Json(job).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn start_job(State(state): State<AppState>, Json(body): Json<TaskRequest>) -> Response {
    let task = body.into_task(Arc::clone(&state.sessions));
    match state.runner.start(task).await {
        Ok(job) => {
            info!(job_id = %job.id, job_type = %job.job_type, "Job started via REST");
            (StatusCode::ACCEPTED, Json(job)).into_response()
        }
        Err(e) => error_response(e),
    }
}
