//! HTTP surface (§6): health, projects, missions, processes.
//!
//! Auth is a `tower`-style middleware layer ahead of every `/api/*` route,
//! matching how this codebase already wires CORS around its router.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;

use gator_core::Root;
use gator_core::auth::constant_time_eq;
use gator_core::broadcaster::EventPayload;
use gator_core::orchestrator::Signal;
use gator_core::{CoreError, CoreResult};
use gator_db::models::{Mission, Project, ProcessRow, ProcessType, Task};
use gator_db::queries::{missions, processes, projects, tasks};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Maps `CoreError` onto the `{success:false,error:{code,message}}` shape
/// every non-success response carries (§7).
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Precondition(_) => StatusCode::CONFLICT,
            CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, code: err.code(), message: err.to_string() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": { "code": self.code, "message": self.message },
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, AppError>;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub root: Arc<Root>,
    pub api_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    name: String,
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProjectRequest {
    name: Option<String>,
    is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMissionRequest {
    project_id: String,
    feature_name: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MissionListQuery {
    project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotesRequest {
    #[serde(default)]
    notes: String,
}

#[derive(Debug, Deserialize)]
struct SignalRequest {
    signal: String,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    content: String,
    lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct MissionWithTasksMarker;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    let api_token = state.api_token.clone();

    let api_routes = Router::new()
        .route("/api/projects", post(create_project).get(list_projects))
        .route(
            "/api/projects/{id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/missions", post(create_mission).get(list_missions))
        .route("/api/missions/{id}", get(get_mission))
        .route("/api/missions/{id}/start", post(start_mission))
        .route("/api/missions/{id}/approve-prd", post(approve_prd))
        .route("/api/missions/{id}/reject-prd", post(reject_prd))
        .route("/api/missions/{id}/approve-tasks", post(approve_tasks))
        .route("/api/missions/{id}/reject-tasks", post(reject_tasks))
        .route("/api/missions/{id}/cancel", post(cancel_mission))
        .route("/api/processes/{id}", get(get_process))
        .route("/api/processes/{id}/logs", get(get_process_logs))
        .route("/api/processes/{id}/logs/stream", get(stream_process_logs))
        .route("/api/processes/{id}/signal", post(signal_process))
        .layer(middleware::from_fn_with_state(api_token, auth_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(api_routes)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bearer-token auth ahead of every `/api/*` route (§6). Bypassed entirely
/// when no token is configured.
async fn auth_middleware(
    State(api_token): State<Option<String>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = api_token else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if constant_time_eq(token, &expected) => next.run(req).await,
        _ => AppError::from(CoreError::Unauthorized).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, host: std::net::IpAddr, port: u16) -> anyhow::Result<()> {
    let app = build_router(state.clone());
    let addr = SocketAddr::new(host, port);
    tracing::info!(%addr, "gator serve listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("gator serve shut down accepting connections");
    state.root.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// Handlers: health
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Response {
    let store_ok = sqlx::query("SELECT 1").execute(&state.root.pool).await.is_ok();
    let sandbox_ok = state.root.sandbox.ping().await.is_ok();

    let body = json!({
        "status": if store_ok && sandbox_ok { "healthy" } else { "unhealthy" },
        "store": if store_ok { "ok" } else { "unreachable" },
        "sandbox": if sandbox_ok { "ok" } else { "unreachable" },
    });

    let status = if store_ok && sandbox_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Handlers: projects
// ---------------------------------------------------------------------------

/// Validates the project directory exists and carries a VCS marker before
/// delegating to the store; uniqueness is enforced by the store's unique
/// index and surfaces as `Conflict` (§6, §7).
async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<CreateProjectRequest>,
) -> ApiResult<Response> {
    let dir = FsPath::new(&body.path);
    if !dir.is_dir() {
        return Err(CoreError::Validation(format!("path {:?} is not a directory", body.path)).into());
    }
    if !dir.join(".git").exists() {
        return Err(CoreError::Validation(format!("path {:?} has no VCS marker (.git)", body.path)).into());
    }

    let project = projects::create(&state.root.pool, &body.name, &body.path).await.map_err(CoreError::from)?;
    Ok((StatusCode::CREATED, Json(project)).into_response())
}

async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let projects = projects::find_all(&state.root.pool).await.map_err(CoreError::from)?;
    Ok(Json(json!(projects)))
}

async fn get_project(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Project>> {
    let project = projects::find_by_id(&state.root.pool, &id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::NotFound { kind: "project", id: id.clone() })?;
    Ok(Json(project))
}

async fn update_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateProjectRequest>,
) -> ApiResult<Json<Project>> {
    let project = projects::update(&state.root.pool, &id, body.name.as_deref(), body.is_active)
        .await
        .map_err(CoreError::from)?;
    Ok(Json(project))
}

async fn delete_project(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    projects::delete(&state.root.pool, &id).await.map_err(CoreError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Handlers: missions
// ---------------------------------------------------------------------------

async fn create_mission(
    State(state): State<AppState>,
    Json(body): Json<CreateMissionRequest>,
) -> ApiResult<Response> {
    if body.feature_name.trim().is_empty() {
        return Err(CoreError::Validation("featureName must not be empty".to_string()).into());
    }
    projects::find_by_id(&state.root.pool, &body.project_id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::NotFound { kind: "project", id: body.project_id.clone() })?;

    let mission = missions::create(&state.root.pool, &body.project_id, &body.feature_name, body.description.as_deref())
        .await
        .map_err(CoreError::from)?;
    Ok((StatusCode::CREATED, Json(mission)).into_response())
}

async fn list_missions(
    State(state): State<AppState>,
    Query(q): Query<MissionListQuery>,
) -> ApiResult<Json<Vec<Mission>>> {
    let list = match q.project_id {
        Some(project_id) => missions::find_by_project(&state.root.pool, &project_id).await,
        None => missions::find_all(&state.root.pool).await,
    }
    .map_err(CoreError::from)?;
    Ok(Json(list))
}

async fn get_mission(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Mission>> {
    let mission = missions::find_by_id(&state.root.pool, &id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::NotFound { kind: "mission", id: id.clone() })?;
    Ok(Json(mission))
}

async fn start_mission(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Mission>> {
    let mission = state.root.mission_driver.start(&id).await?;
    Ok(Json(mission))
}

async fn approve_prd(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Mission>> {
    let mission = state.root.mission_driver.approve_prd(&id).await?;
    Ok(Json(mission))
}

async fn reject_prd(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<NotesRequest>,
) -> ApiResult<Json<Mission>> {
    let mission = state.root.mission_driver.reject_prd(&id, &body.notes).await?;
    Ok(Json(mission))
}

async fn approve_tasks(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Mission>> {
    let mission = state.root.mission_driver.approve_tasks(&id).await?;
    Ok(Json(mission))
}

async fn reject_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<NotesRequest>,
) -> ApiResult<Json<Mission>> {
    let mission = state.root.mission_driver.reject_tasks(&id, &body.notes).await?;
    Ok(Json(mission))
}

async fn cancel_mission(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Mission>> {
    let mission = state.root.mission_driver.cancel(&id).await?;
    Ok(Json(mission))
}

// ---------------------------------------------------------------------------
// Handlers: tasks (read-only, nested under a mission in the happy path but
// exposed directly since Task has its own identity)
// ---------------------------------------------------------------------------

#[allow(dead_code)]
async fn list_tasks_for_mission(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Vec<Task>>> {
    let list = tasks::find_by_mission(&state.root.pool, &id).await.map_err(CoreError::from)?;
    Ok(Json(list))
}

// ---------------------------------------------------------------------------
// Handlers: processes
// ---------------------------------------------------------------------------

async fn get_process(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<ProcessRow>> {
    let process = processes::find_by_id(&state.root.pool, &id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::NotFound { kind: "process", id: id.clone() })?;
    Ok(Json(process))
}

async fn get_process_logs(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<LogsResponse>> {
    processes::find_by_id(&state.root.pool, &id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::NotFound { kind: "process", id: id.clone() })?;

    let content = state.root.journal.read_all(&id).unwrap_or_default();
    let lines = state.root.journal.recent_lines(&id);
    Ok(Json(LogsResponse { content, lines }))
}

/// Server-sent events of `{type,stream?,data}` with monotonic ids. Honors
/// `Last-Event-Id` by replaying the journal's ring buffer as fresh ids
/// ahead of the live feed (§6, §8 property 7).
async fn stream_process_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    processes::find_by_id(&state.root.pool, &id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::NotFound { kind: "process", id: id.clone() })?;

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut replay = Vec::new();
    if let Some(k) = last_event_id {
        if k < state.root.broadcaster.current(&id) {
            for line in state.root.journal.recent_lines(&id) {
                let event_id = state.root.broadcaster.next_event_id(&id);
                replay.push(to_sse_event(event_id, &EventPayload::log(line)));
            }
        }
    }

    let rx = state.root.broadcaster.subscribe(&id);
    let live = ReceiverStream::new(rx).map(|event| to_sse_event(event.id, &event.payload));

    let stream = tokio_stream::iter(replay).chain(live).map(Ok);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(id: u64, payload: &EventPayload) -> SseEvent {
    SseEvent::default().id(id.to_string()).json_data(payload).unwrap_or_else(|_| SseEvent::default().id(id.to_string()))
}

async fn signal_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SignalRequest>,
) -> ApiResult<StatusCode> {
    let process = processes::find_by_id(&state.root.pool, &id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::NotFound { kind: "process", id: id.clone() })?;

    match process.r#type {
        ProcessType::Local => {
            let signal = match body.signal.as_str() {
                "SIGTERM" => Signal::Term,
                "SIGKILL" => Signal::Kill,
                other => return Err(CoreError::Validation(format!("unsupported signal {other:?}")).into()),
            };
            state.root.orchestrator.kill(&id, signal).await?;
        }
        ProcessType::Container => {
            let container_id = process
                .container_id
                .ok_or_else(|| CoreError::Internal(anyhow::anyhow!("container process {id} has no container id")))?;
            if !matches!(body.signal.as_str(), "SIGTERM" | "SIGKILL") {
                return Err(CoreError::Validation(format!("unsupported signal {:?}", body.signal)).into());
            }
            state.root.sandbox.kill(&container_id, &body.signal).await?;
        }
    }

    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
