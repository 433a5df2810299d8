//! The external HTTP surface: task CRUD and health/monitoring endpoints.
//!
//! Grounded on `serve_cmd::build_router`/`run_serve`'s shape -- a thin
//! `axum::Router` over a shared `PgPool`, a small `AppError`/`IntoResponse`
//! pair for uniform JSON errors, and `shutdown_signal()` awaiting Ctrl+C --
//! generalized from a read-only plan/task dashboard to the task-engine's
//! CRUD and health contract.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tracing::Instrument;
use uuid::Uuid;

use taskrelay_core::retry::RetryConfig;
use taskrelay_core::{monitoring, recovery};
use taskrelay_db::models::{Task, TaskAttempt, TaskStatus, TaskType};
use taskrelay_db::queries::{attempts as attempts_db, tasks as tasks_db};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub start_time: Arc<Instant>,
    pub retry_config: RetryConfig,
    pub heartbeat_timeout_ms: i64,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A uniform JSON error envelope: `{error, message, status, timestamp,
/// path, details[]}`, per the HTTP boundary's error taxonomy.
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    path: String,
    details: Vec<String>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            path: String::new(),
            details: Vec::new(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg)
    }

    pub fn invalid_json(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_JSON", msg)
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "TYPE_MISMATCH", msg)
    }

    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "ILLEGAL_ARGUMENT", msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "CONSTRAINT_VIOLATION", msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONSTRAINT_VIOLATION", msg)
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", format!("{err:#}"))
    }

    /// Attach the request path this error is being returned for. Threaded
    /// explicitly as a value at each call site, not read from hidden state.
    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": self.code,
            "message": self.message,
            "status": self.status.as_u16(),
            "timestamp": Utc::now().to_rfc3339(),
            "path": self.path,
            "details": self.details,
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub schedule_at: Option<DateTime<Utc>>,
    pub max_retries: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: Task,
    pub attempts: Vec<TaskAttempt>,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub page: Option<i64>,
    pub size: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TaskCountsResponse {
    pub pending: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub total: i64,
}

impl From<tasks_db::TaskCounts> for TaskCountsResponse {
    fn from(c: tasks_db::TaskCounts) -> Self {
        Self {
            pending: c.pending,
            running: c.running,
            success: c.success,
            failed: c.failed,
            total: c.total,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AttemptMetricsResponse {
    pub succeeded: i64,
    pub failed: i64,
    pub success_rate: f64,
}

impl From<monitoring::AttemptMetrics> for AttemptMetricsResponse {
    fn from(m: monitoring::AttemptMetrics) -> Self {
        Self {
            succeeded: m.succeeded,
            failed: m.failed,
            success_rate: m.success_rate(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub counts: TaskCountsResponse,
    pub attempts_last_hour: AttemptMetricsResponse,
}

#[derive(Debug, Serialize)]
pub struct WorkerStatusResponse {
    pub worker_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub active: bool,
    pub seconds_since_heartbeat: i64,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RecoveryResponse {
    pub reclaimed_tasks: u64,
    pub cleared_heartbeats: u64,
}

#[derive(Debug, Serialize)]
pub struct StuckAttemptView {
    pub attempt_id: i64,
    pub task_id: Uuid,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
}

impl From<TaskAttempt> for StuckAttemptView {
    fn from(a: TaskAttempt) -> Self {
        Self {
            attempt_id: a.id,
            task_id: a.task_id,
            worker_id: a.worker_id,
            started_at: a.started_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConsistencyResponse {
    pub consistent: bool,
    pub orphaned_worker_ids: Vec<String>,
    pub stuck_attempts: Vec<StuckAttemptView>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task).delete(cancel_task))
        .route("/health", get(health))
        .route("/health/workers", get(health_workers))
        .route("/health/metrics", get(health_metrics))
        .route("/health/recovery", post(health_recovery))
        .route("/health/consistency", get(health_consistency))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(correlation_id_middleware))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("taskrelay serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("taskrelay serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Correlation id middleware
// ---------------------------------------------------------------------------

async fn correlation_id_middleware(
    mut req: axum::extract::Request,
    next: Next,
) -> axum::response::Response {
    let correlation_id = req
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::info_span!("request", correlation_id = %correlation_id, path = %req.uri().path());

    async move {
        let mut response = next.run(req).await;
        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            response.headers_mut().insert("x-correlation-id", value);
        }
        response
    }
    .instrument(span)
    .await
}

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

async fn create_task(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Json(req): Json<CreateTaskRequest>,
) -> Result<axum::response::Response, AppError> {
    let max_retries = req.max_retries.unwrap_or(state.retry_config.default_max_retries);
    if max_retries < 0 {
        return Err(AppError::validation("max_retries must be non-negative").at(uri.path()));
    }
    let schedule_at = req.schedule_at.unwrap_or_else(Utc::now);

    let task = tasks_db::insert_task(&state.pool, req.task_type, &req.payload, schedule_at, max_retries)
        .await
        .map_err(|e| AppError::internal(e).at(uri.path()))?;

    Ok((StatusCode::CREATED, Json(task)).into_response())
}

async fn get_task(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = tasks_db::get_task(&state.pool, id)
        .await
        .map_err(|e| AppError::internal(e).at(uri.path()))?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")).at(uri.path()))?;

    let attempts = attempts_db::list_attempts_for_task(&state.pool, id)
        .await
        .map_err(|e| AppError::internal(e).at(uri.path()))?;

    Ok(Json(TaskDetailResponse { task, attempts }).into_response())
}

async fn list_tasks(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(q): Query<ListTasksQuery>,
) -> Result<axum::response::Response, AppError> {
    let status = q
        .status
        .map(|s| s.parse::<TaskStatus>())
        .transpose()
        .map_err(|e| AppError::validation(e.to_string()).at(uri.path()))?;
    let task_type = q
        .task_type
        .map(|t| t.parse::<TaskType>())
        .transpose()
        .map_err(|e| AppError::validation(e.to_string()).at(uri.path()))?;
    let page = q.page.unwrap_or(1).max(1);
    let size = q.size.unwrap_or(20).clamp(1, 200);

    let tasks = tasks_db::list_tasks(&state.pool, status, task_type, page, size)
        .await
        .map_err(|e| AppError::internal(e).at(uri.path()))?;

    Ok(Json(tasks).into_response())
}

async fn cancel_task(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = tasks_db::get_task(&state.pool, id)
        .await
        .map_err(|e| AppError::internal(e).at(uri.path()))?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")).at(uri.path()))?;

    if task.status != TaskStatus::Pending {
        return Err(AppError::conflict(format!(
            "task {id} is {} and can only be cancelled while pending",
            task.status
        ))
        .at(uri.path()));
    }

    let deleted = tasks_db::delete_task(&state.pool, id)
        .await
        .map_err(|e| AppError::internal(e).at(uri.path()))?;

    if !deleted {
        // Lost a race with the scheduler claiming it between the read above
        // and the delete; report the conflict rather than a false success.
        return Err(AppError::conflict(format!("task {id} is no longer pending")).at(uri.path()));
    }

    Ok(StatusCode::OK.into_response())
}

// ---------------------------------------------------------------------------
// Health / monitoring handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let counts = monitoring::task_counts(&state.pool)
        .await
        .map_err(AppError::internal)?;
    let attempts = monitoring::attempt_metrics(&state.pool, 1)
        .await
        .map_err(AppError::internal)?;
    let consistent = monitoring::counts_are_consistent(&state.pool)
        .await
        .map_err(AppError::internal)?;

    let status = if !consistent {
        "DEGRADED"
    } else if counts.failed > 0 && counts.failed == counts.total {
        "DOWN"
    } else {
        "UP"
    };

    Ok(Json(HealthResponse {
        status,
        uptime_secs: state.start_time.elapsed().as_secs(),
        counts: counts.into(),
        attempts_last_hour: attempts.into(),
    })
    .into_response())
}

async fn health_workers(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let active = monitoring::active_workers(&state.pool, state.heartbeat_timeout_ms)
        .await
        .map_err(AppError::internal)?;
    let stale = monitoring::stale_workers(&state.pool, state.heartbeat_timeout_ms)
        .await
        .map_err(AppError::internal)?;

    let now = Utc::now();
    let mut workers: Vec<WorkerStatusResponse> = active
        .into_iter()
        .map(|w| WorkerStatusResponse {
            seconds_since_heartbeat: (now - w.last_heartbeat).num_seconds().max(0),
            worker_id: w.worker_id,
            last_heartbeat: w.last_heartbeat,
            active: true,
        })
        .chain(stale.into_iter().map(|w| WorkerStatusResponse {
            seconds_since_heartbeat: (now - w.last_heartbeat).num_seconds().max(0),
            worker_id: w.worker_id,
            last_heartbeat: w.last_heartbeat,
            active: false,
        }))
        .collect();
    workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

    Ok(Json(workers).into_response())
}

async fn health_metrics(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(q): Query<MetricsQuery>,
) -> Result<axum::response::Response, AppError> {
    let hours = q.hours.unwrap_or(1);
    if !(1..=168).contains(&hours) {
        return Err(AppError::validation("hours must be between 1 and 168").at(uri.path()));
    }

    let metrics = monitoring::attempt_metrics(&state.pool, hours)
        .await
        .map_err(|e| AppError::internal(e).at(uri.path()))?;

    Ok(Json(AttemptMetricsResponse::from(metrics)).into_response())
}

async fn health_recovery(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let report = recovery::run(&state.pool).await.map_err(AppError::internal)?;

    Ok(Json(RecoveryResponse {
        reclaimed_tasks: report.reclaimed_tasks,
        cleared_heartbeats: report.cleared_heartbeats,
    })
    .into_response())
}

async fn health_consistency(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let running = tasks_db::find_by_status(&state.pool, TaskStatus::Running)
        .await
        .map_err(AppError::internal)?;
    let active = monitoring::active_workers(&state.pool, state.heartbeat_timeout_ms)
        .await
        .map_err(AppError::internal)?;
    let active_ids: std::collections::HashSet<_> = active.into_iter().map(|w| w.worker_id).collect();

    let orphaned_worker_ids: Vec<String> = running
        .into_iter()
        .filter_map(|t| t.worker_id)
        .filter(|id| !active_ids.contains(id))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let stuck_attempts: Vec<StuckAttemptView> = monitoring::stuck_attempts(&state.pool, state.heartbeat_timeout_ms)
        .await
        .map_err(AppError::internal)?
        .into_iter()
        .map(StuckAttemptView::from)
        .collect();

    Ok(Json(ConsistencyResponse {
        consistent: orphaned_worker_ids.is_empty() && stuck_attempts.is_empty(),
        orphaned_worker_ids,
        stuck_attempts,
    })
    .into_response())
}

async fn health_live() -> StatusCode {
    StatusCode::OK
}

async fn health_ready(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|e| AppError::internal(e.into()))?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use taskrelay_test_utils::{create_test_db, drop_test_db};

    use super::*;

    fn test_state(pool: PgPool) -> AppState {
        AppState {
            pool,
            start_time: Arc::new(Instant::now()),
            retry_config: RetryConfig::default(),
            heartbeat_timeout_ms: 60_000,
        }
    }

    async fn send_request(state: AppState, method: &str, uri: &str, body: serde_json::Value) -> axum::response::Response {
        let app = super::build_router(state);
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        app.oneshot(req).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_then_get_task_round_trips() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_request(
            state.clone(),
            "POST",
            "/tasks",
            serde_json::json!({"task_type": "dummy", "payload": {"logMessage": "hi"}}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        let id = created["id"].as_str().unwrap();

        let resp = send_request(state.clone(), "GET", &format!("/tasks/{id}"), serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let detail = body_json(resp).await;
        assert_eq!(detail["status"], "pending");
        assert_eq!(detail["attempts"].as_array().unwrap().len(), 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_unknown_task_is_404() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_request(state, "GET", &format!("/tasks/{}", Uuid::new_v4()), serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "CONSTRAINT_VIOLATION");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn cancel_pending_task_succeeds() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let task = tasks_db::insert_task(&pool, TaskType::Dummy, &serde_json::json!({}), Utc::now(), 3)
            .await
            .unwrap();

        let resp = send_request(state, "DELETE", &format!("/tasks/{}", task.id), serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let remaining = tasks_db::get_task(&pool, task.id).await.unwrap();
        assert!(remaining.is_none());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn cancel_running_task_is_conflict() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let task = tasks_db::insert_task(&pool, TaskType::Dummy, &serde_json::json!({}), Utc::now(), 3)
            .await
            .unwrap();
        tasks_db::claim(&pool, task.id, TaskStatus::Pending, TaskStatus::Running, "w1", Utc::now())
            .await
            .unwrap();

        let resp = send_request(state, "DELETE", &format!("/tasks/{}", task.id), serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn health_reports_up_with_no_tasks() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_request(state, "GET", "/health", serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "UP");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn health_metrics_rejects_out_of_range_hours() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_request(state, "GET", "/health/metrics?hours=200", serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "VALIDATION_ERROR");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn health_live_and_ready_are_ok() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_request(state.clone(), "GET", "/health/live", serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = send_request(state, "GET", "/health/ready", serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::OK);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn correlation_id_is_echoed_back() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());
        let app = super::build_router(state);

        let req = Request::builder()
            .uri("/health/live")
            .header("x-correlation-id", "test-correlation-id")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(
            resp.headers().get("x-correlation-id").unwrap(),
            "test-correlation-id"
        );

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
