//! Submission and query API.
//!
//! The admission layer: translates inbound field maps into canonical task
//! descriptors with fresh uuids and hands them to the broker. Malformed
//! submissions are rejected here and never reach the scheduling core.
//!
//! Routes:
//! - `POST /api/task/script`: submit a script task
//! - `POST /api/task/http`: submit an HTTP task
//! - `GET /api/task/result?uuid=`: result lookup
//! - `GET /api/task/count/undo`: pending task count
//! - `GET /api/task/count/success/:date`, `GET /api/task/count/failure/:date`
//! - `GET /metrics`: Prometheus text exposition

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::broker::Broker;
use crate::metrics;
use crate::types::{parse_schedule, SchedulerError, TaskDescriptor, TaskKind};

/// Build the broker's HTTP router.
pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/api/task/script", post(create_script_task))
        .route("/api/task/http", post(create_http_task))
        .route("/api/task/result", get(task_result))
        .route("/api/task/count/undo", get(undo_count))
        .route("/api/task/count/success/:date", get(success_count))
        .route("/api/task/count/failure/:date", get(failure_count))
        .route("/metrics", get(render_metrics))
        .with_state(broker)
}

fn reject(err: SchedulerError) -> Response {
    (StatusCode::FORBIDDEN, Json(err.to_string())).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScriptTaskRequest {
    bin_name: String,
    /// Space-separated argument string.
    args: String,
    start_time: i64,
    /// Space-separated back-off schedule in seconds.
    time_interval: String,
    max_run_time: u64,
}

async fn create_script_task(
    State(broker): State<Arc<Broker>>,
    Json(req): Json<ScriptTaskRequest>,
) -> Response {
    if req.bin_name.is_empty() {
        return reject(SchedulerError::InvalidArgument);
    }
    let schedule = match parse_schedule(&req.time_interval) {
        Ok(schedule) => schedule,
        Err(err) => return reject(err),
    };
    let task = TaskDescriptor {
        uuid: Uuid::new_v4().to_string(),
        kind: TaskKind::Script,
        target: req.bin_name,
        args: req.args,
        start_time: req.start_time,
        backoff_schedule: schedule,
        attempt_index: 0,
        max_run_time: req.max_run_time,
    };
    submit(broker, task).await
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HttpTaskRequest {
    method: String,
    url: String,
    /// Request body, typically JSON.
    args: String,
    start_time: i64,
    time_interval: String,
    max_run_time: u64,
}

async fn create_http_task(
    State(broker): State<Arc<Broker>>,
    Json(req): Json<HttpTaskRequest>,
) -> Response {
    if req.url.is_empty() {
        return reject(SchedulerError::InvalidArgument);
    }
    let kind = match TaskKind::from_http_method(&req.method) {
        Ok(kind) => kind,
        Err(err) => return reject(err),
    };
    let schedule = match parse_schedule(&req.time_interval) {
        Ok(schedule) => schedule,
        Err(err) => return reject(err),
    };
    let task = TaskDescriptor {
        uuid: Uuid::new_v4().to_string(),
        kind,
        target: req.url,
        args: req.args,
        start_time: req.start_time,
        backoff_schedule: schedule,
        attempt_index: 0,
        max_run_time: req.max_run_time,
    };
    submit(broker, task).await
}

async fn submit(broker: Arc<Broker>, task: TaskDescriptor) -> Response {
    let uuid = task.uuid.clone();
    info!(
        %uuid,
        kind = ?task.kind,
        target = %task.target,
        start_time = task.start_time,
        "submission accepted"
    );
    match broker.submit(task).await {
        Ok(()) => {
            metrics::record_submission();
            (StatusCode::OK, Json(uuid)).into_response()
        }
        Err(err) => reject(err),
    }
}

#[derive(Debug, Deserialize)]
struct ResultQuery {
    uuid: String,
}

async fn task_result(
    State(broker): State<Arc<Broker>>,
    Query(query): Query<ResultQuery>,
) -> Response {
    match broker.task_result(&query.uuid).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(err) => reject(err),
    }
}

async fn undo_count(State(broker): State<Arc<Broker>>) -> Response {
    match broker.pending_count().await {
        Ok(count) => (StatusCode::OK, Json(count)).into_response(),
        Err(err) => reject(err),
    }
}

async fn success_count(
    State(broker): State<Arc<Broker>>,
    Path(date): Path<String>,
) -> Response {
    match broker.success_count(&date).await {
        Ok(count) => (StatusCode::OK, Json(count)).into_response(),
        Err(err) => reject(err),
    }
}

async fn failure_count(
    State(broker): State<Arc<Broker>>,
    Path(date): Path<String>,
) -> Response {
    match broker.failure_count(&date).await {
        Ok(count) => (StatusCode::OK, Json(count)).into_response(),
        Err(err) => reject(err),
    }
}

async fn render_metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
        .into_response()
}
