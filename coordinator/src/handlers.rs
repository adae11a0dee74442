use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::fs;
use tower_http::trace::TraceLayer;
use tracing::warn;

use common::protocol::{
    JobResults, TaskCompleteRequest, TaskCompleteResponse, TaskPollRequest, TaskPollResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerRegisterRequest,
    WorkerRegisterResponse, WorkerView,
};
use common::{EngineError, JobInfo, JobSpec, JobStatus};

use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/jobs/:id/results", get(get_job_results))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/poll", post(poll_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- HTTP handlers ---------------- */

async fn health() -> &'static str {
    "ok"
}

/// Accept a job: expand the input glob to one map partition per file,
/// validate the stage DAG and enqueue the stages.
async fn create_job(
    State(state): State<SharedState>,
    Json(spec): Json<JobSpec>,
) -> Result<Json<JobInfo>, (StatusCode, String)> {
    let pattern = glob::glob(&spec.input_glob).map_err(|e| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("invalid input_glob: {e}"),
        )
    })?;
    let inputs: Vec<String> = pattern
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_file())
        .map(|p| p.to_string_lossy().to_string())
        .collect();

    let info = {
        let mut state = state.lock().unwrap();
        state.submit_job(spec, inputs).map_err(|e| match e {
            EngineError::InvalidJob(_) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        })?
    };
    if let Err(e) = fs::create_dir_all(&info.output_dir) {
        warn!("could not create output dir {}: {}", info.output_dir, e);
    }
    Ok(Json(info))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, StatusCode> {
    state
        .lock()
        .unwrap()
        .job_info(&id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, StatusCode> {
    state
        .lock()
        .unwrap()
        .cancel_job(&id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// List the final output partitions of a finished job.
async fn get_job_results(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<JobResults>, (StatusCode, String)> {
    let info = {
        let state = state.lock().unwrap();
        state
            .job_info(&id)
            .ok_or((StatusCode::NOT_FOUND, "unknown job".to_string()))?
    };
    if info.status != JobStatus::Succeeded {
        return Err((
            StatusCode::CONFLICT,
            format!("job is {:?}, results only exist once it succeeded", info.status),
        ));
    }

    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(&info.output_dir) {
        for entry in entries.flatten() {
            if entry.path().is_file() {
                files.push(entry.path().to_string_lossy().to_string());
            }
        }
    }
    files.sort();
    Ok(Json(JobResults {
        job_id: info.id,
        output_dir: info.output_dir,
        files,
    }))
}

async fn list_workers(State(state): State<SharedState>) -> Json<Vec<WorkerView>> {
    Json(state.lock().unwrap().workers_view())
}

async fn register_worker(
    State(state): State<SharedState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    Json(state.lock().unwrap().register_worker(req))
}

async fn worker_heartbeat(
    State(state): State<SharedState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    state
        .lock()
        .unwrap()
        .heartbeat(req)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn poll_task(
    State(state): State<SharedState>,
    Json(req): Json<TaskPollRequest>,
) -> Result<Json<TaskPollResponse>, StatusCode> {
    state
        .lock()
        .unwrap()
        .poll_task(&req.worker_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn complete_task(
    State(state): State<SharedState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Json<TaskCompleteResponse> {
    let ok = state.lock().unwrap().complete_task(req);
    if !ok {
        warn!("completion report for unknown task dropped");
    }
    Json(TaskCompleteResponse { ok })
}
