use serde::{Deserialize, Serialize};

use crate::error::TaskErrorKind;
use crate::job::JobId;
use crate::task::{BlockLocation, TaskId, TaskSpec};

pub type WorkerId = String;

/* --------- worker registration / heartbeat --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    /// Base URL of this worker's shuffle server, e.g. "http://worker-1:8090".
    pub shuffle_url: String,
    /// Task slots: how many attempts this worker runs concurrently.
    pub slots: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    pub running_tasks: u32,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
    /// Attempts the worker should abandon (job cancelled, race lost).
    pub cancel_tasks: Vec<TaskId>,
    /// Map tasks whose shuffle blocks can be deleted locally.
    pub collect_shuffle: Vec<TaskId>,
}

/* --------- task assignment / completion --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPollRequest {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPollResponse {
    pub task: Option<TaskSpec>,
    pub cancel_tasks: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteRequest {
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    pub attempt: u32,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Success {
        /// Shuffle blocks a map attempt produced; empty for reduce tasks.
        blocks: Vec<BlockLocation>,
        /// Output partition a reduce attempt wrote, if any.
        output_path: Option<String>,
    },
    Failure {
        kind: TaskErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteResponse {
    pub ok: bool,
}

/* --------- job results / cluster views --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    pub output_dir: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Alive,
    Suspected,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerView {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub shuffle_url: String,
    pub status: WorkerStatus,
    pub slots: u32,
    pub last_heartbeat_secs_ago: u64,
    pub active_tasks: u32,
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}
