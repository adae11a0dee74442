use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::functions::{MapFn, ReduceFn};

pub type JobId = String;
pub type StageId = String;

/// Job submission payload: the stage DAG plus input/output references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,

    /// Stages with dependency edges (each stage lists its upstreams).
    pub stages: Vec<StageSpec>,

    /// Input file pattern, e.g. "/data/input/*.txt". One map task per match.
    pub input_glob: String,

    /// Base directory the final reduce partitions are written under.
    pub output_dir: String,

    /// Number of reduce partitions (shuffle fan-out of every map task).
    pub num_reduce_partitions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: StageId,
    pub kind: StageKind,
    pub upstream: Vec<StageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    Map { function: MapFn },
    Reduce { function: ReduceFn },
}

impl StageKind {
    pub fn is_map(&self) -> bool {
        matches!(self, StageKind::Map { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Status snapshot returned by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,

    pub output_dir: String,
    pub stages: Vec<StageProgress>,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Total re-executions across all tasks of the job.
    pub retries: u32,

    /// Last attempt error recorded when the job failed.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage_id: StageId,
    pub total_tasks: u32,
    pub succeeded_tasks: u32,
    pub running_tasks: u32,
}
