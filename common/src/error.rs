use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy of the execution core.
///
/// Task-level variants are recovered by re-scheduling up to the attempt
/// budget; only exhausted attempts surface to the submitter as a Failed job.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed job: DAG cycle, unknown upstream stage, bad shape.
    /// Rejected at submission, never enters the scheduler.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// No alive worker with a free slot. The task stays Pending and is
    /// retried on the next scheduling tick.
    #[error("no worker available")]
    WorkerUnavailable,

    /// The map/reduce function itself failed on this attempt.
    #[error("task execution failed: {0}")]
    TaskExecution(String),

    /// A shuffle block could not be fetched after bounded retries.
    #[error("shuffle fetch failed: {0}")]
    ShuffleFetch(String),

    /// The producing task has not completed or its block was collected.
    #[error("shuffle block not found: map_task={map_task_id} partition={partition}")]
    BlockNotFound { map_task_id: String, partition: u32 },

    /// Block bytes do not match the recorded checksum. The coordinator
    /// re-executes the producing map task, not the consumer.
    #[error("shuffle block checksum mismatch: map_task={map_task_id} partition={partition}")]
    ChecksumMismatch { map_task_id: String, partition: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure class a worker reports when a task attempt ends badly.
/// This is what lets the coordinator pick the right recovery action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskErrorKind {
    /// User function / runtime failure inside the task.
    Execution,
    /// Could not fetch one of the input blocks after retries.
    ShuffleFetch,
    /// A fetched block failed checksum verification; carries the producer
    /// so the coordinator can recycle the map task instead of this one.
    ChecksumMismatch { map_task_id: String },
    /// The attempt was cancelled (job cancel or speculation lost the race).
    Cancelled,
}

impl EngineError {
    /// Collapse an engine error into the wire-level failure class.
    pub fn task_error_kind(&self) -> TaskErrorKind {
        match self {
            EngineError::ChecksumMismatch { map_task_id, .. } => TaskErrorKind::ChecksumMismatch {
                map_task_id: map_task_id.clone(),
            },
            EngineError::ShuffleFetch(_) | EngineError::BlockNotFound { .. } => {
                TaskErrorKind::ShuffleFetch
            }
            _ => TaskErrorKind::Execution,
        }
    }
}
