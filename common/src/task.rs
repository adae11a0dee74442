use serde::{Deserialize, Serialize};

use crate::functions::{MapFn, ReduceFn};
use crate::job::{JobId, StageId};

pub type TaskId = String;

/// A unit of work over one partition, shipped to a worker as-is.
/// The pair (task id, attempt) identifies one execution instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub job_id: JobId,
    pub stage_id: StageId,
    pub partition_index: u32,
    pub attempt: u32,
    pub kind: TaskKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Map {
        function: MapFn,
        /// Input partition for this task (one file of the job's input glob).
        input_path: String,
        /// Shuffle fan-out: one block per reduce partition.
        num_reduce_partitions: u32,
    },
    Reduce {
        function: ReduceFn,
        /// One block per upstream map task, all for this task's partition.
        map_inputs: Vec<BlockLocation>,
        /// Final output partition file.
        output_path: String,
    },
}

/// Address of one shuffle block: which map task produced it, which reduce
/// partition it belongs to, and which worker serves it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockLocation {
    pub map_task_id: TaskId,
    pub reduce_partition: u32,
    /// Base URL of the producing worker's shuffle server.
    pub worker_url: String,
    pub checksum: u64,
    pub len: u64,
}
