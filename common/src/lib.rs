pub mod dag;
pub mod error;
pub mod functions;
pub mod job;
pub mod protocol;
pub mod shuffle;
pub mod store;
pub mod task;

pub use error::{EngineError, Result, TaskErrorKind};
pub use job::{JobId, JobInfo, JobSpec, JobStatus, StageId, StageKind, StageSpec};
pub use protocol::WorkerId;
pub use task::{BlockLocation, TaskId, TaskKind, TaskSpec};
