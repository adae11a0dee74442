use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use common::job::StageProgress;
use common::protocol::{
    TaskCompleteRequest, TaskOutcome, TaskPollResponse, WorkerHeartbeatRequest,
    WorkerHeartbeatResponse, WorkerRegisterRequest, WorkerRegisterResponse, WorkerStatus,
    WorkerView,
};
use common::{
    BlockLocation, EngineError, JobId, JobInfo, JobSpec, JobStatus, Result, StageId, StageKind,
    TaskErrorKind, TaskId, TaskKind, TaskSpec, WorkerId,
};

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Scheduling knobs, read once at startup.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Charged failures a task survives before the job is failed.
    pub max_task_attempts: u32,
    /// Missed-heartbeat window before a worker is Suspected.
    pub suspect_timeout: Duration,
    /// Missed-heartbeat window before a worker is Dead and drained.
    pub dead_timeout: Duration,
    /// A running attempt slower than multiplier x stage median gets a
    /// speculative twin on another worker.
    pub speculation_multiplier: f64,
    /// Completed attempts a stage needs before the median is trusted.
    pub speculation_min_completed: usize,
    /// Floor below which attempts are never speculated.
    pub speculation_min_runtime: Duration,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            max_task_attempts: env_u32("MAX_TASK_ATTEMPTS", 3),
            suspect_timeout: Duration::from_secs(env_u64("WORKER_SUSPECT_TIMEOUT_SECS", 10)),
            dead_timeout: Duration::from_secs(env_u64("WORKER_DEAD_TIMEOUT_SECS", 20)),
            speculation_multiplier: env_f64("SPECULATION_MULTIPLIER", 2.0),
            speculation_min_completed: env_u32("SPECULATION_MIN_COMPLETED", 2) as usize,
            speculation_min_runtime: Duration::from_secs(env_u64(
                "SPECULATION_MIN_RUNTIME_SECS",
                5,
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub shuffle_url: String,
    pub slots: u32,
    pub last_heartbeat: Instant,
    pub status: WorkerStatus,

    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,

    /// Delivered to the worker on its next heartbeat/poll.
    pub cancel_queue: Vec<TaskId>,
    pub collect_queue: Vec<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AttemptInfo {
    pub attempt: u32,
    pub worker_id: WorkerId,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
    pub state: AttemptState,
    pub speculative: bool,
}

/// Coordinator-side bookkeeping for one task. Attempts are totally ordered
/// by number; results below `min_accepted_attempt` are superseded and get
/// discarded even if they arrive late.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub task_id: TaskId,
    pub partition_index: u32,

    /// Map tasks: the input partition. None for reduce tasks.
    pub input_path: Option<String>,
    /// Reduce tasks: one block per upstream map task, set at admission.
    pub map_inputs: Vec<BlockLocation>,
    /// Reduce tasks: final output partition path.
    pub output_path: Option<String>,

    pub attempts: Vec<AttemptInfo>,
    pub next_attempt: u32,
    pub min_accepted_attempt: u32,
    /// Failures counted against the attempt budget. Checksum-mismatch
    /// requeues and cancellations are not charged.
    pub charged_failures: u32,
    /// An attempt is waiting for assignment.
    pub pending: bool,
    /// The next pending attempt races an already-running one.
    pub next_is_speculative: bool,

    /// Attempt whose result was committed ("exactly one winning attempt").
    pub winner: Option<u32>,
    /// Committed shuffle blocks (map tasks only).
    pub blocks: Vec<BlockLocation>,
    pub last_error: Option<String>,
}

impl TaskEntry {
    fn new(task_id: TaskId, partition_index: u32) -> Self {
        Self {
            task_id,
            partition_index,
            input_path: None,
            map_inputs: Vec::new(),
            output_path: None,
            attempts: Vec::new(),
            next_attempt: 0,
            min_accepted_attempt: 0,
            charged_failures: 0,
            pending: true,
            next_is_speculative: false,
            winner: None,
            blocks: Vec::new(),
            last_error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.winner.is_some()
    }

    pub fn running_attempts(&self) -> impl Iterator<Item = &AttemptInfo> {
        self.attempts
            .iter()
            .filter(|a| a.state == AttemptState::Running)
    }

    fn has_running_on(&self, worker_id: &str) -> bool {
        self.running_attempts().any(|a| a.worker_id == worker_id)
    }

    /// Drop the committed result so a fresh attempt replaces it. Earlier
    /// attempts can no longer commit.
    fn supersede(&mut self) {
        self.winner = None;
        self.blocks.clear();
        self.min_accepted_attempt = self.next_attempt;
        self.pending = true;
        self.next_is_speculative = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Upstream stages have not all succeeded yet.
    Waiting,
    /// Admitted: tasks are eligible for assignment.
    Runnable,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct StageState {
    pub stage_id: StageId,
    pub kind: StageKind,
    pub upstream: Vec<StageId>,
    pub status: StageStatus,
    pub tasks: Vec<TaskEntry>,
}

impl StageState {
    fn all_tasks_succeeded(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.succeeded())
    }
}

#[derive(Debug, Clone)]
pub struct JobState {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub input_glob: String,
    pub output_dir: String,
    pub num_reduce_partitions: u32,

    pub stage_order: Vec<StageId>,
    pub stages: HashMap<StageId, StageState>,

    pub submitted_at: chrono::DateTime<Utc>,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub finished_at: Option<chrono::DateTime<Utc>>,
    pub retries: u32,
    pub last_error: Option<String>,
}

impl JobState {
    pub fn info(&self) -> JobInfo {
        let stages = self
            .stage_order
            .iter()
            .filter_map(|id| self.stages.get(id))
            .map(|s| StageProgress {
                stage_id: s.stage_id.clone(),
                total_tasks: s.tasks.len() as u32,
                succeeded_tasks: s.tasks.iter().filter(|t| t.succeeded()).count() as u32,
                running_tasks: s
                    .tasks
                    .iter()
                    .map(|t| t.running_attempts().count() as u32)
                    .sum(),
            })
            .collect();

        JobInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            output_dir: self.output_dir.clone(),
            stages,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            retries: self.retries,
            last_error: self.last_error.clone(),
        }
    }

    fn all_stages_succeeded(&self) -> bool {
        self.stages
            .values()
            .all(|s| s.status == StageStatus::Succeeded)
    }
}

/// The whole mutable cluster state behind one lock. Handlers and the
/// scheduling loop serialize every mutation through it; there is no other
/// shared mutable state in the coordinator.
pub struct CoordinatorState {
    pub config: SchedulerConfig,
    pub jobs: HashMap<JobId, JobState>,
    pub workers: HashMap<WorkerId, WorkerMeta>,
    task_index: HashMap<TaskId, (JobId, StageId)>,
}

pub type SharedState = Arc<Mutex<CoordinatorState>>;

pub fn shared(config: SchedulerConfig) -> SharedState {
    Arc::new(Mutex::new(CoordinatorState::new(config)))
}

impl CoordinatorState {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            jobs: HashMap::new(),
            workers: HashMap::new(),
            task_index: HashMap::new(),
        }
    }

    /* ---------------- job submission / queries ---------------- */

    /// Validate the stage DAG and build the per-stage task tables.
    /// `inputs` are the already-expanded matches of the job's input glob;
    /// each becomes one map partition.
    pub fn submit_job(&mut self, spec: JobSpec, inputs: Vec<String>) -> Result<JobInfo> {
        if spec.num_reduce_partitions == 0 {
            return Err(EngineError::InvalidJob(
                "num_reduce_partitions must be at least 1".to_string(),
            ));
        }
        let stage_order = common::dag::validate(&spec.stages)?;

        let job_id = uuid::Uuid::new_v4().to_string();
        let job_output_dir = format!("{}/{}", spec.output_dir.trim_end_matches('/'), job_id);

        let mut stages: HashMap<StageId, StageState> = HashMap::new();
        for stage_spec in &spec.stages {
            let mut tasks = Vec::new();
            match &stage_spec.kind {
                StageKind::Map { .. } => {
                    for (i, input) in inputs.iter().enumerate() {
                        let mut task = TaskEntry::new(uuid::Uuid::new_v4().to_string(), i as u32);
                        task.input_path = Some(input.clone());
                        tasks.push(task);
                    }
                }
                StageKind::Reduce { .. } => {
                    for p in 0..spec.num_reduce_partitions {
                        let mut task = TaskEntry::new(uuid::Uuid::new_v4().to_string(), p);
                        task.output_path = Some(format!(
                            "{}/{}-part-{:05}.csv",
                            job_output_dir, stage_spec.id, p
                        ));
                        tasks.push(task);
                    }
                }
            }
            for task in &tasks {
                self.task_index
                    .insert(task.task_id.clone(), (job_id.clone(), stage_spec.id.clone()));
            }
            stages.insert(
                stage_spec.id.clone(),
                StageState {
                    stage_id: stage_spec.id.clone(),
                    kind: stage_spec.kind.clone(),
                    upstream: stage_spec.upstream.clone(),
                    status: StageStatus::Waiting,
                    tasks,
                },
            );
        }

        // No input files: nothing to run, the job trivially succeeds.
        let empty = inputs.is_empty();
        let mut job = JobState {
            id: job_id.clone(),
            name: spec.name,
            status: if empty {
                JobStatus::Succeeded
            } else {
                JobStatus::Pending
            },
            input_glob: spec.input_glob,
            output_dir: job_output_dir,
            num_reduce_partitions: spec.num_reduce_partitions,
            stage_order,
            stages,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: if empty { Some(Utc::now()) } else { None },
            retries: 0,
            last_error: None,
        };

        if job.status == JobStatus::Pending {
            admit_ready_stages(&mut job);
        }

        info!(
            "job {} submitted ({} stages, {} input partitions)",
            job.id,
            job.stage_order.len(),
            inputs.len()
        );
        let snapshot = job.info();
        self.jobs.insert(job_id, job);
        Ok(snapshot)
    }

    pub fn job_info(&self, job_id: &str) -> Option<JobInfo> {
        self.jobs.get(job_id).map(|j| j.info())
    }

    pub fn cancel_job(&mut self, job_id: &str) -> Option<JobInfo> {
        let job = self.jobs.get_mut(job_id)?;
        if !job.status.is_terminal() {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(Utc::now());
            let mut actions = drain_running_attempts(job);
            for (shuffle_url, map_task_id) in shuffle_gc_targets(job) {
                actions.push(WorkerAction::CollectShuffle {
                    shuffle_url,
                    map_task_id,
                });
            }
            apply_worker_actions(&mut self.workers, actions);
            info!("job {} cancelled", job_id);
        }
        Some(job.info())
    }

    /* ---------------- worker membership ---------------- */

    pub fn register_worker(&mut self, req: WorkerRegisterRequest) -> WorkerRegisterResponse {
        let worker_id = uuid::Uuid::new_v4().to_string();
        info!(
            "worker {} registered ({}, slots={})",
            worker_id, req.hostname, req.slots
        );
        self.workers.insert(
            worker_id.clone(),
            WorkerMeta {
                hostname: req.hostname,
                shuffle_url: req.shuffle_url,
                slots: req.slots.max(1),
                last_heartbeat: Instant::now(),
                status: WorkerStatus::Alive,
                cpu_percent: None,
                mem_bytes: None,
                tasks_started: 0,
                tasks_succeeded: 0,
                tasks_failed: 0,
                cancel_queue: Vec::new(),
                collect_queue: Vec::new(),
            },
        );
        WorkerRegisterResponse { worker_id }
    }

    pub fn heartbeat(&mut self, req: WorkerHeartbeatRequest) -> Option<WorkerHeartbeatResponse> {
        let meta = self.workers.get_mut(&req.worker_id)?;
        meta.last_heartbeat = Instant::now();
        meta.status = WorkerStatus::Alive;
        meta.cpu_percent = req.cpu_percent;
        meta.mem_bytes = req.mem_bytes;
        Some(WorkerHeartbeatResponse {
            ok: true,
            cancel_tasks: std::mem::take(&mut meta.cancel_queue),
            collect_shuffle: std::mem::take(&mut meta.collect_queue),
        })
    }

    pub fn workers_view(&self) -> Vec<WorkerView> {
        let now = Instant::now();
        let mut active: HashMap<String, u32> = HashMap::new();
        for job in self.jobs.values() {
            for stage in job.stages.values() {
                for task in &stage.tasks {
                    for a in task.running_attempts() {
                        *active.entry(a.worker_id.clone()).or_insert(0) += 1;
                    }
                }
            }
        }
        self.workers
            .iter()
            .map(|(id, meta)| WorkerView {
                worker_id: id.clone(),
                hostname: meta.hostname.clone(),
                shuffle_url: meta.shuffle_url.clone(),
                status: meta.status,
                slots: meta.slots,
                last_heartbeat_secs_ago: now
                    .saturating_duration_since(meta.last_heartbeat)
                    .as_secs(),
                active_tasks: active.get(id).copied().unwrap_or(0),
                tasks_started: meta.tasks_started,
                tasks_succeeded: meta.tasks_succeeded,
                tasks_failed: meta.tasks_failed,
                cpu_percent: meta.cpu_percent,
                mem_bytes: meta.mem_bytes,
            })
            .collect()
    }

    fn running_count_on(&self, worker_id: &str) -> u32 {
        self.jobs
            .values()
            .flat_map(|j| j.stages.values())
            .flat_map(|s| s.tasks.iter())
            .map(|t| {
                t.running_attempts()
                    .filter(|a| a.worker_id == worker_id)
                    .count() as u32
            })
            .sum()
    }

    /* ---------------- task assignment ---------------- */

    /// Hand out one pending task to the polling worker, if it has a free
    /// slot. Locality: prefer the task with the most input blocks already
    /// on this worker. A worker never holds two live attempts of the same
    /// task.
    pub fn poll_task(&mut self, worker_id: &str) -> Option<TaskPollResponse> {
        let (alive, slots, shuffle_url, cancels) = {
            let meta = self.workers.get_mut(worker_id)?;
            (
                meta.status == WorkerStatus::Alive,
                meta.slots,
                meta.shuffle_url.clone(),
                std::mem::take(&mut meta.cancel_queue),
            )
        };
        if !alive || self.running_count_on(worker_id) >= slots {
            return Some(TaskPollResponse {
                task: None,
                cancel_tasks: cancels,
            });
        }

        // Pick (job, stage, task) with the best locality score.
        let mut best: Option<(JobId, StageId, usize, usize)> = None;
        for (job_id, job) in &self.jobs {
            if job.status.is_terminal() {
                continue;
            }
            for stage_id in &job.stage_order {
                let stage = &job.stages[stage_id];
                if stage.status != StageStatus::Runnable {
                    continue;
                }
                for (idx, task) in stage.tasks.iter().enumerate() {
                    if !task.pending || task.has_running_on(worker_id) {
                        continue;
                    }
                    let score = task
                        .map_inputs
                        .iter()
                        .filter(|b| b.worker_url == shuffle_url)
                        .count();
                    if best.as_ref().map(|(_, _, _, s)| score > *s).unwrap_or(true) {
                        best = Some((job_id.clone(), stage_id.clone(), idx, score));
                    }
                }
            }
        }

        let (job_id, stage_id, task_idx, _) = match best {
            Some(b) => b,
            None => {
                return Some(TaskPollResponse {
                    task: None,
                    cancel_tasks: cancels,
                })
            }
        };

        let job = self.jobs.get_mut(&job_id)?;
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        }
        let num_reduce = job.num_reduce_partitions;
        let stage = job.stages.get_mut(&stage_id)?;
        let kind_spec = stage.kind.clone();
        let task = &mut stage.tasks[task_idx];

        let attempt = task.next_attempt;
        task.next_attempt += 1;
        task.pending = false;
        let speculative = task.next_is_speculative;
        task.next_is_speculative = false;
        task.attempts.push(AttemptInfo {
            attempt,
            worker_id: worker_id.to_string(),
            started_at: Instant::now(),
            finished_at: None,
            state: AttemptState::Running,
            speculative,
        });

        let kind = match kind_spec {
            StageKind::Map { function } => TaskKind::Map {
                function,
                input_path: task.input_path.clone().unwrap_or_default(),
                num_reduce_partitions: num_reduce,
            },
            StageKind::Reduce { function } => TaskKind::Reduce {
                function,
                map_inputs: task.map_inputs.clone(),
                output_path: task.output_path.clone().unwrap_or_default(),
            },
        };
        let spec = TaskSpec {
            id: task.task_id.clone(),
            job_id: job_id.clone(),
            stage_id: stage_id.clone(),
            partition_index: task.partition_index,
            attempt,
            kind,
        };

        if let Some(meta) = self.workers.get_mut(worker_id) {
            meta.tasks_started += 1;
        }
        info!(
            "assigned task {} attempt {} (job={} stage={}{}) to worker {}",
            spec.id,
            attempt,
            job_id,
            stage_id,
            if speculative { ", speculative" } else { "" },
            worker_id
        );
        Some(TaskPollResponse {
            task: Some(spec),
            cancel_tasks: cancels,
        })
    }

    /* ---------------- task completion ---------------- */

    /// Handle a completion report. Duplicate and superseded results are
    /// discarded; the first accepted success commits the attempt.
    pub fn complete_task(&mut self, req: TaskCompleteRequest) -> bool {
        let (job_id, stage_id) = match self.task_index.get(&req.task_id) {
            Some(pair) => pair.clone(),
            None => return false,
        };
        let config = self.config.clone();
        let job = match self.jobs.get_mut(&job_id) {
            Some(j) => j,
            None => return false,
        };
        if job.status.is_terminal() {
            // Bookkeeping already freed; accept and drop the report.
            return true;
        }

        let mut actions: Vec<WorkerAction> = Vec::new();
        match req.outcome {
            TaskOutcome::Success { blocks, .. } => {
                handle_success(job, &stage_id, &req.task_id, req.attempt, blocks, &mut actions);
            }
            TaskOutcome::Failure { kind, message } => {
                handle_failure(
                    job,
                    &stage_id,
                    &req.task_id,
                    req.attempt,
                    kind,
                    message,
                    &config,
                    &mut actions,
                );
            }
        }
        apply_worker_actions(&mut self.workers, actions);
        true
    }

    /* ---------------- scheduling tick ---------------- */

    /// One pass of the scheduling loop: liveness sweep, dead-worker drain,
    /// stage admission and straggler speculation. All liveness decisions
    /// happen here, on one consistent timeline.
    pub fn tick(&mut self, now: Instant) {
        let config = self.config.clone();

        // 1) Liveness from heartbeat age.
        let mut newly_dead: Vec<(WorkerId, String)> = Vec::new();
        for (id, meta) in self.workers.iter_mut() {
            let age = now.saturating_duration_since(meta.last_heartbeat);
            match meta.status {
                WorkerStatus::Dead => {}
                _ if age > config.dead_timeout => {
                    meta.status = WorkerStatus::Dead;
                    warn!("worker {} marked DEAD (no heartbeat for {:?})", id, age);
                    newly_dead.push((id.clone(), meta.shuffle_url.clone()));
                }
                WorkerStatus::Alive if age > config.suspect_timeout => {
                    meta.status = WorkerStatus::Suspected;
                }
                _ => {}
            }
        }

        // 2) Drain dead workers: fail their running attempts, supersede map
        //    outputs only they were serving.
        let mut actions: Vec<WorkerAction> = Vec::new();
        for (dead_id, dead_url) in &newly_dead {
            for job in self.jobs.values_mut() {
                if job.status.is_terminal() {
                    continue;
                }
                drain_dead_worker(job, dead_id, dead_url, &config, &mut actions);
            }
        }
        apply_worker_actions(&mut self.workers, actions);

        // 3) Stage admission, straggler speculation, job completion.
        let mut actions: Vec<WorkerAction> = Vec::new();
        for job in self.jobs.values_mut() {
            if job.status.is_terminal() {
                continue;
            }
            admit_ready_stages(job);
            speculate_stragglers(job, now, &config);
            finish_job_if_done(job, &mut actions);
        }
        apply_worker_actions(&mut self.workers, actions);
    }
}

/* ---------------- worker side effects ---------------- */

/// Deferred mutations of the worker table, collected while a job is
/// mutably borrowed and applied afterwards.
pub enum WorkerAction {
    Cancel {
        worker_id: WorkerId,
        task_id: TaskId,
    },
    CountSuccess {
        worker_id: WorkerId,
    },
    CountFailure {
        worker_id: WorkerId,
    },
    CollectShuffle {
        shuffle_url: String,
        map_task_id: TaskId,
    },
}

fn apply_worker_actions(workers: &mut HashMap<WorkerId, WorkerMeta>, actions: Vec<WorkerAction>) {
    for action in actions {
        match action {
            WorkerAction::Cancel { worker_id, task_id } => {
                if let Some(meta) = workers.get_mut(&worker_id) {
                    meta.cancel_queue.push(task_id);
                }
            }
            WorkerAction::CountSuccess { worker_id } => {
                if let Some(meta) = workers.get_mut(&worker_id) {
                    meta.tasks_succeeded += 1;
                }
            }
            WorkerAction::CountFailure { worker_id } => {
                if let Some(meta) = workers.get_mut(&worker_id) {
                    meta.tasks_failed += 1;
                }
            }
            WorkerAction::CollectShuffle {
                shuffle_url,
                map_task_id,
            } => {
                if let Some(meta) = workers.values_mut().find(|m| m.shuffle_url == shuffle_url) {
                    meta.collect_queue.push(map_task_id);
                }
            }
        }
    }
}

/// (shuffle_url, map task id) pairs whose blocks are now collectible.
fn shuffle_gc_targets(job: &JobState) -> Vec<(String, TaskId)> {
    let mut out = Vec::new();
    for stage in job.stages.values() {
        if !stage.kind.is_map() {
            continue;
        }
        for task in &stage.tasks {
            for block in &task.blocks {
                out.push((block.worker_url.clone(), task.task_id.clone()));
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

/// Cancel every running attempt of the job; returns the worker actions.
fn drain_running_attempts(job: &mut JobState) -> Vec<WorkerAction> {
    let mut actions = Vec::new();
    for stage in job.stages.values_mut() {
        for task in stage.tasks.iter_mut() {
            for attempt in task.attempts.iter_mut() {
                if attempt.state == AttemptState::Running {
                    attempt.state = AttemptState::Cancelled;
                    attempt.finished_at = Some(Instant::now());
                    actions.push(WorkerAction::Cancel {
                        worker_id: attempt.worker_id.clone(),
                        task_id: task.task_id.clone(),
                    });
                }
            }
            task.pending = false;
        }
    }
    actions
}

/* ---------------- completion handling ---------------- */

fn handle_success(
    job: &mut JobState,
    stage_id: &str,
    task_id: &str,
    attempt_no: u32,
    blocks: Vec<BlockLocation>,
    actions: &mut Vec<WorkerAction>,
) {
    let job_id = job.id.clone();
    let stage = match job.stages.get_mut(stage_id) {
        Some(s) => s,
        None => return,
    };
    let task = match stage.tasks.iter_mut().find(|t| t.task_id == task_id) {
        Some(t) => t,
        None => return,
    };
    let worker_id = match task.attempts.iter().find(|a| a.attempt == attempt_no) {
        Some(a) => a.worker_id.clone(),
        None => return,
    };

    // Exactly-one-winning-attempt: late or superseded successes are dropped.
    if task.succeeded() || attempt_no < task.min_accepted_attempt {
        info!(
            "discarding stale success of task {} attempt {} (winner={:?})",
            task_id, attempt_no, task.winner
        );
        if let Some(a) = task.attempts.iter_mut().find(|a| a.attempt == attempt_no) {
            if a.state == AttemptState::Running {
                a.state = AttemptState::Cancelled;
                a.finished_at = Some(Instant::now());
            }
        }
        return;
    }

    task.winner = Some(attempt_no);
    task.blocks = blocks;
    task.pending = false;
    task.next_is_speculative = false;
    if let Some(a) = task.attempts.iter_mut().find(|a| a.attempt == attempt_no) {
        a.state = AttemptState::Succeeded;
        a.finished_at = Some(Instant::now());
    }
    actions.push(WorkerAction::CountSuccess { worker_id });

    // The loser of a speculative race is cancelled, its output discarded.
    for a in task.attempts.iter_mut() {
        if a.state == AttemptState::Running {
            a.state = AttemptState::Cancelled;
            a.finished_at = Some(Instant::now());
            actions.push(WorkerAction::Cancel {
                worker_id: a.worker_id.clone(),
                task_id: task.task_id.clone(),
            });
        }
    }

    if stage.all_tasks_succeeded() && stage.status == StageStatus::Runnable {
        stage.status = StageStatus::Succeeded;
        info!("stage {} of job {} succeeded", stage_id, job_id);
    }

    admit_ready_stages(job);
    finish_job_if_done(job, actions);
}

#[allow(clippy::too_many_arguments)]
fn handle_failure(
    job: &mut JobState,
    stage_id: &str,
    task_id: &str,
    attempt_no: u32,
    kind: TaskErrorKind,
    message: String,
    config: &SchedulerConfig,
    actions: &mut Vec<WorkerAction>,
) {
    let stage = match job.stages.get_mut(stage_id) {
        Some(s) => s,
        None => return,
    };
    let task = match stage.tasks.iter_mut().find(|t| t.task_id == task_id) {
        Some(t) => t,
        None => return,
    };
    let attempt = match task.attempts.iter_mut().find(|a| a.attempt == attempt_no) {
        Some(a) => a,
        None => return,
    };
    if attempt.state != AttemptState::Running {
        return; // duplicate report
    }
    attempt.state = AttemptState::Failed;
    attempt.finished_at = Some(Instant::now());
    let worker_id = attempt.worker_id.clone();
    actions.push(WorkerAction::CountFailure { worker_id });

    match kind {
        TaskErrorKind::Cancelled => {
            // Expected after a cancel signal; nothing to recover.
        }
        TaskErrorKind::ChecksumMismatch { map_task_id } => {
            // The consumer is fine; the producer's block is corrupt.
            // Re-execute the producing map task and re-run this task once
            // fresh blocks exist. Neither is charged against its budget.
            if !task.succeeded() {
                task.pending = true;
                task.min_accepted_attempt = task.next_attempt;
            }
            warn!(
                "task {} hit checksum mismatch on block of map task {}; recycling producer",
                task_id, map_task_id
            );
            job.retries += 1;
            supersede_map_task(job, &map_task_id);
        }
        TaskErrorKind::Execution | TaskErrorKind::ShuffleFetch => {
            task.charged_failures += 1;
            task.last_error = Some(message.clone());
            if task.charged_failures >= config.max_task_attempts {
                warn!(
                    "task {} exhausted {} attempts; failing job {}",
                    task_id, config.max_task_attempts, job.id
                );
                fail_job(job, message, actions);
            } else {
                job.retries += 1;
                task.pending = true;
                info!(
                    "re-queuing task {} as attempt {} ({})",
                    task_id, task.next_attempt, message
                );
            }
        }
    }
}

/// Drop a map task's committed output and schedule a fresh attempt.
/// Downstream stages fall back to Waiting until the producer stage
/// re-succeeds with new block locations.
fn supersede_map_task(job: &mut JobState, map_task_id: &str) {
    let mut producer_stage: Option<StageId> = None;
    for stage in job.stages.values_mut() {
        if let Some(task) = stage.tasks.iter_mut().find(|t| t.task_id == map_task_id) {
            task.supersede();
            if stage.status == StageStatus::Succeeded {
                stage.status = StageStatus::Runnable;
            }
            producer_stage = Some(stage.stage_id.clone());
            break;
        }
    }
    let producer_stage = match producer_stage {
        Some(s) => s,
        None => return,
    };
    for stage in job.stages.values_mut() {
        if stage.upstream.contains(&producer_stage) && stage.status == StageStatus::Runnable {
            stage.status = StageStatus::Waiting;
        }
    }
}

fn fail_job(job: &mut JobState, error: String, actions: &mut Vec<WorkerAction>) {
    job.status = JobStatus::Failed;
    job.finished_at = Some(Utc::now());
    job.last_error = Some(error);
    for stage in job.stages.values_mut() {
        if matches!(stage.status, StageStatus::Runnable | StageStatus::Waiting) {
            stage.status = StageStatus::Failed;
        }
    }
    actions.extend(drain_running_attempts(job));
    for (shuffle_url, map_task_id) in shuffle_gc_targets(job) {
        actions.push(WorkerAction::CollectShuffle {
            shuffle_url,
            map_task_id,
        });
    }
}

/* ---------------- admission / speculation / completion ---------------- */

/// Admit every Waiting stage whose upstreams all succeeded. Reduce tasks
/// get their input block list materialized from the upstream map tasks'
/// committed blocks at this point.
fn admit_ready_stages(job: &mut JobState) {
    let order = job.stage_order.clone();
    for stage_id in order {
        let ready = {
            let stage = &job.stages[&stage_id];
            stage.status == StageStatus::Waiting
                && stage
                    .upstream
                    .iter()
                    .all(|u| job.stages[u].status == StageStatus::Succeeded)
        };
        if !ready {
            continue;
        }

        // Gather upstream blocks per reduce partition before borrowing the
        // stage mutably.
        let upstream = job.stages[&stage_id].upstream.clone();
        let mut blocks_by_partition: HashMap<u32, Vec<BlockLocation>> = HashMap::new();
        for up_id in &upstream {
            for map_task in &job.stages[up_id].tasks {
                for block in &map_task.blocks {
                    blocks_by_partition
                        .entry(block.reduce_partition)
                        .or_default()
                        .push(block.clone());
                }
            }
        }

        let job_id = job.id.clone();
        let stage = job.stages.get_mut(&stage_id).expect("known stage");
        stage.status = StageStatus::Runnable;
        if !stage.kind.is_map() {
            for task in stage.tasks.iter_mut() {
                if task.succeeded() {
                    continue;
                }
                task.map_inputs = blocks_by_partition
                    .get(&task.partition_index)
                    .cloned()
                    .unwrap_or_default();
                task.pending = true;
            }
        }
        info!("stage {} of job {} admitted", stage_id, job_id);
    }
}

/// Launch a second attempt for attempts running far beyond the median of
/// completed attempts in their stage.
fn speculate_stragglers(job: &mut JobState, now: Instant, config: &SchedulerConfig) {
    for stage in job.stages.values_mut() {
        if stage.status != StageStatus::Runnable {
            continue;
        }
        let mut durations: Vec<Duration> = stage
            .tasks
            .iter()
            .flat_map(|t| t.attempts.iter())
            .filter(|a| a.state == AttemptState::Succeeded)
            .filter_map(|a| {
                a.finished_at
                    .map(|f| f.saturating_duration_since(a.started_at))
            })
            .collect();
        if durations.len() < config.speculation_min_completed {
            continue;
        }
        durations.sort();
        let median = durations[durations.len() / 2];
        let threshold = median
            .mul_f64(config.speculation_multiplier)
            .max(config.speculation_min_runtime);

        for task in stage.tasks.iter_mut() {
            if task.succeeded() || task.pending {
                continue;
            }
            let running: Vec<Instant> = task.running_attempts().map(|a| a.started_at).collect();
            // Only a single live attempt may be doubled; never triple up.
            if running.len() != 1 {
                continue;
            }
            let elapsed = now.saturating_duration_since(running[0]);
            if elapsed > threshold {
                info!(
                    "speculating task {} (running {:?}, stage median {:?})",
                    task.task_id, elapsed, median
                );
                task.pending = true;
                task.next_is_speculative = true;
            }
        }
    }
}

fn finish_job_if_done(job: &mut JobState, actions: &mut Vec<WorkerAction>) {
    if job.status.is_terminal() || !job.all_stages_succeeded() {
        return;
    }
    job.status = JobStatus::Succeeded;
    job.finished_at = Some(Utc::now());
    info!("job {} succeeded", job.id);
    // Every downstream consumer is done: the job's shuffle blocks can go.
    for (shuffle_url, map_task_id) in shuffle_gc_targets(job) {
        actions.push(WorkerAction::CollectShuffle {
            shuffle_url,
            map_task_id,
        });
    }
}

/// A dead worker takes down its running attempts and the shuffle blocks it
/// was serving. Succeeded map tasks whose blocks lived there are superseded
/// so the data gets recreated, unless every consumer already finished.
fn drain_dead_worker(
    job: &mut JobState,
    dead_worker_id: &str,
    dead_shuffle_url: &str,
    config: &SchedulerConfig,
    actions: &mut Vec<WorkerAction>,
) {
    let mut failed_out: Vec<(StageId, TaskId, u32)> = Vec::new();
    for stage in job.stages.values() {
        for task in &stage.tasks {
            for a in task.attempts.iter() {
                if a.state == AttemptState::Running && a.worker_id == dead_worker_id {
                    failed_out.push((stage.stage_id.clone(), task.task_id.clone(), a.attempt));
                }
            }
        }
    }
    for (stage_id, task_id, attempt) in failed_out {
        handle_failure(
            job,
            &stage_id,
            &task_id,
            attempt,
            TaskErrorKind::Execution,
            format!("worker {dead_worker_id} died"),
            config,
            actions,
        );
    }
    if job.status.is_terminal() {
        return;
    }

    // Committed map outputs served by the dead worker are unreachable.
    let lost: Vec<TaskId> = job
        .stages
        .values()
        .filter(|s| s.kind.is_map() && consumers_not_done(job, &s.stage_id))
        .flat_map(|s| s.tasks.iter())
        .filter(|t| t.succeeded() && t.blocks.iter().any(|b| b.worker_url == dead_shuffle_url))
        .map(|t| t.task_id.clone())
        .collect();
    for map_task_id in lost {
        warn!(
            "map task {} lost its shuffle blocks with worker {}; re-executing",
            map_task_id, dead_worker_id
        );
        job.retries += 1;
        supersede_map_task(job, &map_task_id);
    }
}

fn consumers_not_done(job: &JobState, stage_id: &str) -> bool {
    job.stages
        .values()
        .any(|s| s.upstream.iter().any(|u| u == stage_id) && s.status != StageStatus::Succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::functions::{MapFn, ReduceFn};
    use common::StageSpec;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            max_task_attempts: 3,
            suspect_timeout: Duration::from_secs(10),
            dead_timeout: Duration::from_secs(20),
            speculation_multiplier: 2.0,
            speculation_min_completed: 1,
            speculation_min_runtime: Duration::from_secs(0),
        }
    }

    fn wordcount_spec(reduce_partitions: u32) -> JobSpec {
        JobSpec {
            name: "wordcount".to_string(),
            stages: vec![
                StageSpec {
                    id: "tokenize".to_string(),
                    kind: StageKind::Map {
                        function: MapFn::TokenizeCount,
                    },
                    upstream: vec![],
                },
                StageSpec {
                    id: "sum".to_string(),
                    kind: StageKind::Reduce {
                        function: ReduceFn::SumByKey,
                    },
                    upstream: vec!["tokenize".to_string()],
                },
            ],
            input_glob: "/data/*.txt".to_string(),
            output_dir: "/out".to_string(),
            num_reduce_partitions: reduce_partitions,
        }
    }

    fn register(state: &mut CoordinatorState, host: &str, slots: u32) -> WorkerId {
        state
            .register_worker(WorkerRegisterRequest {
                hostname: host.to_string(),
                shuffle_url: format!("http://{host}:8090"),
                slots,
            })
            .worker_id
    }

    fn blocks_for(spec: &TaskSpec, worker_url: &str, partitions: u32) -> Vec<BlockLocation> {
        (0..partitions)
            .map(|p| BlockLocation {
                map_task_id: spec.id.clone(),
                reduce_partition: p,
                worker_url: worker_url.to_string(),
                checksum: 42,
                len: 128,
            })
            .collect()
    }

    fn succeed(state: &mut CoordinatorState, worker_id: &str, spec: &TaskSpec, blocks: Vec<BlockLocation>) {
        let accepted = state.complete_task(TaskCompleteRequest {
            worker_id: worker_id.to_string(),
            task_id: spec.id.clone(),
            attempt: spec.attempt,
            outcome: TaskOutcome::Success {
                blocks,
                output_path: None,
            },
        });
        assert!(accepted);
    }

    fn fail(
        state: &mut CoordinatorState,
        worker_id: &str,
        spec: &TaskSpec,
        kind: TaskErrorKind,
    ) {
        state.complete_task(TaskCompleteRequest {
            worker_id: worker_id.to_string(),
            task_id: spec.id.clone(),
            attempt: spec.attempt,
            outcome: TaskOutcome::Failure {
                kind,
                message: "boom".to_string(),
            },
        });
    }

    fn poll(state: &mut CoordinatorState, worker_id: &str) -> Option<TaskSpec> {
        state.poll_task(worker_id).and_then(|r| r.task)
    }

    #[test]
    fn rejects_invalid_dag_on_submit() {
        let mut state = CoordinatorState::new(test_config());
        let mut spec = wordcount_spec(2);
        spec.stages[1].upstream = vec!["nope".to_string()];
        let err = state
            .submit_job(spec, vec!["/data/a.txt".to_string()])
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidJob(_)));
    }

    #[test]
    fn rejects_zero_reduce_partitions() {
        let mut state = CoordinatorState::new(test_config());
        let err = state
            .submit_job(wordcount_spec(0), vec!["/data/a.txt".to_string()])
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidJob(_)));
    }

    #[test]
    fn empty_input_succeeds_immediately() {
        let mut state = CoordinatorState::new(test_config());
        let info = state.submit_job(wordcount_spec(2), vec![]).unwrap();
        assert_eq!(info.status, JobStatus::Succeeded);
    }

    #[test]
    fn wordcount_runs_map_then_reduce_to_completion() {
        let mut state = CoordinatorState::new(test_config());
        let worker = register(&mut state, "w1", 4);
        let worker_url = state.workers[&worker].shuffle_url.clone();
        let info = state
            .submit_job(
                wordcount_spec(2),
                vec!["/data/a.txt".to_string(), "/data/b.txt".to_string()],
            )
            .unwrap();

        // Map stage is admitted at submission; reduce waits for it.
        let m1 = poll(&mut state, &worker).unwrap();
        let m2 = poll(&mut state, &worker).unwrap();
        assert!(matches!(m1.kind, TaskKind::Map { .. }));
        assert_eq!(m1.stage_id, "tokenize");
        assert_ne!(m1.id, m2.id);
        assert!(poll(&mut state, &worker).is_none());

        let b1 = blocks_for(&m1, &worker_url, 2);
        let b2 = blocks_for(&m2, &worker_url, 2);
        succeed(&mut state, &worker, &m1, b1);
        succeed(&mut state, &worker, &m2, b2);

        // Reduce tasks carry one block per upstream map task.
        let r1 = poll(&mut state, &worker).unwrap();
        let r2 = poll(&mut state, &worker).unwrap();
        for r in [&r1, &r2] {
            match &r.kind {
                TaskKind::Reduce { map_inputs, .. } => {
                    assert_eq!(map_inputs.len(), 2);
                    assert!(map_inputs
                        .iter()
                        .all(|b| b.reduce_partition == r.partition_index));
                }
                other => panic!("expected reduce task, got {other:?}"),
            }
        }
        succeed(&mut state, &worker, &r1, vec![]);
        succeed(&mut state, &worker, &r2, vec![]);

        let info = state.job_info(&info.id).unwrap();
        assert_eq!(info.status, JobStatus::Succeeded);
        assert!(info.finished_at.is_some());

        // Shuffle blocks of both map tasks are queued for collection.
        let meta = &state.workers[&worker];
        assert_eq!(meta.collect_queue.len(), 2);
        assert!(meta.collect_queue.contains(&m1.id));
        assert_eq!(meta.tasks_succeeded, 4);
    }

    #[test]
    fn respects_worker_slots() {
        let mut state = CoordinatorState::new(test_config());
        let worker = register(&mut state, "w1", 1);
        state
            .submit_job(
                wordcount_spec(1),
                vec!["/data/a.txt".to_string(), "/data/b.txt".to_string()],
            )
            .unwrap();
        assert!(poll(&mut state, &worker).is_some());
        assert!(poll(&mut state, &worker).is_none());
    }

    #[test]
    fn execution_failure_requeues_with_bumped_attempt() {
        let mut state = CoordinatorState::new(test_config());
        let worker = register(&mut state, "w1", 2);
        let info = state
            .submit_job(wordcount_spec(1), vec!["/data/a.txt".to_string()])
            .unwrap();

        let first = poll(&mut state, &worker).unwrap();
        assert_eq!(first.attempt, 0);
        fail(&mut state, &worker, &first, TaskErrorKind::Execution);

        let retry = poll(&mut state, &worker).unwrap();
        assert_eq!(retry.id, first.id);
        assert_eq!(retry.attempt, 1);
        let info = state.job_info(&info.id).unwrap();
        assert_eq!(info.status, JobStatus::Running);
        assert_eq!(info.retries, 1);
    }

    #[test]
    fn exhausted_attempts_fail_the_job() {
        let mut config = test_config();
        config.max_task_attempts = 2;
        let mut state = CoordinatorState::new(config);
        let worker = register(&mut state, "w1", 2);
        let info = state
            .submit_job(wordcount_spec(1), vec!["/data/a.txt".to_string()])
            .unwrap();

        for _ in 0..2 {
            let spec = poll(&mut state, &worker).unwrap();
            fail(&mut state, &worker, &spec, TaskErrorKind::Execution);
        }
        let info = state.job_info(&info.id).unwrap();
        assert_eq!(info.status, JobStatus::Failed);
        assert!(info.last_error.is_some());
        assert!(poll(&mut state, &worker).is_none());
    }

    #[test]
    fn dead_worker_attempts_are_requeued() {
        let mut state = CoordinatorState::new(test_config());
        let w1 = register(&mut state, "w1", 2);
        let w2 = register(&mut state, "w2", 2);
        state
            .submit_job(wordcount_spec(1), vec!["/data/a.txt".to_string()])
            .unwrap();

        let spec = poll(&mut state, &w1).unwrap();

        // Keep w2 fresh, let w1's heartbeat lapse past the dead window.
        let later = Instant::now() + Duration::from_secs(30);
        state.workers.get_mut(&w2).unwrap().last_heartbeat = later;
        state.tick(later);

        assert_eq!(state.workers[&w1].status, WorkerStatus::Dead);
        assert!(poll(&mut state, &w1).is_none());
        let retry = poll(&mut state, &w2).unwrap();
        assert_eq!(retry.id, spec.id);
        assert_eq!(retry.attempt, 1);
    }

    #[test]
    fn dead_worker_loses_map_output_and_producer_reruns() {
        let mut state = CoordinatorState::new(test_config());
        let w1 = register(&mut state, "w1", 2);
        let w2 = register(&mut state, "w2", 2);
        let w1_url = state.workers[&w1].shuffle_url.clone();
        state
            .submit_job(wordcount_spec(1), vec!["/data/a.txt".to_string()])
            .unwrap();

        let map_spec = poll(&mut state, &w1).unwrap();
        let blocks = blocks_for(&map_spec, &w1_url, 1);
        succeed(&mut state, &w1, &map_spec, blocks);

        // Reduce not yet done when its only block source dies.
        let later = Instant::now() + Duration::from_secs(30);
        state.workers.get_mut(&w2).unwrap().last_heartbeat = later;
        state.tick(later);

        let rerun = poll(&mut state, &w2).unwrap();
        assert_eq!(rerun.id, map_spec.id);
        assert!(matches!(rerun.kind, TaskKind::Map { .. }));
    }

    #[test]
    fn checksum_mismatch_recycles_producer_without_charging() {
        let mut state = CoordinatorState::new(test_config());
        let worker = register(&mut state, "w1", 4);
        let worker_url = state.workers[&worker].shuffle_url.clone();
        let info = state
            .submit_job(wordcount_spec(1), vec!["/data/a.txt".to_string()])
            .unwrap();

        let map_spec = poll(&mut state, &worker).unwrap();
        succeed(
            &mut state,
            &worker,
            &map_spec,
            blocks_for(&map_spec, &worker_url, 1),
        );
        let reduce_spec = poll(&mut state, &worker).unwrap();
        fail(
            &mut state,
            &worker,
            &reduce_spec,
            TaskErrorKind::ChecksumMismatch {
                map_task_id: map_spec.id.clone(),
            },
        );

        // The producer re-runs; the consumer waits for the fresh block and
        // neither failure counts against an attempt budget.
        let rerun = poll(&mut state, &worker).unwrap();
        assert_eq!(rerun.id, map_spec.id);
        assert!(rerun.attempt > map_spec.attempt);
        let job = &state.jobs[&info.id];
        assert_eq!(job.stages["sum"].status, StageStatus::Waiting);
        for stage in job.stages.values() {
            for task in &stage.tasks {
                assert_eq!(task.charged_failures, 0);
            }
        }

        succeed(
            &mut state,
            &worker,
            &rerun,
            blocks_for(&rerun, &worker_url, 1),
        );
        let reduce_retry = poll(&mut state, &worker).unwrap();
        assert_eq!(reduce_retry.id, reduce_spec.id);
        assert!(reduce_retry.attempt > reduce_spec.attempt);
    }

    #[test]
    fn straggler_gets_speculative_twin_on_other_worker() {
        let mut state = CoordinatorState::new(test_config());
        let w1 = register(&mut state, "w1", 4);
        let w2 = register(&mut state, "w2", 4);
        let w1_url = state.workers[&w1].shuffle_url.clone();
        state
            .submit_job(
                wordcount_spec(1),
                vec!["/data/a.txt".to_string(), "/data/b.txt".to_string()],
            )
            .unwrap();

        let fast = poll(&mut state, &w1).unwrap();
        let slow = poll(&mut state, &w1).unwrap();
        succeed(&mut state, &w1, &fast, blocks_for(&fast, &w1_url, 1));

        let later = Instant::now() + Duration::from_secs(60);
        state.workers.get_mut(&w1).unwrap().last_heartbeat = later;
        state.workers.get_mut(&w2).unwrap().last_heartbeat = later;
        state.tick(later);

        // The original holder cannot double up on its own task.
        assert!(poll(&mut state, &w1).is_none());
        let twin = poll(&mut state, &w2).unwrap();
        assert_eq!(twin.id, slow.id);
        assert_eq!(twin.attempt, slow.attempt + 1);
    }

    #[test]
    fn first_success_wins_and_late_twin_is_discarded() {
        let mut state = CoordinatorState::new(test_config());
        let w1 = register(&mut state, "w1", 4);
        let w2 = register(&mut state, "w2", 4);
        let w1_url = state.workers[&w1].shuffle_url.clone();
        state
            .submit_job(
                wordcount_spec(1),
                vec!["/data/a.txt".to_string(), "/data/b.txt".to_string()],
            )
            .unwrap();

        let fast = poll(&mut state, &w1).unwrap();
        let slow = poll(&mut state, &w1).unwrap();
        succeed(&mut state, &w1, &fast, blocks_for(&fast, &w1_url, 1));

        let later = Instant::now() + Duration::from_secs(60);
        state.workers.get_mut(&w1).unwrap().last_heartbeat = later;
        state.workers.get_mut(&w2).unwrap().last_heartbeat = later;
        state.tick(later);
        let twin = poll(&mut state, &w2).unwrap();

        // The original attempt finishes first and commits; its race loser
        // is told to cancel and a late success changes nothing.
        succeed(&mut state, &w1, &slow, blocks_for(&slow, &w1_url, 1));
        assert!(state.workers[&w2].cancel_queue.contains(&slow.id));

        succeed(&mut state, &w2, &twin, blocks_for(&twin, &w1_url, 1));
        let (job_id, stage_id) = state.task_index[&slow.id].clone();
        let task = state.jobs[&job_id].stages[&stage_id]
            .tasks
            .iter()
            .find(|t| t.task_id == slow.id)
            .unwrap()
            .clone();
        assert_eq!(task.winner, Some(slow.attempt));
    }

    #[test]
    fn cancel_job_stops_assignment_and_cancels_running() {
        let mut state = CoordinatorState::new(test_config());
        let worker = register(&mut state, "w1", 4);
        let info = state
            .submit_job(wordcount_spec(1), vec!["/data/a.txt".to_string()])
            .unwrap();
        let spec = poll(&mut state, &worker).unwrap();

        let info = state.cancel_job(&info.id).unwrap();
        assert_eq!(info.status, JobStatus::Cancelled);
        assert!(state.workers[&worker].cancel_queue.contains(&spec.id));
        assert!(poll(&mut state, &worker).is_none());

        // A straggling completion report after cancellation is a no-op.
        assert!(state.complete_task(TaskCompleteRequest {
            worker_id: worker.clone(),
            task_id: spec.id.clone(),
            attempt: spec.attempt,
            outcome: TaskOutcome::Success {
                blocks: vec![],
                output_path: None,
            },
        }));
        assert_eq!(state.job_info(&info.id).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn reduce_assignment_prefers_local_blocks() {
        let mut state = CoordinatorState::new(test_config());
        let w1 = register(&mut state, "w1", 4);
        let w2 = register(&mut state, "w2", 4);
        let w1_url = state.workers[&w1].shuffle_url.clone();
        state
            .submit_job(wordcount_spec(2), vec!["/data/a.txt".to_string()])
            .unwrap();

        let map_spec = poll(&mut state, &w1).unwrap();
        succeed(
            &mut state,
            &w1,
            &map_spec,
            blocks_for(&map_spec, &w1_url, 2),
        );

        // Both reduce tasks' blocks live on w1, so w1 gets served first
        // either way, but a poll from w2 must still succeed.
        let r1 = poll(&mut state, &w1).unwrap();
        match &r1.kind {
            TaskKind::Reduce { map_inputs, .. } => {
                assert!(map_inputs.iter().all(|b| b.worker_url == w1_url));
            }
            other => panic!("expected reduce task, got {other:?}"),
        }
        assert!(poll(&mut state, &w2).is_some());
    }
}
