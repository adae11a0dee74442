use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use common::protocol::{
    TaskCompleteRequest, TaskOutcome, TaskPollRequest, TaskPollResponse, WorkerHeartbeatRequest,
    WorkerHeartbeatResponse, WorkerRegisterRequest, WorkerRegisterResponse,
};
use common::{TaskErrorKind, TaskId, TaskSpec};

use crate::executor::{self, ExecutorContext};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub coordinator_url: String,
    pub slots: u32,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let get = |name: &str, default: u64| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(default)
        };
        Self {
            coordinator_url: std::env::var("COORDINATOR_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            slots: get("WORKER_SLOTS", 2).max(1) as u32,
            heartbeat_interval: Duration::from_secs(get("WORKER_HEARTBEAT_SECS", 3)),
            poll_interval: Duration::from_millis(get("WORKER_POLL_MS", 500)),
        }
    }
}

/// Live attempts on this worker, so cancel signals can abort them.
/// Keyed by task id; the attempt number rides along for the final report.
type RunningTasks = Arc<Mutex<HashMap<TaskId, (u32, AbortHandle)>>>;

/// Worker main loop: register with the coordinator, heartbeat in the
/// background, and pull tasks whenever a slot is free. Each task runs on
/// its own tokio task so slow attempts never block polling.
pub async fn run(config: AgentConfig, ctx: Arc<ExecutorContext>) -> Result<()> {
    let client = Client::new();
    let worker_id = register(&client, &config, &ctx.advertise_url).await?;

    let running: RunningTasks = Arc::new(Mutex::new(HashMap::new()));
    let semaphore = Arc::new(Semaphore::new(config.slots as usize));

    tokio::spawn(heartbeat_loop(
        client.clone(),
        config.clone(),
        worker_id.clone(),
        ctx.clone(),
        running.clone(),
        semaphore.clone(),
    ));

    loop {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                sleep(config.poll_interval).await;
                continue;
            }
        };

        let poll_url = format!("{}/api/v1/tasks/poll", config.coordinator_url);
        let response = client
            .post(&poll_url)
            .json(&TaskPollRequest {
                worker_id: worker_id.clone(),
            })
            .send()
            .await;

        let poll: TaskPollResponse = match response {
            Ok(resp) => match resp.json().await {
                Ok(p) => p,
                Err(e) => {
                    warn!("bad poll response: {}", e);
                    drop(permit);
                    sleep(config.poll_interval).await;
                    continue;
                }
            },
            Err(e) => {
                warn!("coordinator unreachable: {}", e);
                drop(permit);
                sleep(config.poll_interval).await;
                continue;
            }
        };

        cancel_tasks(&client, &config, &worker_id, &running, poll.cancel_tasks).await;

        match poll.task {
            Some(task) => {
                spawn_task(
                    client.clone(),
                    config.clone(),
                    worker_id.clone(),
                    ctx.clone(),
                    running.clone(),
                    permit,
                    task,
                );
            }
            None => {
                drop(permit);
                sleep(config.poll_interval).await;
            }
        }
    }
}

/// Register until the coordinator is reachable. Workers routinely come up
/// before the coordinator does.
async fn register(client: &Client, config: &AgentConfig, advertise_url: &str) -> Result<String> {
    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let url = format!("{}/api/v1/workers/register", config.coordinator_url);
    let request = WorkerRegisterRequest {
        hostname,
        shuffle_url: advertise_url.to_string(),
        slots: config.slots,
    };

    loop {
        match client.post(&url).json(&request).send().await {
            Ok(resp) => {
                let WorkerRegisterResponse { worker_id } = resp.json().await?;
                info!(
                    "registered as worker {} (slots={}, shuffle={})",
                    worker_id, config.slots, advertise_url
                );
                return Ok(worker_id);
            }
            Err(e) => {
                warn!("registration failed ({}), retrying in 2s", e);
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Periodic heartbeat with host metrics. The response doubles as the
/// control channel: cancellations and shuffle garbage collection arrive
/// here.
async fn heartbeat_loop(
    client: Client,
    config: AgentConfig,
    worker_id: String,
    ctx: Arc<ExecutorContext>,
    running: RunningTasks,
    semaphore: Arc<Semaphore>,
) {
    let mut sys = System::new_all();
    let url = format!("{}/api/v1/workers/heartbeat", config.coordinator_url);
    let mut interval = tokio::time::interval(config.heartbeat_interval);

    loop {
        interval.tick().await;
        sys.refresh_cpu();
        sys.refresh_memory();

        let busy = config.slots as usize - semaphore.available_permits();
        let request = WorkerHeartbeatRequest {
            worker_id: worker_id.clone(),
            running_tasks: busy as u32,
            cpu_percent: Some(sys.global_cpu_info().cpu_usage()),
            mem_bytes: Some(sys.used_memory()),
        };

        match client.post(&url).json(&request).send().await {
            Ok(resp) => match resp.json::<WorkerHeartbeatResponse>().await {
                Ok(hb) => {
                    cancel_tasks(&client, &config, &worker_id, &running, hb.cancel_tasks).await;
                    if !hb.collect_shuffle.is_empty() {
                        ctx.shuffle.collect_tasks(&hb.collect_shuffle);
                    }
                }
                Err(e) => warn!("bad heartbeat response: {}", e),
            },
            Err(e) => warn!("heartbeat failed: {}", e),
        }
    }
}

/// Abort locally running attempts the coordinator no longer wants and
/// acknowledge each with a Cancelled report.
async fn cancel_tasks(
    client: &Client,
    config: &AgentConfig,
    worker_id: &str,
    running: &RunningTasks,
    task_ids: Vec<TaskId>,
) {
    for task_id in task_ids {
        let entry = running.lock().unwrap().remove(&task_id);
        if let Some((attempt, handle)) = entry {
            info!("cancelling task {} attempt {}", task_id, attempt);
            handle.abort();
            report_completion(
                client,
                config,
                TaskCompleteRequest {
                    worker_id: worker_id.to_string(),
                    task_id,
                    attempt,
                    outcome: TaskOutcome::Failure {
                        kind: TaskErrorKind::Cancelled,
                        message: "cancelled by coordinator".to_string(),
                    },
                },
            )
            .await;
        }
    }
}

fn spawn_task(
    client: Client,
    config: AgentConfig,
    worker_id: String,
    ctx: Arc<ExecutorContext>,
    running: RunningTasks,
    permit: tokio::sync::OwnedSemaphorePermit,
    task: TaskSpec,
) {
    info!(
        "starting task {} attempt {} (job={} stage={})",
        task.id, task.attempt, task.job_id, task.stage_id
    );
    let task_id = task.id.clone();
    let attempt = task.attempt;
    let running_inner = running.clone();

    // The attempt waits for this signal so its abort handle is in the
    // running map before it can finish and try to remove itself.
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _permit = permit;
        let _ = ready_rx.await;
        let outcome = match executor::run_task(&task, &ctx).await {
            Ok((blocks, output_path)) => TaskOutcome::Success {
                blocks,
                output_path,
            },
            Err(e) => {
                warn!("task {} attempt {} failed: {}", task.id, task.attempt, e);
                TaskOutcome::Failure {
                    kind: e.task_error_kind(),
                    message: e.to_string(),
                }
            }
        };
        running_inner.lock().unwrap().remove(&task.id);
        report_completion(
            &client,
            &config,
            TaskCompleteRequest {
                worker_id,
                task_id: task.id.clone(),
                attempt: task.attempt,
                outcome,
            },
        )
        .await;
    });

    running
        .lock()
        .unwrap()
        .insert(task_id, (attempt, handle.abort_handle()));
    let _ = ready_tx.send(());
}

async fn report_completion(client: &Client, config: &AgentConfig, request: TaskCompleteRequest) {
    let url = format!("{}/api/v1/tasks/complete", config.coordinator_url);
    // Best effort: a lost report looks like a lost worker and the
    // coordinator's liveness machinery takes over.
    if let Err(e) = client.post(&url).json(&request).send().await {
        warn!(
            "could not report completion of task {}: {}",
            request.task_id, e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorContext, FetchConfig};
    use common::functions::MapFn;
    use common::shuffle::{LocalBlockSource, ShuffleStore};
    use common::TaskKind;
    use std::fs;
    use std::path::Path;

    fn temp_base() -> std::path::PathBuf {
        let base = std::env::temp_dir()
            .join("agent_tests")
            .join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn test_ctx(base: &Path) -> ExecutorContext {
        let shuffle = ShuffleStore::new(base.join("shuffle")).unwrap();
        ExecutorContext {
            shuffle: shuffle.clone(),
            advertise_url: "http://localhost:0".to_string(),
            scratch_dir: base.join("scratch"),
            fetch: FetchConfig {
                retries: 1,
                backoff: Duration::from_millis(10),
                fan_out: 2,
            },
            source: Arc::new(LocalBlockSource::new(shuffle)),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finished_attempt_leaves_no_stale_running_entry() {
        let base = temp_base();
        let ctx = Arc::new(test_ctx(&base));

        let input = base.join("in.txt");
        fs::write(&input, "two words\n").unwrap();
        let task = TaskSpec {
            id: "task-1".to_string(),
            job_id: "job-1".to_string(),
            stage_id: "map".to_string(),
            partition_index: 0,
            attempt: 0,
            kind: TaskKind::Map {
                function: MapFn::TokenizeCount,
                input_path: input.to_string_lossy().to_string(),
                num_reduce_partitions: 1,
            },
        };

        // Nothing listens on port 1, so the completion report fails fast
        // and the attempt still tears down its bookkeeping.
        let config = AgentConfig {
            coordinator_url: "http://127.0.0.1:1".to_string(),
            slots: 1,
            heartbeat_interval: Duration::from_secs(3),
            poll_interval: Duration::from_millis(50),
        };
        let running: RunningTasks = Arc::new(Mutex::new(HashMap::new()));
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().try_acquire_owned().unwrap();

        spawn_task(
            Client::new(),
            config,
            "worker-1".to_string(),
            ctx,
            running.clone(),
            permit,
            task,
        );

        // The permit is released last, so reacquiring it means the attempt
        // finished and ran its cleanup.
        let reacquired = tokio::time::timeout(Duration::from_secs(10), semaphore.acquire())
            .await
            .expect("attempt did not finish in time");
        reacquired.unwrap().forget();

        assert!(running.lock().unwrap().is_empty());
    }
}
