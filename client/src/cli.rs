use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::Client;
use std::env;

use common::functions::{MapFn, ReduceFn};
use common::protocol::{JobResults, WorkerView};
use common::{JobInfo, JobSpec, StageKind, StageSpec};

/// Same convention as the worker:
/// - in Docker: COORDINATOR_URL=http://coordinator:8080
/// - locally: defaults to http://localhost:8080
fn coordinator_base_url() -> String {
    env::var("COORDINATOR_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI for submitting and inspecting map/reduce jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MapFnArg {
    TokenizeCount,
    GroupLines,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReduceFnArg {
    SumByKey,
    ConcatByKey,
}

impl From<MapFnArg> for MapFn {
    fn from(arg: MapFnArg) -> Self {
        match arg {
            MapFnArg::TokenizeCount => MapFn::TokenizeCount,
            MapFnArg::GroupLines => MapFn::GroupLines,
        }
    }
}

impl From<ReduceFnArg> for ReduceFn {
    fn from(arg: ReduceFnArg) -> Self {
        match arg {
            ReduceFnArg::SumByKey => ReduceFn::SumByKey,
            ReduceFnArg::ConcatByKey => ReduceFn::ConcatByKey,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a two-stage map/reduce job (wordcount by default)
    Submit {
        #[arg(value_name = "NAME")]
        name: String,

        /// Input file pattern; one map task per matching file
        #[arg(long, default_value = "/data/input/*.txt")]
        input: String,

        /// Base directory for the final output partitions
        #[arg(long, default_value = "/data/output")]
        output: String,

        /// Number of reduce partitions
        #[arg(long, default_value_t = 4)]
        reduce_partitions: u32,

        #[arg(long, value_enum, default_value = "tokenize-count")]
        map_fn: MapFnArg,

        #[arg(long, value_enum, default_value = "sum-by-key")]
        reduce_fn: ReduceFnArg,
    },
    /// Show the status of a job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Cancel a running job
    Cancel {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// List the output files of a succeeded job
    Results {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Show registered workers and their health
    Workers,
}

fn build_job_spec(
    name: String,
    input: String,
    output: String,
    reduce_partitions: u32,
    map_fn: MapFn,
    reduce_fn: ReduceFn,
) -> JobSpec {
    JobSpec {
        name,
        stages: vec![
            StageSpec {
                id: "map".to_string(),
                kind: StageKind::Map { function: map_fn },
                upstream: vec![],
            },
            StageSpec {
                id: "reduce".to_string(),
                kind: StageKind::Reduce {
                    function: reduce_fn,
                },
                upstream: vec!["map".to_string()],
            },
        ],
        input_glob: input,
        output_dir: output,
        num_reduce_partitions: reduce_partitions,
    }
}

fn print_job(job: &JobInfo) {
    println!("Job:");
    println!("  id: {}", job.id);
    println!("  name: {}", job.name);
    println!("  status: {:?}", job.status);
    println!("  output_dir: {}", job.output_dir);
    for stage in &job.stages {
        println!(
            "  stage {}: {}/{} tasks done, {} running",
            stage.stage_id, stage.succeeded_tasks, stage.total_tasks, stage.running_tasks
        );
    }
    println!("  retries: {}", job.retries);
    println!("  submitted_at: {}", job.submitted_at);
    if let Some(ref started) = job.started_at {
        println!("  started_at: {}", started);
    }
    if let Some(ref finished) = job.finished_at {
        println!("  finished_at: {}", finished);
    }
    if let Some(ref err) = job.last_error {
        println!("  last_error: {}", err);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = coordinator_base_url();

    match cli.command {
        Commands::Submit {
            name,
            input,
            output,
            reduce_partitions,
            map_fn,
            reduce_fn,
        } => {
            let spec = build_job_spec(
                name,
                input,
                output,
                reduce_partitions,
                map_fn.into(),
                reduce_fn.into(),
            );
            let url = format!("{}/api/v1/jobs", base_url);
            let resp = client.post(&url).json(&spec).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                print_job(&job);
            } else {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                println!("Job rejected (status {status}): {body}");
                std::process::exit(1);
            }
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/jobs/{id}", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                print_job(&job);
            } else {
                println!("No job with id {id} (status {})", resp.status());
            }
        }

        Commands::Cancel { id } => {
            let url = format!("{}/api/v1/jobs/{id}/cancel", base_url);
            let resp = client.post(&url).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                print_job(&job);
            } else {
                println!("No job with id {id} (status {})", resp.status());
            }
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/jobs/{id}/results", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let results: JobResults = resp.json().await?;
                println!("Results of job {}:", results.job_id);
                println!("  output_dir: {}", results.output_dir);
                if results.files.is_empty() {
                    println!("  (no output files)");
                } else {
                    for f in results.files {
                        println!("  - {}", f);
                    }
                }
            } else {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                println!("No results for job {id} (status {status}): {body}");
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerView> = resp.json().await?;
                if workers.is_empty() {
                    println!("No registered workers.");
                }
                for w in workers {
                    println!("Worker {}", w.worker_id);
                    println!("  host           : {}", w.hostname);
                    println!("  shuffle_url    : {}", w.shuffle_url);
                    println!("  status         : {:?}", w.status);
                    println!("  slots          : {} ({} active)", w.slots, w.active_tasks);
                    println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                    println!(
                        "  tasks          : started={}, ok={}, failed={}",
                        w.tasks_started, w.tasks_succeeded, w.tasks_failed
                    );
                    if let Some(cpu) = w.cpu_percent {
                        println!("  cpu_percent    : {:.1}%", cpu);
                    }
                    if let Some(mem) = w.mem_bytes {
                        println!("  mem_bytes      : {}", mem);
                    }
                    println!();
                }
            } else {
                println!("Error querying /api/v1/workers (status {})", resp.status());
            }
        }
    }

    Ok(())
}
