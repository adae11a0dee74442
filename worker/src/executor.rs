use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use common::functions::{group_by_key, partition_for_key, record_key, Record};
use common::shuffle::{decode_block, verify_block, BlockSource, ShuffleStore};
use common::store::PartitionStore;
use common::{BlockLocation, EngineError, Result, TaskKind, TaskSpec};

/// Bounded-retry / bounded-fan-out settings for shuffle fetches.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub retries: u32,
    pub backoff: Duration,
    pub fan_out: usize,
}

impl FetchConfig {
    pub fn from_env() -> Self {
        let get = |name: &str, default: u64| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(default)
        };
        Self {
            retries: get("SHUFFLE_FETCH_RETRIES", 3) as u32,
            backoff: Duration::from_millis(get("SHUFFLE_FETCH_BACKOFF_MS", 500)),
            fan_out: get("SHUFFLE_FETCH_FANOUT", 4).max(1) as usize,
        }
    }
}

/// Everything a task execution needs from the worker process.
pub struct ExecutorContext {
    /// Local shuffle store this worker also serves over HTTP.
    pub shuffle: ShuffleStore,
    /// URL under which other workers reach our shuffle server.
    pub advertise_url: String,
    /// Per-task spill space, wiped when the task finishes.
    pub scratch_dir: PathBuf,
    pub fetch: FetchConfig,
    pub source: Arc<dyn BlockSource>,
}

/// Run one task attempt to completion. Returns the produced shuffle blocks
/// (map) or the final output path (reduce).
pub async fn run_task(
    task: &TaskSpec,
    ctx: &ExecutorContext,
) -> Result<(Vec<BlockLocation>, Option<String>)> {
    match &task.kind {
        TaskKind::Map {
            function,
            input_path,
            num_reduce_partitions,
        } => {
            // Map execution is file IO and compute; it runs on the blocking
            // pool so heartbeats and polls stay responsive.
            let function = *function;
            let input_path = input_path.clone();
            let partitions = *num_reduce_partitions;
            let task_id = task.id.clone();
            let shuffle = ctx.shuffle.clone();
            let advertise_url = ctx.advertise_url.clone();
            let scratch = ctx.scratch_dir.join(&task.id);
            let blocks = tokio::task::spawn_blocking(move || {
                run_map(
                    &task_id,
                    function,
                    &input_path,
                    partitions,
                    &shuffle,
                    &advertise_url,
                    &scratch,
                )
            })
            .await
            .map_err(|e| EngineError::TaskExecution(format!("map execution aborted: {e}")))??;
            Ok((blocks, None))
        }
        TaskKind::Reduce {
            function,
            map_inputs,
            output_path,
        } => {
            run_reduce(task, *function, map_inputs, output_path, ctx).await?;
            Ok((Vec::new(), Some(output_path.clone())))
        }
    }
}

/// Map phase: read the input partition line by line, apply the map function,
/// hash-partition the records and publish one shuffle block per reduce
/// partition.
#[allow(clippy::too_many_arguments)]
fn run_map(
    task_id: &str,
    function: common::functions::MapFn,
    input_path: &str,
    num_reduce_partitions: u32,
    shuffle: &ShuffleStore,
    advertise_url: &str,
    scratch: &Path,
) -> Result<Vec<BlockLocation>> {
    let file = File::open(input_path).map_err(|e| {
        EngineError::TaskExecution(format!("cannot open input {input_path}: {e}"))
    })?;

    let mut partitions: Vec<PartitionStore> = Vec::with_capacity(num_reduce_partitions as usize);
    for p in 0..num_reduce_partitions {
        partitions.push(PartitionStore::with_default_threshold(
            scratch.join(format!("p{p}")),
        )?);
    }

    for line in BufReader::new(file).lines() {
        let line = line?;
        for rec in function.apply(&line) {
            match record_key(&rec) {
                Some(key) => {
                    let p = partition_for_key(key, num_reduce_partitions);
                    partitions[p as usize].append(rec)?;
                }
                None => debug!("map record without string key dropped"),
            }
        }
    }

    let mut blocks = Vec::with_capacity(partitions.len());
    for (p, store) in partitions.iter().enumerate() {
        let records: Vec<Record> = store.iter().collect::<Result<Vec<_>>>()?;
        let meta = shuffle.write_block(task_id, p as u32, &records)?;
        blocks.push(BlockLocation {
            map_task_id: task_id.to_string(),
            reduce_partition: p as u32,
            worker_url: advertise_url.to_string(),
            checksum: meta.checksum,
            len: meta.len,
        });
    }

    let _ = fs::remove_dir_all(scratch);
    debug!(
        "map task {} produced {} blocks from {}",
        task_id,
        blocks.len(),
        input_path
    );
    Ok(blocks)
}

/// Reduce phase: fetch every input block (bounded fan-out, bounded retries),
/// verify checksums, group by key and write the sorted output partition.
async fn run_reduce(
    task: &TaskSpec,
    function: common::functions::ReduceFn,
    map_inputs: &[BlockLocation],
    output_path: &str,
    ctx: &ExecutorContext,
) -> Result<()> {
    // Futures own their block location so the whole task future stays
    // spawnable on the runtime.
    let fetches: Vec<_> = map_inputs
        .iter()
        .cloned()
        .map(|loc| fetch_and_verify(ctx.source.as_ref(), loc, &ctx.fetch))
        .collect();
    let fetched: Vec<Result<Vec<Record>>> = stream::iter(fetches)
        .buffered(ctx.fetch.fan_out)
        .collect()
        .await;
    let mut batches = Vec::with_capacity(fetched.len());
    for result in fetched {
        batches.push(result?);
    }

    // Grouping and the output write are blocking work.
    let scratch = ctx.scratch_dir.join(&task.id);
    let output = output_path.to_string();
    let attempt = task.attempt;
    tokio::task::spawn_blocking(move || {
        write_reduce_output(function, batches, &output, attempt, &scratch)
    })
    .await
    .map_err(|e| EngineError::TaskExecution(format!("reduce execution aborted: {e}")))??;

    debug!(
        "reduce task {} wrote {} from {} blocks",
        task.id,
        output_path,
        map_inputs.len()
    );
    Ok(())
}

/// Spill-backed merge of the fetched batches, grouped by key and written
/// with write-then-rename so a killed attempt never leaves a half
/// partition under the final name.
fn write_reduce_output(
    function: common::functions::ReduceFn,
    batches: Vec<Vec<Record>>,
    output_path: &str,
    attempt: u32,
    scratch: &Path,
) -> Result<()> {
    let mut store = PartitionStore::with_default_threshold(scratch)?;
    for batch in batches {
        for rec in batch {
            store.append(rec)?;
        }
    }
    let mut records = Vec::with_capacity(store.len());
    for rec in store.iter() {
        records.push(rec?);
    }

    if let Some(parent) = Path::new(output_path).parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = format!("{output_path}.tmp-{attempt}");
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for (key, value) in function.apply(group_by_key(records)) {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            writeln!(writer, "{key},{text}")?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp_path, output_path)?;

    let _ = fs::remove_dir_all(scratch);
    Ok(())
}

/// Fetch one block with retries and verify it against the checksum the
/// producer recorded. A checksum mismatch is never retried: the block is
/// durably wrong and only re-executing the producer fixes it.
async fn fetch_and_verify(
    source: &dyn BlockSource,
    location: BlockLocation,
    config: &FetchConfig,
) -> Result<Vec<Record>> {
    let mut last_err: Option<EngineError> = None;
    for attempt in 0..=config.retries {
        if attempt > 0 {
            tokio::time::sleep(config.backoff * attempt).await;
        }
        match source.fetch(&location).await {
            Ok(bytes) => {
                verify_block(
                    &bytes,
                    location.checksum,
                    &location.map_task_id,
                    location.reduce_partition,
                )?;
                return decode_block(&bytes);
            }
            Err(e) => {
                warn!(
                    "fetch of block {}/{} from {} failed (try {}): {}",
                    location.map_task_id,
                    location.reduce_partition,
                    location.worker_url,
                    attempt + 1,
                    e
                );
                last_err = Some(e);
            }
        }
    }
    Err(EngineError::ShuffleFetch(format!(
        "block {}/{} unreachable after {} tries: {}",
        location.map_task_id,
        location.reduce_partition,
        config.retries + 1,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Fetches blocks from the producing worker's shuffle server.
pub struct HttpBlockSource {
    client: Client,
}

impl HttpBlockSource {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpBlockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockSource for HttpBlockSource {
    async fn fetch(&self, location: &BlockLocation) -> Result<Vec<u8>> {
        let url = format!(
            "{}/api/v1/shuffle/{}/{}",
            location.worker_url.trim_end_matches('/'),
            location.map_task_id,
            location.reduce_partition
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ShuffleFetch(format!("GET {url}: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::BlockNotFound {
                map_task_id: location.map_task_id.clone(),
                partition: location.reduce_partition,
            });
        }
        if !resp.status().is_success() {
            return Err(EngineError::ShuffleFetch(format!(
                "GET {url}: status {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| EngineError::ShuffleFetch(format!("GET {url}: {e}")))?;
        Ok(bytes.to_vec())
    }
}
