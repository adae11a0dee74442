use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::functions::Record;
use crate::task::BlockLocation;

/// Checksum over raw block bytes. DefaultHasher::new() is keyed with fixed
/// constants, so the value is stable across worker processes.
pub fn checksum_bytes(bytes: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    h.write(bytes);
    h.finish()
}

/// Serialize records to the JSONL block payload.
pub fn encode_block(records: &[Record]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for rec in records {
        serde_json::to_writer(&mut bytes, rec)?;
        bytes.push(b'\n');
    }
    Ok(bytes)
}

/// Decode a JSONL block payload back into records.
pub fn decode_block(bytes: &[u8]) -> Result<Vec<Record>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| EngineError::ShuffleFetch(format!("block is not utf-8: {e}")))?;
    let mut out = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(line)?);
    }
    Ok(out)
}

/// Verify block bytes against the checksum recorded at write time.
pub fn verify_block(bytes: &[u8], expected: u64, map_task_id: &str, partition: u32) -> Result<()> {
    let actual = checksum_bytes(bytes);
    if actual != expected {
        return Err(EngineError::ChecksumMismatch {
            map_task_id: map_task_id.to_string(),
            partition,
        });
    }
    Ok(())
}

/// Metadata persisted next to each block file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockMeta {
    pub map_task_id: String,
    pub reduce_partition: u32,
    pub checksum: u64,
    pub len: u64,
}

/// Durable, addressable exchange of intermediate data on one worker.
/// Blocks are content-addressed by (map task id, reduce partition index):
///
///   <root>/<map_task_id>/block-<partition>.jsonl
///   <root>/<map_task_id>/block-<partition>.meta
///
/// A block written once is immutable; re-execution of the producing task
/// supersedes the whole `<map_task_id>` directory (new attempt, new task id
/// never reuses an old directory with different content).
#[derive(Debug, Clone)]
pub struct ShuffleStore {
    root: PathBuf,
}

impl ShuffleStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn task_dir(&self, map_task_id: &str) -> PathBuf {
        self.root.join(map_task_id)
    }

    fn block_path(&self, map_task_id: &str, partition: u32) -> PathBuf {
        self.task_dir(map_task_id)
            .join(format!("block-{partition}.jsonl"))
    }

    fn meta_path(&self, map_task_id: &str, partition: u32) -> PathBuf {
        self.task_dir(map_task_id)
            .join(format!("block-{partition}.meta"))
    }

    /// Write one shuffle block. Write-then-rename keeps partially written
    /// blocks invisible to readers.
    pub fn write_block(
        &self,
        map_task_id: &str,
        partition: u32,
        records: &[Record],
    ) -> Result<BlockMeta> {
        let dir = self.task_dir(map_task_id);
        fs::create_dir_all(&dir)?;

        let bytes = encode_block(records)?;
        let checksum = checksum_bytes(&bytes);
        let meta = BlockMeta {
            map_task_id: map_task_id.to_string(),
            reduce_partition: partition,
            checksum,
            len: bytes.len() as u64,
        };

        let data_path = self.block_path(map_task_id, partition);
        let tmp_path = data_path.with_extension("jsonl.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writer.write_all(&bytes)?;
            writer.flush()?;
        }
        fs::rename(&tmp_path, &data_path)?;

        let meta_path = self.meta_path(map_task_id, partition);
        let tmp_meta = meta_path.with_extension("meta.tmp");
        fs::write(&tmp_meta, serde_json::to_vec(&meta)?)?;
        fs::rename(&tmp_meta, &meta_path)?;

        debug!(
            "wrote shuffle block map_task={} partition={} len={}",
            map_task_id, partition, meta.len
        );
        Ok(meta)
    }

    /// Read one block's bytes plus its recorded checksum.
    pub fn read_block(&self, map_task_id: &str, partition: u32) -> Result<(Vec<u8>, BlockMeta)> {
        let data_path = self.block_path(map_task_id, partition);
        let meta_path = self.meta_path(map_task_id, partition);
        if !data_path.exists() || !meta_path.exists() {
            return Err(EngineError::BlockNotFound {
                map_task_id: map_task_id.to_string(),
                partition,
            });
        }
        let meta: BlockMeta = serde_json::from_slice(&fs::read(&meta_path)?)?;
        let mut bytes = Vec::with_capacity(meta.len as usize);
        File::open(&data_path)?.read_to_end(&mut bytes)?;
        Ok((bytes, meta))
    }

    /// Drop every block a map task produced. Called once the downstream
    /// stage has consumed them or the job reached a terminal state.
    pub fn remove_task(&self, map_task_id: &str) -> Result<()> {
        let dir = self.task_dir(map_task_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            debug!("collected shuffle blocks of map_task={}", map_task_id);
        }
        Ok(())
    }

    /// Garbage-collect all blocks belonging to a finished job.
    pub fn collect_tasks(&self, map_task_ids: &[String]) {
        for id in map_task_ids {
            if let Err(e) = self.remove_task(id) {
                tracing::warn!("shuffle gc failed for map_task={}: {}", id, e);
            }
        }
    }
}

/// Where a reduce task gets its input blocks from. The HTTP implementation
/// lives in the worker; the local one backs same-process reads and tests.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch the raw bytes of one block. Checksum verification is the
    /// caller's job, against the location's recorded checksum.
    async fn fetch(&self, location: &BlockLocation) -> Result<Vec<u8>>;
}

/// Reads blocks straight from a local `ShuffleStore`.
pub struct LocalBlockSource {
    store: ShuffleStore,
}

impl LocalBlockSource {
    pub fn new(store: ShuffleStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BlockSource for LocalBlockSource {
    async fn fetch(&self, location: &BlockLocation) -> Result<Vec<u8>> {
        let (bytes, _meta) = self
            .store
            .read_block(&location.map_task_id, location.reduce_partition)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn temp_store(sub: &str) -> (ShuffleStore, PathBuf) {
        let base = std::env::temp_dir()
            .join("shuffle_store_tests")
            .join(sub)
            .join(uuid::Uuid::new_v4().to_string());
        let _ = fs::remove_dir_all(&base);
        (ShuffleStore::new(&base).unwrap(), base)
    }

    fn sample_records() -> Vec<Record> {
        vec![
            json!({"k": "the", "v": 1_u64}),
            json!({"k": "cat", "v": 1_u64}),
        ]
    }

    #[test]
    fn write_then_read_roundtrips() {
        let (store, _base) = temp_store("roundtrip");
        let meta = store.write_block("map-1", 0, &sample_records()).unwrap();

        let (bytes, read_meta) = store.read_block("map-1", 0).unwrap();
        assert_eq!(read_meta, meta);
        verify_block(&bytes, meta.checksum, "map-1", 0).unwrap();
        assert_eq!(decode_block(&bytes).unwrap(), sample_records());
    }

    #[test]
    fn repeated_reads_are_byte_identical() {
        let (store, _base) = temp_store("idempotent");
        store.write_block("map-1", 2, &sample_records()).unwrap();

        let (first, _) = store.read_block("map-1", 2).unwrap();
        let (second, _) = store.read_block("map-1", 2).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_block_is_block_not_found() {
        let (store, _base) = temp_store("missing");
        let err = store.read_block("map-x", 0).unwrap_err();
        assert!(matches!(err, EngineError::BlockNotFound { .. }));
    }

    #[test]
    fn corrupted_block_fails_verification() {
        let (store, base) = temp_store("corrupt");
        let meta = store.write_block("map-1", 0, &sample_records()).unwrap();

        // flip the payload behind the store's back
        let path = base.join("map-1").join("block-0.jsonl");
        fs::write(&path, b"{\"k\":\"tampered\",\"v\":99}\n").unwrap();

        let (bytes, _) = store.read_block("map-1", 0).unwrap();
        let err = verify_block(&bytes, meta.checksum, "map-1", 0).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ChecksumMismatch { ref map_task_id, partition: 0 } if map_task_id == "map-1"
        ));
    }

    #[test]
    fn remove_task_collects_all_blocks() {
        let (store, _base) = temp_store("gc");
        store.write_block("map-1", 0, &sample_records()).unwrap();
        store.write_block("map-1", 1, &sample_records()).unwrap();

        store.remove_task("map-1").unwrap();

        assert!(matches!(
            store.read_block("map-1", 0).unwrap_err(),
            EngineError::BlockNotFound { .. }
        ));
        assert!(matches!(
            store.read_block("map-1", 1).unwrap_err(),
            EngineError::BlockNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn local_block_source_fetches_written_block() {
        let (store, _base) = temp_store("local_source");
        let meta = store.write_block("map-7", 3, &sample_records()).unwrap();

        let source = LocalBlockSource::new(store);
        let loc = BlockLocation {
            map_task_id: "map-7".to_string(),
            reduce_partition: 3,
            worker_url: "local".to_string(),
            checksum: meta.checksum,
            len: meta.len,
        };
        let bytes = source.fetch(&loc).await.unwrap();
        verify_block(&bytes, loc.checksum, &loc.map_task_id, loc.reduce_partition).unwrap();
    }

    #[test]
    fn empty_block_is_valid() {
        let (store, _base) = temp_store("empty");
        let meta = store.write_block("map-1", 0, &[]).unwrap();
        let (bytes, _) = store.read_block("map-1", 0).unwrap();
        assert!(bytes.is_empty());
        verify_block(&bytes, meta.checksum, "map-1", 0).unwrap();
        assert!(decode_block(&bytes).unwrap().is_empty());
    }
}
