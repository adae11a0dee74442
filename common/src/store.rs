use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::functions::Record;

const DEFAULT_MAX_IN_MEM_RECORDS: usize = 100_000;

/// In-memory record threshold before a spill. Overridable with the
/// MAX_IN_MEM_RECORDS env var.
pub fn max_in_mem_records() -> usize {
    std::env::var("MAX_IN_MEM_RECORDS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_IN_MEM_RECORDS)
}

/// Holder for one dataset partition: an ordered sequence of records kept in
/// memory until it crosses a threshold, then spilled to JSONL files on disk.
/// Iteration yields spilled records first, then the in-memory tail, which
/// preserves overall append order.
pub struct PartitionStore {
    buf: Vec<Record>,
    spill_files: Vec<PathBuf>,
    dir: PathBuf,
    threshold: usize,
    spill_counter: usize,
    total: usize,
}

impl PartitionStore {
    pub fn new(dir: impl AsRef<Path>, threshold: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            buf: Vec::new(),
            spill_files: Vec::new(),
            dir,
            threshold: threshold.max(1),
            spill_counter: 0,
            total: 0,
        })
    }

    pub fn with_default_threshold(dir: impl AsRef<Path>) -> Result<Self> {
        Self::new(dir, max_in_mem_records())
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn append(&mut self, record: Record) -> Result<()> {
        self.buf.push(record);
        self.total += 1;
        if self.buf.len() >= self.threshold {
            self.spill()?;
        }
        Ok(())
    }

    /// Move the in-memory buffer to a spill file. No-op when empty.
    pub fn spill(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.spill_counter += 1;
        let pid = std::process::id();
        let path = self
            .dir
            .join(format!("spill-{}-{}.jsonl", pid, self.spill_counter));
        let mut writer = BufWriter::new(File::create(&path)?);
        for rec in self.buf.drain(..) {
            serde_json::to_writer(&mut writer, &rec)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        self.spill_files.push(path);
        Ok(())
    }

    /// Restartable iteration over all records in append order. Each call
    /// starts a fresh pass; spilled data is re-read from disk lazily.
    pub fn iter(&self) -> RecordIter<'_> {
        RecordIter {
            spill_files: &self.spill_files,
            next_file: 0,
            lines: None,
            buf: &self.buf,
            buf_pos: 0,
            failed: false,
        }
    }
}

pub struct RecordIter<'a> {
    spill_files: &'a [PathBuf],
    next_file: usize,
    lines: Option<Lines<BufReader<File>>>,
    buf: &'a [Record],
    buf_pos: usize,
    failed: bool,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(lines) = self.lines.as_mut() {
                match lines.next() {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Record>(&line) {
                            Ok(rec) => return Some(Ok(rec)),
                            Err(e) => {
                                self.failed = true;
                                return Some(Err(e.into()));
                            }
                        }
                    }
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e.into()));
                    }
                    None => {
                        self.lines = None;
                        continue;
                    }
                }
            }
            if self.next_file < self.spill_files.len() {
                let path = &self.spill_files[self.next_file];
                self.next_file += 1;
                match File::open(path) {
                    Ok(f) => {
                        self.lines = Some(BufReader::new(f).lines());
                        continue;
                    }
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e.into()));
                    }
                }
            }
            if self.buf_pos < self.buf.len() {
                let rec = self.buf[self.buf_pos].clone();
                self.buf_pos += 1;
                return Some(Ok(rec));
            }
            return None;
        }
    }
}
