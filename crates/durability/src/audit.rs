//! Audit trail: per-run, per-batch replayable trace log
//!
//! ## Design
//!
//! 1. **Append-only JSON lines**: each record is one self-delimited line;
//!    readers tolerate a truncated final line (crash mid-write).
//!
//! 2. **Causal hash chaining**: each record carries the hash of the
//!    previous record's hash plus its own payload. Tamper-evidence within
//!    the process boundary, not cryptographic security.
//!
//! 3. **Checkpoints**: world snapshots at stage boundaries let a replay
//!    re-execute a run exactly; intermediate turns are stored as deltas.
//!
//! Records are totally ordered per batch (by `seq`) and partially ordered
//! across batches by planning index.

use parking_lot::Mutex;
use retrodict_core::{RetrodictError, Result, RunId};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Kind of an audit record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Batch planning output
    Plan,
    /// Batch execution started
    Start,
    /// One simulated turn (stored as deltas)
    Turn,
    /// Full world snapshot at a checkpoint boundary
    Checkpoint,
    /// Batch finalized (succeeded, failed, or cancelled)
    End,
}

/// One line of the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Run the record belongs to
    pub run_id: RunId,
    /// Batch the record belongs to; empty for run-level records
    pub batch_id: String,
    /// Sequence number within the run file
    pub seq: u64,
    /// Record kind
    pub kind: AuditKind,
    /// Structured payload
    pub payload: serde_json::Value,
    /// Chain hash: xxh3(prev_hash || canonical payload)
    pub hash: String,
}

/// Result of verifying a trail's hash chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChainReport {
    /// Whether every record chained correctly
    pub is_valid: bool,
    /// Records examined
    pub length: u64,
    /// First sequence number that failed verification
    pub first_invalid: Option<u64>,
}

fn chain_hash(prev: &str, payload: &serde_json::Value) -> String {
    let canonical = serde_json::to_vec(payload).unwrap_or_default();
    let mut input = Vec::with_capacity(prev.len() + canonical.len());
    input.extend_from_slice(prev.as_bytes());
    input.extend_from_slice(&canonical);
    format!("{:016x}", xxh3_64(&input))
}

struct TrailFile {
    writer: BufWriter<File>,
    next_seq: u64,
    head_hash: String,
}

/// Append-only, hash-chained trail storage for all runs under one directory
pub struct AuditTrail {
    dir: PathBuf,
    open_files: Mutex<FxHashMap<RunId, TrailFile>>,
}

impl AuditTrail {
    /// Open (creating if needed) a trail directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(AuditTrail {
            dir,
            open_files: Mutex::new(FxHashMap::default()),
        })
    }

    /// Path of a run's trail file
    pub fn trail_path(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{}.audit.jsonl", run_id))
    }

    /// Append a record, assigning sequence and chain hash
    pub fn append(
        &self,
        run_id: RunId,
        batch_id: impl Into<String>,
        kind: AuditKind,
        payload: serde_json::Value,
    ) -> Result<AuditRecord> {
        let mut files = self.open_files.lock();
        if !files.contains_key(&run_id) {
            let path = self.trail_path(run_id);
            // Resume the chain from any existing tail.
            let (next_seq, head_hash) = match read_records(&path) {
                Ok(records) => records
                    .last()
                    .map(|r| (r.seq + 1, r.hash.clone()))
                    .unwrap_or((0, String::new())),
                Err(_) => (0, String::new()),
            };
            let handle = OpenOptions::new().create(true).append(true).open(&path)?;
            files.insert(
                run_id,
                TrailFile {
                    writer: BufWriter::new(handle),
                    next_seq,
                    head_hash,
                },
            );
        }
        let file = files.get_mut(&run_id).expect("opened above");

        let record = AuditRecord {
            run_id,
            batch_id: batch_id.into(),
            seq: file.next_seq,
            kind,
            hash: chain_hash(&file.head_hash, &payload),
            payload,
        };
        let line = serde_json::to_string(&record)?;
        file.writer.write_all(line.as_bytes())?;
        file.writer.write_all(b"\n")?;
        file.writer.flush()?;
        file.next_seq += 1;
        file.head_hash = record.hash.clone();
        Ok(record)
    }

    /// Finish a run's file: flush and drop the open handle
    pub fn finish(&self, run_id: RunId) -> Result<()> {
        if let Some(mut file) = self.open_files.lock().remove(&run_id) {
            file.writer.flush()?;
        }
        debug!(target: "retrodict::audit", run = %run_id, "trail finished");
        Ok(())
    }

    /// Replay a run's records in order, optionally bounded
    ///
    /// Readers tolerate a truncated last line: a crash mid-append loses at
    /// most the partial record.
    pub fn replay(
        &self,
        run_id: RunId,
        step_limit: Option<usize>,
    ) -> Result<impl Iterator<Item = AuditRecord>> {
        let mut records = read_records(&self.trail_path(run_id))?;
        if let Some(limit) = step_limit {
            records.truncate(limit);
        }
        Ok(records.into_iter())
    }

    /// Verify the hash chain of a run's trail
    pub fn verify(&self, run_id: RunId) -> Result<ChainReport> {
        let records = read_records(&self.trail_path(run_id))?;
        let mut prev = String::new();
        for record in &records {
            let expected = chain_hash(&prev, &record.payload);
            if expected != record.hash {
                return Ok(ChainReport {
                    is_valid: false,
                    length: records.len() as u64,
                    first_invalid: Some(record.seq),
                });
            }
            prev = record.hash.clone();
        }
        Ok(ChainReport {
            is_valid: true,
            length: records.len() as u64,
            first_invalid: None,
        })
    }
}

fn read_records(path: &Path) -> Result<Vec<AuditRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RetrodictError::not_found(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                // Truncated tail from a crash: stop here, keep the prefix.
                warn!(target: "retrodict::audit", error = %e, "partial trail line ignored");
                break;
            }
        }
    }
    Ok(records)
}
