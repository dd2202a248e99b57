//! Append-only, hash-chained audit log of processed commands.
//!
//! Stored at `<state_dir>/sandshell.audit.jsonl`. Every processed query
//! appends exactly one line, whether the command ran, was blocked, or
//! failed to reach the sandbox. Lines are never rewritten.
//!
//! # Format
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp |
//! | `action` | `executed`, `blocked`, `failed`, or `chain_recovery` |
//! | `query` | Natural-language request the command was generated for |
//! | `raw_command` | Command as received, before translation |
//! | `validation` | Validator verdict |
//! | `execution` | Execution outcome, absent when the command did not run |
//! | `error` | Backend failure message, if any |
//! | `prev_entry_sha256` | SHA-256 of the previous JSONL line |
//!
//! # Chain Integrity
//!
//! The first entry links to 64 zeros. A corrupted last line is not
//! repaired; the next append writes a `chain_recovery` entry that hashes
//! the corrupted bytes and starts a new segment from there.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use super::validator::ValidationResult;
use crate::error::AuditError;
use crate::sandbox::executor::ExecutionOutcome;

const AUDIT_FILENAME: &str = "sandshell.audit.jsonl";

/// The hash used for the first entry in the chain (no predecessor).
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Bytes read per step when scanning backwards for the last line.
const TAIL_CHUNK: u64 = 8 * 1024;

/// One audit log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: String,
    pub action: AuditAction,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub raw_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Filled in by [`AuditLogger::record`].
    #[serde(default)]
    pub prev_entry_sha256: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Command passed validation and ran.
    Executed,
    /// Command was refused by the validator and never ran.
    Blocked,
    /// Command passed validation but the sandbox could not run it.
    Failed,
    /// Previous entry corrupted, new chain segment started.
    ChainRecovery,
}

impl AuditRecord {
    /// Build the record for one processed query. The action follows from
    /// which parts are present.
    pub fn new(
        query: impl Into<String>,
        raw_command: impl Into<String>,
        validation: ValidationResult,
        execution: Option<ExecutionOutcome>,
        error: Option<String>,
    ) -> Self {
        let action = if !validation.allowed {
            AuditAction::Blocked
        } else if execution.is_some() && error.is_none() {
            AuditAction::Executed
        } else {
            AuditAction::Failed
        };
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            action,
            query: query.into(),
            raw_command: raw_command.into(),
            validation: Some(validation),
            execution,
            error,
            prev_entry_sha256: String::new(),
        }
    }

    fn chain_recovery(prev_hash: String, corrupted_len: usize) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            action: AuditAction::ChainRecovery,
            query: String::new(),
            raw_command: String::new(),
            validation: None,
            execution: None,
            error: Some(format!(
                "previous entry corrupted ({corrupted_len} bytes), new chain segment"
            )),
            prev_entry_sha256: prev_hash,
        }
    }
}

/// Writer for the audit log. Appends are serialized in-process by a mutex
/// and across processes by an exclusive advisory lock on the log file.
#[derive(Debug)]
pub struct AuditLogger {
    path: PathBuf,
    enabled: bool,
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: audit_file_path(state_dir),
            enabled: true,
            write_lock: Mutex::new(()),
        }
    }

    /// A logger that accepts records and drops them.
    pub fn disabled(state_dir: &Path) -> Self {
        Self {
            enabled: false,
            ..Self::new(state_dir)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append one record, linking it to the current last line.
    pub fn record(&self, mut record: AuditRecord) -> Result<(), AuditError> {
        if !self.enabled {
            return Ok(());
        }

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.lock_exclusive().map_err(|e| self.io_error(e))?;

        let result = self.append_linked(&mut file, &mut record);
        let _ = file.unlock();
        result
    }

    fn append_linked(&self, file: &mut File, record: &mut AuditRecord) -> Result<(), AuditError> {
        let prev_hash = match last_line(file).map_err(|e| self.io_error(e))? {
            None => GENESIS_HASH.to_string(),
            Some(line) if serde_json::from_str::<AuditRecord>(&line).is_ok() => {
                sha256_hex(line.as_bytes())
            }
            Some(line) => {
                let recovery = AuditRecord::chain_recovery(sha256_hex(line.as_bytes()), line.len());
                let recovery_json = serde_json::to_string(&recovery)?;
                write_line(file, &recovery_json).map_err(|e| self.io_error(e))?;
                debug!(path = %self.path.display(), "Audit chain recovered after corrupted line");
                sha256_hex(recovery_json.as_bytes())
            }
        };

        record.prev_entry_sha256 = prev_hash;
        let json = serde_json::to_string(record)?;
        write_line(file, &json).map_err(|e| self.io_error(e))
    }

    /// Read parsed records, newest last. Corrupted lines are skipped.
    /// With `limit`, only the last `limit` records are returned.
    pub fn read_records(&self, limit: Option<usize>) -> Result<Vec<AuditRecord>, AuditError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let records: Vec<AuditRecord> = content
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(match limit {
            Some(limit) if records.len() > limit => records[records.len() - limit..].to_vec(),
            _ => records,
        })
    }

    /// Verify the hash chain.
    ///
    /// Returns the indices of lines whose link is broken; corrupted lines
    /// count as broken. An empty result means the chain is intact.
    pub fn verify_chain(&self) -> Result<Vec<usize>, AuditError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

        let mut broken = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let Ok(record) = serde_json::from_str::<AuditRecord>(line) else {
                broken.push(i);
                continue;
            };
            let expected = match i {
                0 => GENESIS_HASH.to_string(),
                _ => sha256_hex(lines[i - 1].as_bytes()),
            };
            if record.prev_entry_sha256 != expected {
                broken.push(i);
            }
        }
        Ok(broken)
    }

    fn io_error(&self, source: io::Error) -> AuditError {
        AuditError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Get the full path to the audit log file.
pub fn audit_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(AUDIT_FILENAME)
}

/// Write one record as a single `write_all` so concurrent readers never
/// observe a partial line.
fn write_line(file: &mut File, line: &str) -> io::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf)?;
    file.flush()
}

/// Last non-empty line of the file, scanning backwards from the end.
fn last_line(file: &mut File) -> io::Result<Option<String>> {
    let len = file.seek(SeekFrom::End(0))?;
    let mut tail: Vec<u8> = Vec::new();
    let mut pos = len;

    while pos > 0 {
        let step = TAIL_CHUNK.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&tail);
        tail = chunk;

        let trimmed = trim_trailing_newlines(&tail);
        if let Some(nl) = trimmed.iter().rposition(|&b| b == b'\n') {
            return Ok(Some(
                String::from_utf8_lossy(&trimmed[nl + 1..]).into_owned(),
            ));
        }
    }

    let trimmed = trim_trailing_newlines(&tail);
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(String::from_utf8_lossy(trimmed).into_owned()))
    }
}

fn trim_trailing_newlines(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| b != b'\n' && b != b'\r')
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Compute hex-encoded SHA-256.
fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
