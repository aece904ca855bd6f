//! Manifest store (C3).
//!
//! Append-only, per-operation NDJSON ledger under `<workspace>/manifests/<operation_id>.ndjson`.
//! Each line is `{seq, prev_hash, hash, payload}` with `hash = SHA256(prev_hash || payload_json)`,
//! giving tamper-evidence: a reader that recomputes the chain and finds a mismatch knows the file
//! was altered out of band. Writes fsync before returning so "manifest durability precedes
//! external event publication" (§5) is a property of the writer, not of caller discipline.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::AppError;

const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestLine {
    pub seq: u64,
    pub prev_hash: String,
    pub hash: String,
    pub payload: Value,
}

fn line_hash(prev_hash: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(serde_json::to_vec(payload).unwrap_or_default());
    hex::encode(hasher.finalize())
}

/// Appends manifest lines for a single operation. One writer per operation; the Manager's driver
/// task is the sole caller.
pub struct ManifestWriter {
    file: Mutex<File>,
    seq: Mutex<u64>,
    last_hash: Mutex<String>,
}

impl ManifestWriter {
    pub fn create(workspace: &Path, operation_id: uuid::Uuid) -> std::io::Result<Self> {
        let dir = workspace.join("manifests");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{operation_id}.ndjson"));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            seq: Mutex::new(0),
            last_hash: Mutex::new(ZERO_HASH.to_string()),
        })
    }

    /// Append one record. Returns the assigned sequence number. Line-atomic: a single
    /// `write_all` of one JSON line followed by `sync_data`.
    pub fn append(&self, payload: Value) -> std::io::Result<u64> {
        let mut seq_guard = self.seq.lock();
        let mut hash_guard = self.last_hash.lock();

        let seq = *seq_guard;
        let hash = line_hash(&hash_guard, &payload);
        let line = ManifestLine {
            seq,
            prev_hash: hash_guard.clone(),
            hash: hash.clone(),
            payload,
        };

        let mut serialized = serde_json::to_vec(&line).expect("manifest line always serializes");
        serialized.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&serialized)?;
        file.sync_data()?;

        *seq_guard += 1;
        *hash_guard = hash;
        Ok(seq)
    }
}

/// Reads and validates a manifest's hash chain.
pub struct ManifestReader;

impl ManifestReader {
    pub fn read_all(path: &Path) -> std::io::Result<Vec<ManifestLine>> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ManifestLine = serde_json::from_str(&line)?;
            lines.push(parsed);
        }
        Ok(lines)
    }

    /// Recompute the hash chain and confirm every line matches. Used by the `verify` subcommand
    /// and as a readiness check.
    pub fn verify_chain(path: &Path) -> Result<usize, AppError> {
        let lines = Self::read_all(path).map_err(|e| {
            AppError::DataCorrupted(format!("failed to read manifest {}: {e}", path.display()))
        })?;

        let mut expected_prev = ZERO_HASH.to_string();
        for (idx, line) in lines.iter().enumerate() {
            if line.prev_hash != expected_prev {
                return Err(AppError::DataCorrupted(format!(
                    "manifest {} line {idx}: prev_hash mismatch",
                    path.display()
                )));
            }
            let recomputed = line_hash(&line.prev_hash, &line.payload);
            if recomputed != line.hash {
                return Err(AppError::DataCorrupted(format!(
                    "manifest {} line {idx}: hash mismatch, tamper detected",
                    path.display()
                )));
            }
            expected_prev = line.hash.clone();
        }
        Ok(lines.len())
    }

    /// Walk `<workspace>/manifests` and verify every `.ndjson` manifest; used by `isx-pulse verify`.
    pub fn verify_workspace(workspace: &Path) -> Vec<(PathBuf, Result<usize, AppError>)> {
        let dir = workspace.join("manifests");
        let mut results = Vec::new();
        let Ok(entries) = fs::read_dir(&dir) else {
            return results;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("ndjson") {
                let result = Self::verify_chain(&path);
                results.push((path, result));
            }
        }
        results
    }
}

/// Rename a manifest older than `archive_after` with a `.archived` suffix (§9 compaction policy:
/// archival, never automatic deletion).
pub fn archive_if_stale(path: &Path, modified_age: std::time::Duration, archive_after: std::time::Duration) -> std::io::Result<bool> {
    if modified_age < archive_after {
        return Ok(false);
    }
    let mut archived = path.to_path_buf();
    let file_name = format!("{}.archived", path.file_name().unwrap().to_string_lossy());
    archived.set_file_name(file_name);
    fs::rename(path, archived)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let op_id = uuid::Uuid::new_v4();
        let writer = ManifestWriter::create(dir.path(), op_id).unwrap();

        writer.append(serde_json::json!({"event": "stage_start", "stage": "scrape"})).unwrap();
        writer.append(serde_json::json!({"event": "stage_complete", "stage": "scrape"})).unwrap();

        let path = dir.path().join("manifests").join(format!("{op_id}.ndjson"));
        let lines = ManifestReader::read_all(&path).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].seq, 0);
        assert_eq!(lines[1].seq, 1);
        assert_eq!(lines[1].prev_hash, lines[0].hash);
    }

    #[test]
    fn verify_chain_detects_tampering() {
        let dir = tempdir().unwrap();
        let op_id = uuid::Uuid::new_v4();
        let writer = ManifestWriter::create(dir.path(), op_id).unwrap();
        writer.append(serde_json::json!({"event": "stage_start"})).unwrap();
        writer.append(serde_json::json!({"event": "stage_complete"})).unwrap();

        let path = dir.path().join("manifests").join(format!("{op_id}.ndjson"));
        assert_eq!(ManifestReader::verify_chain(&path).unwrap(), 2);

        let mut lines = ManifestReader::read_all(&path).unwrap();
        lines[0].payload = serde_json::json!({"event": "tampered"});
        let mut contents = String::new();
        for line in &lines {
            contents.push_str(&serde_json::to_string(line).unwrap());
            contents.push('\n');
        }
        fs::write(&path, contents).unwrap();

        assert!(ManifestReader::verify_chain(&path).is_err());
    }
}
