//! Append-only audit trail for validation outcomes.
//!
//! Every validation writes exactly one [`AuditEntry`]. Entries land in an
//! in-memory ring capped at 1,000 (compacted to the newest 500 on
//! overflow) and, when a sink path is configured, in a JSONL file.

#![deny(unsafe_code)]

use kernel_core::ids::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Mutex, RwLock};
use thiserror::Error;

/// Ring capacity before compaction.
pub const RING_CAPACITY: usize = 1_000;
/// Entries retained after compaction.
pub const RING_RETAIN: usize = 500;

/// Errors emitted by the persistent audit sink.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Underlying file I/O failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Entry (de)serialization failed.
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Immutable record of one validation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Milliseconds since epoch.
    pub ts_ms: u64,
    /// Request id the decision answered.
    pub request_id: String,
    /// Intent as submitted.
    pub intent: String,
    /// Maximum action risk (0..10).
    pub risk_level: u8,
    /// Whether the proposal was blocked.
    pub blocked: bool,
    /// Reason naming the failing rule, or the disposition.
    pub reason: String,
    /// Planner-supplied override flag.
    #[serde(rename = "override")]
    pub override_requested: bool,
}

impl AuditEntry {
    /// Entry stamped with the current wall clock.
    pub fn now(
        request_id: &str,
        intent: &str,
        risk_level: u8,
        blocked: bool,
        reason: &str,
        override_requested: bool,
    ) -> Self {
        Self {
            ts_ms: now_ms(),
            request_id: request_id.to_string(),
            intent: intent.to_string(),
            risk_level,
            blocked,
            reason: reason.to_string(),
            override_requested,
        }
    }
}

/// JSONL-backed persistent copy of the trail.
#[derive(Debug)]
struct JsonlSink {
    file: Mutex<File>,
    path: String,
}

impl JsonlSink {
    fn open<P: AsRef<Path>>(path: P) -> Result<Self, AuditError> {
        let p = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(p)?;
        Ok(Self { file: Mutex::new(file), path: p.to_string_lossy().into_owned() })
    }

    fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let line = serde_json::to_string(entry)?;
        let mut f = self.file.lock().expect("audit sink lock poisoned");
        f.write_all(line.as_bytes())?;
        f.write_all(b"\n")?;
        f.flush()?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }
}

/// The audit trail: bounded ring plus optional JSONL sink.
#[derive(Debug, Default)]
pub struct AuditLog {
    ring: RwLock<VecDeque<AuditEntry>>,
    sink: Option<JsonlSink>,
}

impl AuditLog {
    /// In-memory-only trail.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Trail with a persistent JSONL copy at `path`.
    pub fn with_sink<P: AsRef<Path>>(path: P) -> Result<Self, AuditError> {
        Ok(Self { ring: RwLock::new(VecDeque::new()), sink: Some(JsonlSink::open(path)?) })
    }

    /// Append one entry. A failed sink write is surfaced; the ring write
    /// always happens first so the in-memory view never misses an entry.
    pub fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        {
            let mut ring = self.ring.write().expect("audit ring lock poisoned");
            if ring.len() >= RING_CAPACITY {
                let drop_n = ring.len() - RING_RETAIN;
                ring.drain(..drop_n);
            }
            ring.push_back(entry.clone());
        }
        if let Some(sink) = &self.sink {
            sink.append(&entry)?;
        }
        Ok(())
    }

    /// Newest-last snapshot of the ring.
    pub fn recent(&self) -> Vec<AuditEntry> {
        self.ring.read().expect("audit ring lock poisoned").iter().cloned().collect()
    }

    /// Number of entries currently in the ring.
    pub fn len(&self) -> usize {
        self.ring.read().expect("audit ring lock poisoned").len()
    }

    /// True when no entry has been recorded since boot or compaction start.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the persistent copy back, oldest first. Empty when no sink is
    /// configured.
    pub fn read_persisted(&self) -> Result<Vec<AuditEntry>, AuditError> {
        match &self.sink {
            Some(sink) => sink.read_all(),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: usize) -> AuditEntry {
        AuditEntry::now(&format!("r{i}"), "intent", 1, false, "auto-approved", false)
    }

    #[test]
    fn record_and_read_back() {
        let log = AuditLog::in_memory();
        log.record(entry(1)).unwrap();
        log.record(entry(2)).unwrap();
        let all = log.recent();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].request_id, "r1");
        assert_eq!(all[1].request_id, "r2");
    }

    #[test]
    fn ring_compacts_to_retain_size() {
        let log = AuditLog::in_memory();
        for i in 0..RING_CAPACITY + 1 {
            log.record(entry(i)).unwrap();
        }
        // One over capacity: compaction dropped down to RETAIN then appended.
        assert_eq!(log.len(), RING_RETAIN + 1);
        let all = log.recent();
        // The newest entry survived, the oldest did not.
        assert_eq!(all.last().unwrap().request_id, format!("r{RING_CAPACITY}"));
        assert_ne!(all.first().unwrap().request_id, "r0");
    }

    #[test]
    fn jsonl_sink_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::with_sink(dir.path().join("audit.jsonl")).unwrap();
        log.record(AuditEntry::now("rq", "save draft", 7, false, "held", true)).unwrap();
        let back = log.read_persisted().unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].request_id, "rq");
        assert_eq!(back[0].risk_level, 7);
        assert!(back[0].override_requested);
    }
}
