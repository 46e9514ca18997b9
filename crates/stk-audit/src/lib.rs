//! Append-only audit log for stock mutations and reconciliations.
//!
//! Writes JSON Lines (one event per line). Optional hash chain: each event
//! carries `hash_prev` + `hash_self` so tampering with any line breaks the
//! chain from that point on. Event ids are derived deterministically from
//! chain state + payload + sequence (no RNG), so replaying the same inputs
//! reproduces the same log byte for byte.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub ts_utc: DateTime<Utc>,
    /// Coarse stream name, e.g. `"stock"`.
    pub topic: String,
    /// Mutation kind: `"reserve" | "release" | "expire" | "commit" | "sync"`.
    pub event_type: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Append seam injected into the managers. `&self` receivers so the log can
/// be shared behind an `Arc` across concurrent callers.
pub trait AuditLog: Send + Sync {
    fn append(&self, event_type: &str, payload: Value) -> Result<AuditEvent>;
}

// ---------------------------------------------------------------------------
// AuditWriter (JSONL file)
// ---------------------------------------------------------------------------

struct WriterState {
    last_hash: Option<String>,
    /// Monotonically increasing counter for event-id derivation. When
    /// resuming an existing log restore with `set_seq(events_written)`
    /// alongside `set_last_hash`.
    seq: u64,
}

/// Append-only JSONL audit writer.
pub struct AuditWriter {
    path: PathBuf,
    topic: String,
    hash_chain: bool,
    state: Mutex<WriterState>,
}

impl AuditWriter {
    /// Creates the audit writer and ensures parent dirs exist.
    pub fn new(path: impl AsRef<Path>, topic: impl Into<String>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {parent:?}"))?;
        }
        Ok(Self {
            path,
            topic: topic.into(),
            hash_chain,
            state: Mutex::new(WriterState {
                last_hash: None,
                seq: 0,
            }),
        })
    }

    /// Restore chain state when resuming an existing log after restart.
    pub fn resume(&self, last_hash: Option<String>, seq: u64) -> Result<()> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("audit writer mutex poisoned"))?;
        st.last_hash = last_hash;
        st.seq = seq;
        Ok(())
    }
}

impl AuditLog for AuditWriter {
    fn append(&self, event_type: &str, payload: Value) -> Result<AuditEvent> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("audit writer mutex poisoned"))?;

        let event_id = derive_event_id(st.last_hash.as_deref(), &payload, st.seq)?;
        st.seq += 1;

        let mut ev = AuditEvent {
            event_id,
            ts_utc: Utc::now(),
            topic: self.topic.clone(),
            event_type: event_type.to_string(),
            payload,
            hash_prev: None,
            hash_self: None,
        };

        if self.hash_chain {
            ev.hash_prev = st.last_hash.clone();
            let self_hash = compute_event_hash(&ev)?;
            ev.hash_self = Some(self_hash.clone());
            st.last_hash = Some(self_hash);
        }

        let line = canonical_json_line(&ev)?;
        append_line(&self.path, &line)?;

        Ok(ev)
    }
}

// ---------------------------------------------------------------------------
// MemoryAudit (in-process buffer)
// ---------------------------------------------------------------------------

/// In-process audit buffer for embedded deployments and tests. Same event
/// derivation and chaining as [`AuditWriter`], without the file.
#[derive(Default)]
pub struct MemoryAudit {
    events: Mutex<(Vec<AuditEvent>, Option<String>)>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|g| g.0.clone())
            .unwrap_or_default()
    }
}

impl AuditLog for MemoryAudit {
    fn append(&self, event_type: &str, payload: Value) -> Result<AuditEvent> {
        let mut g = self
            .events
            .lock()
            .map_err(|_| anyhow::anyhow!("audit buffer mutex poisoned"))?;
        let seq = g.0.len() as u64;
        let event_id = derive_event_id(g.1.as_deref(), &payload, seq)?;
        let mut ev = AuditEvent {
            event_id,
            ts_utc: Utc::now(),
            topic: "stock".to_string(),
            event_type: event_type.to_string(),
            payload,
            hash_prev: g.1.clone(),
            hash_self: None,
        };
        let self_hash = compute_event_hash(&ev)?;
        ev.hash_self = Some(self_hash.clone());
        g.1 = Some(self_hash);
        g.0.push(ev.clone());
        Ok(ev)
    }
}

// ---------------------------------------------------------------------------
// Derivation + chaining
// ---------------------------------------------------------------------------

/// Deterministic event id: UUIDv5 over (last_hash, canonical payload, seq).
fn derive_event_id(last_hash: Option<&str>, payload: &Value, seq: u64) -> Result<Uuid> {
    let canonical = canonical_json_line(payload)?;
    let mut name = String::with_capacity(canonical.len() + 32);
    name.push_str(last_hash.unwrap_or("genesis"));
    name.push('|');
    name.push_str(&canonical);
    name.push('|');
    name.push_str(&seq.to_string());
    Ok(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
}

/// Write a single line to file (with trailing newline).
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {path:?}"))?;
    f.write_all(line.as_bytes())
        .context("write audit line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    Ok(())
}

/// Canonicalize by sorting keys recursively and emitting compact JSON.
/// One event == one JSON line.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit event failed")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hash chain is computed from canonical JSON of the event WITHOUT
/// hash_self (to avoid self-reference).
pub fn compute_event_hash(ev: &AuditEvent) -> Result<String> {
    let mut clone = ev.clone();
    clone.hash_self = None;

    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verify the hash chain integrity of an audit log file.
pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit log {:?}", path.as_ref()))?;
    verify_hash_chain_str(&content)
}

/// Verify the hash chain integrity of JSONL content in memory.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut line_count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let ev: AuditEvent = serde_json::from_str(trimmed)
            .with_context(|| format!("parse audit event at line {}", i + 1))?;

        line_count += 1;

        // 1. hash_prev must match the previous event's hash_self.
        if ev.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, ev.hash_prev
                ),
            });
        }

        // 2. hash_self must be correct for this event's content.
        if let Some(ref claimed_hash) = ev.hash_self {
            let recomputed = compute_event_hash(&ev)?;
            if *claimed_hash != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!(
                        "hash_self mismatch: claimed {claimed_hash}, recomputed {recomputed}"
                    ),
                });
            }
        }

        prev_hash = ev.hash_self.clone();
    }

    Ok(VerifyResult::Valid { lines: line_count })
}

/// Result of hash chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    /// The entire chain is valid.
    Valid { lines: usize },
    /// The chain is broken at the given line.
    Broken { line: usize, reason: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_audit_chains_events() {
        let log = MemoryAudit::new();
        log.append("reserve", json!({"product": "p-1", "quantity": 3}))
            .unwrap();
        log.append("commit", json!({"product": "p-1", "quantity": 3}))
            .unwrap();

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].hash_prev.is_none());
        assert_eq!(events[1].hash_prev, events[0].hash_self);
    }

    #[test]
    fn event_ids_are_deterministic_for_same_chain_state() {
        let payload = json!({"product": "p-1"});
        let a = derive_event_id(None, &payload, 0).unwrap();
        let b = derive_event_id(None, &payload, 0).unwrap();
        let c = derive_event_id(None, &payload, 1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = json!({"b": {"z": 1, "a": 2}, "a": 3});
        let line = canonical_json_line(&v).unwrap();
        assert_eq!(line, r#"{"a":3,"b":{"a":2,"z":1}}"#);
    }

    #[test]
    fn verify_detects_tampered_payload() {
        let log = MemoryAudit::new();
        log.append("sync", json!({"discrepancy": -3})).unwrap();
        log.append("sync", json!({"discrepancy": 0})).unwrap();

        let mut events = log.events();
        // Tamper with the first payload after the fact.
        events[0].payload = json!({"discrepancy": 30});

        let content = events
            .iter()
            .map(|e| canonical_json_line(e).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        match verify_hash_chain_str(&content).unwrap() {
            VerifyResult::Broken { line, .. } => assert_eq!(line, 1),
            VerifyResult::Valid { .. } => panic!("tampering must break the chain"),
        }
    }

    #[test]
    fn verify_accepts_intact_chain() {
        let log = MemoryAudit::new();
        for i in 0..5 {
            log.append("reserve", json!({"seq": i})).unwrap();
        }
        let content = log
            .events()
            .iter()
            .map(|e| canonical_json_line(e).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(
            verify_hash_chain_str(&content).unwrap(),
            VerifyResult::Valid { lines: 5 }
        );
    }
}
