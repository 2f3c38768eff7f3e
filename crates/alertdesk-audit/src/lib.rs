//! Hash-chained audit trail for rule lifecycle and delivery events.
//!
//! Every create/edit/delete/auto-deactivate transition on an `AlertRule`,
//! plus notification delivery status changes, gets appended here as one
//! JSON line. Readers who only have the log file (no database access) can
//! still confirm nothing in it was edited or dropped after the fact by
//! walking the `hash_prev`/`hash_self` chain with [`verify_hash_chain`].

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One audit log, backed by a single append-only JSONL file.
///
/// `subject_id` on each event is whatever the event is about: a rule id for
/// lifecycle/trigger/deactivation events, a notification id for delivery
/// status transitions. The writer itself is agnostic to which — it only
/// tracks chain state (`last_hash`, `seq`) and appends.
pub struct AuditWriter {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Option<String>,
    /// Count of events written so far; feeds `derive_event_id` so two
    /// otherwise-identical payloads in the same chain still get distinct ids.
    seq: u64,
}

impl AuditWriter {
    /// Opens (or creates) the log at `path`, creating parent directories as
    /// needed. `hash_chain` controls whether appended events carry
    /// `hash_prev`/`hash_self`; turning it off is only useful for tests that
    /// don't care about tamper detection.
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {:?}", parent))?;
        }

        Ok(Self { path, hash_chain, last_hash: None, seq: 0 })
    }

    /// Restores chain state after a restart. Call alongside [`Self::set_seq`]
    /// with the tail event's `hash_self` and the log's total event count —
    /// otherwise a freshly-started writer would begin a second, disconnected
    /// chain at the bottom of the same file.
    pub fn set_last_hash(&mut self, last_hash: Option<String>) {
        self.last_hash = last_hash;
    }

    pub fn last_hash(&self) -> Option<String> {
        self.last_hash.clone()
    }

    pub fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    /// Number of events appended through this writer instance (or restored
    /// via [`Self::set_seq`]).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Appends one event and returns the record that was written, including
    /// its derived id and (if `hash_chain` is on) its position in the chain.
    pub fn append(&mut self, subject_id: Uuid, topic: &str, event_type: &str, payload: Value) -> Result<AuditEvent> {
        let event_id = derive_event_id(self.last_hash.as_deref(), &payload, self.seq)?;
        self.seq += 1;

        let mut event = AuditEvent {
            event_id,
            subject_id,
            ts_utc: Utc::now(),
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            payload,
            hash_prev: None,
            hash_self: None,
        };

        if self.hash_chain {
            event.hash_prev = self.last_hash.clone();
            let hash = compute_event_hash(&event)?;
            event.hash_self = Some(hash.clone());
            self.last_hash = Some(hash);
        }

        append_line(&self.path, &canonical_json_line(&event)?)?;
        Ok(event)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub subject_id: Uuid,
    pub ts_utc: DateTime<Utc>,
    pub topic: String,
    pub event_type: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Derives an event id from the chain position rather than drawing one at
/// random: hashing the prior link, the event's own canonical payload, and
/// its sequence number means replaying the same inputs always reproduces
/// the same id, which is handy when reconciling a rebuilt log against the
/// original.
fn derive_event_id(last_hash: Option<&str>, payload: &Value, seq: u64) -> Result<Uuid> {
    let canonical_payload = canonical_json_line(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(last_hash.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_payload.as_bytes());
    hasher.update(b"|");
    hasher.update(seq.to_le_bytes());
    let digest = hasher.finalize();
    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&digest[..16]);
    Ok(Uuid::from_bytes(id_bytes))
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {:?}", path))?;
    file.write_all(line.as_bytes()).context("write audit line")?;
    file.write_all(b"\n").context("write audit line newline")?;
    Ok(())
}

/// Serializes `v` with object keys sorted so that two calls on
/// semantically-equal values always produce byte-identical output — the
/// hash chain would otherwise depend on incidental key ordering from
/// `serde_json`'s `Map`.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let value = serde_json::to_value(v).context("serialize audit event")?;
    serde_json::to_string(&canonicalize(&value)).context("stringify canonical audit event")
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hashes the canonical form of `ev` with `hash_self` cleared — a record
/// can't include a hash of itself, so the field is blanked before hashing
/// and only populated with the result afterward.
pub fn compute_event_hash(ev: &AuditEvent) -> Result<String> {
    let mut unsealed = ev.clone();
    unsealed.hash_self = None;
    let canonical = canonical_json_line(&unsealed)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Walks `path` line by line, confirming each event's `hash_prev` points at
/// the previous event's `hash_self` and that `hash_self` itself matches a
/// fresh recomputation. One broken or missing link anywhere in the file —
/// a rule's deactivation event rewritten after the fact, a line deleted —
/// is enough to fail the whole log.
pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref()).with_context(|| format!("read audit log {:?}", path.as_ref()))?;
    verify_hash_chain_str(&content)
}

/// Same check as [`verify_hash_chain`] against an in-memory JSONL string,
/// for callers (tests, an admin endpoint) that already have the content
/// loaded and would rather not round-trip it through a file.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut expected_prev: Option<String> = None;
    let mut verified_lines = 0usize;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: AuditEvent =
            serde_json::from_str(line).with_context(|| format!("parse audit event at line {}", i + 1))?;

        if event.hash_prev != expected_prev {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!("hash_prev mismatch: expected {:?}, got {:?}", expected_prev, event.hash_prev),
            });
        }

        if let Some(claimed) = &event.hash_self {
            let recomputed = compute_event_hash(&event)?;
            if *claimed != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!("hash_self mismatch: claimed {claimed}, recomputed {recomputed}"),
                });
            }
        }

        expected_prev = event.hash_self.clone();
        verified_lines += 1;
    }

    Ok(VerifyResult::Valid { lines: verified_lines })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_id_is_deterministic_given_the_same_chain_state() {
        let payload = json!({"rule_id": "abc", "trigger_count": 3});
        let a = derive_event_id(Some("prevhash"), &payload, 5).unwrap();
        let b = derive_event_id(Some("prevhash"), &payload, 5).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn event_id_changes_with_sequence_number() {
        let payload = json!({"rule_id": "abc"});
        let a = derive_event_id(None, &payload, 0).unwrap();
        let b = derive_event_id(None, &payload, 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn canonicalize_sorts_nested_object_keys() {
        let a = canonicalize(&json!({"b": 1, "a": {"z": 1, "y": 2}}));
        let b = canonicalize(&json!({"a": {"y": 2, "z": 1}, "b": 1}));
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }

    #[test]
    fn append_and_verify_round_trip_on_an_intact_chain() {
        let dir = std::env::temp_dir().join(format!("alertdesk-audit-test-{}", Uuid::new_v4()));
        let log_path = dir.join("rules.jsonl");
        let mut writer = AuditWriter::new(&log_path, true).unwrap();

        let rule_id = Uuid::new_v4();
        writer.append(rule_id, "rule", "created", json!({"kind": "THRESHOLD"})).unwrap();
        writer.append(rule_id, "rule", "triggered", json!({"trigger_count": 1})).unwrap();
        writer
            .append(rule_id, "rule", "auto_deactivated", json!({"consecutive_failures": 5}))
            .unwrap();

        let result = verify_hash_chain(&log_path).unwrap();
        assert_eq!(result, VerifyResult::Valid { lines: 3 });

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn verify_detects_a_tampered_line() {
        let dir = std::env::temp_dir().join(format!("alertdesk-audit-test-{}", Uuid::new_v4()));
        let log_path = dir.join("rules.jsonl");
        let mut writer = AuditWriter::new(&log_path, true).unwrap();
        let rule_id = Uuid::new_v4();
        writer.append(rule_id, "rule", "created", json!({"kind": "THRESHOLD"})).unwrap();
        writer.append(rule_id, "rule", "triggered", json!({"trigger_count": 1})).unwrap();

        let mut content = fs::read_to_string(&log_path).unwrap();
        content = content.replace("\"trigger_count\":1", "\"trigger_count\":999");

        match verify_hash_chain_str(&content).unwrap() {
            VerifyResult::Broken { .. } => {}
            VerifyResult::Valid { .. } => panic!("tampered content must not verify as valid"),
        }

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn verify_detects_a_truncated_chain() {
        let dir = std::env::temp_dir().join(format!("alertdesk-audit-test-{}", Uuid::new_v4()));
        let log_path = dir.join("rules.jsonl");
        let mut writer = AuditWriter::new(&log_path, true).unwrap();
        let rule_id = Uuid::new_v4();
        writer.append(rule_id, "rule", "created", json!({"kind": "THRESHOLD"})).unwrap();
        writer.append(rule_id, "rule", "triggered", json!({"trigger_count": 1})).unwrap();
        writer.append(rule_id, "rule", "edited", json!({"name": "renamed"})).unwrap();

        let content = fs::read_to_string(&log_path).unwrap();
        let dropped_middle_line: String = content.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect::<Vec<_>>().join("\n");

        match verify_hash_chain_str(&dropped_middle_line).unwrap() {
            VerifyResult::Broken { line, .. } => assert_eq!(line, 2),
            VerifyResult::Valid { .. } => panic!("a dropped line must break the chain"),
        }

        fs::remove_dir_all(&dir).ok();
    }
}
