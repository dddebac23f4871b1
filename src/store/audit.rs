// =============================================================================
// Audit chain — append-only, hash-chained event log
// =============================================================================
//
// Every record's hash covers the canonical JSON of the record without its own
// hash, including the previous record's hash. Any mutation of a stored
// record, or any reordering, breaks verification from that point on.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic sequence number starting at 0.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    /// Event kind, e.g. "risk_reject", "safe_mode_enter", "order_terminal".
    pub kind: String,
    pub payload: Value,
    pub prev_hash: Option<String>,
    pub hash: String,
}

/// Where and why a chain failed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    pub seq: u64,
    pub reason: String,
}

impl std::fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "audit chain broken at seq {}: {}", self.seq, self.reason)
    }
}

/// Canonicalize: recursively sort object keys, emit compact JSON.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonical(&map[&k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// hash = sha256(prev_hash ‖ canonical({seq, ts, kind, payload})).
pub fn compute_hash(
    prev_hash: Option<&str>,
    seq: u64,
    ts: DateTime<Utc>,
    kind: &str,
    payload: &Value,
) -> String {
    let body = serde_json::json!({
        "seq": seq,
        "ts": ts.timestamp_millis(),
        "kind": kind,
        "payload": canonical(payload),
    });
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    hasher.update(body.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// In-memory chain builder. The durable store appends the produced records.
#[derive(Debug, Default)]
pub struct AuditChain {
    next_seq: u64,
    last_hash: Option<String>,
}

impl AuditChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a chain from its persisted tail.
    pub fn resume(next_seq: u64, last_hash: Option<String>) -> Self {
        Self {
            next_seq,
            last_hash,
        }
    }

    /// Build the next chained record.
    pub fn append(&mut self, kind: &str, payload: Value, ts: DateTime<Utc>) -> AuditRecord {
        let seq = self.next_seq;
        let hash = compute_hash(self.last_hash.as_deref(), seq, ts, kind, &payload);
        let record = AuditRecord {
            seq,
            ts,
            kind: kind.to_string(),
            payload,
            prev_hash: self.last_hash.clone(),
            hash: hash.clone(),
        };
        self.next_seq += 1;
        self.last_hash = Some(hash);
        record
    }

    pub fn len(&self) -> u64 {
        self.next_seq
    }

    pub fn is_empty(&self) -> bool {
        self.next_seq == 0
    }
}

/// Walk a chain and verify every link. Returns the number of verified
/// records.
pub fn verify_chain(records: &[AuditRecord]) -> Result<usize, ChainBreak> {
    let mut prev_hash: Option<&str> = None;
    for (i, record) in records.iter().enumerate() {
        if record.seq != i as u64 {
            return Err(ChainBreak {
                seq: record.seq,
                reason: format!("sequence gap: expected {i}, found {}", record.seq),
            });
        }
        if record.prev_hash.as_deref() != prev_hash {
            return Err(ChainBreak {
                seq: record.seq,
                reason: "prev_hash does not match preceding record".to_string(),
            });
        }
        let recomputed = compute_hash(
            prev_hash,
            record.seq,
            record.ts,
            &record.kind,
            &record.payload,
        );
        if recomputed != record.hash {
            return Err(ChainBreak {
                seq: record.seq,
                reason: "hash mismatch — record content was altered".to_string(),
            });
        }
        prev_hash = Some(&record.hash);
    }
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
    }

    fn build_chain(n: u32) -> Vec<AuditRecord> {
        let mut chain = AuditChain::new();
        (0..n)
            .map(|i| {
                chain.append(
                    "test_event",
                    serde_json::json!({ "i": i, "detail": "payload" }),
                    ts(i),
                )
            })
            .collect()
    }

    #[test]
    fn valid_chain_verifies() {
        let records = build_chain(5);
        assert_eq!(verify_chain(&records), Ok(5));
    }

    #[test]
    fn empty_chain_verifies() {
        assert_eq!(verify_chain(&[]), Ok(0));
    }

    #[test]
    fn payload_mutation_detected() {
        let mut records = build_chain(5);
        records[2].payload = serde_json::json!({ "i": 2, "detail": "tampered" });
        let err = verify_chain(&records).unwrap_err();
        assert_eq!(err.seq, 2);
        assert!(err.reason.contains("hash mismatch"));
    }

    #[test]
    fn reordering_detected() {
        let mut records = build_chain(4);
        records.swap(1, 2);
        assert!(verify_chain(&records).is_err());
    }

    #[test]
    fn truncation_from_middle_detected() {
        let mut records = build_chain(4);
        records.remove(1);
        let err = verify_chain(&records).unwrap_err();
        assert!(err.reason.contains("sequence gap"));
    }

    #[test]
    fn hash_depends_on_prev() {
        // Identical payloads at different chain positions hash differently.
        let records = build_chain(3);
        let h1 = compute_hash(None, 0, records[0].ts, "k", &serde_json::json!({"a": 1}));
        let h2 = compute_hash(Some(&records[0].hash), 0, records[0].ts, "k", &serde_json::json!({"a": 1}));
        assert_ne!(h1, h2);
    }

    #[test]
    fn canonicalization_is_key_order_independent() {
        let ts0 = ts(0);
        let a = serde_json::json!({ "x": 1, "y": 2 });
        let b = serde_json::from_str::<Value>(r#"{ "y": 2, "x": 1 }"#).unwrap();
        assert_eq!(
            compute_hash(None, 0, ts0, "k", &a),
            compute_hash(None, 0, ts0, "k", &b)
        );
    }

    #[test]
    fn resume_continues_chain() {
        let mut chain = AuditChain::new();
        let first = chain.append("k", serde_json::json!({}), ts(0));

        let mut resumed = AuditChain::resume(1, Some(first.hash.clone()));
        let second = resumed.append("k", serde_json::json!({}), ts(1));

        assert_eq!(verify_chain(&[first, second]), Ok(2));
    }
}
