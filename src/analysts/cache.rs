// =============================================================================
// Verdict cache — TTL cache keyed by (feature hash, analyst id)
// =============================================================================
//
// Identical requests within the TTL return the cached verdict tagged
// `from_cache`, avoiding redundant model calls.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::clock::Clock;

use super::AnalystVerdict;

struct Entry {
    verdict: AnalystVerdict,
    inserted_at: Duration,
}

/// Thread-safe TTL cache for analyst verdicts.
pub struct VerdictCache {
    entries: RwLock<HashMap<(String, String), Entry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl VerdictCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Look up a verdict. Expired entries are dropped on access.
    pub fn get(&self, feature_hash: &str, analyst_id: &str) -> Option<AnalystVerdict> {
        let key = (feature_hash.to_string(), analyst_id.to_string());
        let now = self.clock.monotonic();

        {
            let entries = self.entries.read();
            let entry = entries.get(&key)?;
            if now.saturating_sub(entry.inserted_at) <= self.ttl {
                let mut verdict = entry.verdict.clone();
                verdict.from_cache = true;
                return Some(verdict);
            }
        }
        // Expired — remove under the write lock.
        self.entries.write().remove(&key);
        None
    }

    pub fn put(&self, feature_hash: &str, verdict: AnalystVerdict) {
        let key = (feature_hash.to_string(), verdict.analyst_id.clone());
        self.entries.write().insert(
            key,
            Entry {
                verdict,
                inserted_at: self.clock.monotonic(),
            },
        );
    }

    /// Drop all expired entries. Called opportunistically by the router.
    pub fn purge_expired(&self) {
        let now = self.clock.monotonic();
        self.entries
            .write()
            .retain(|_, e| now.saturating_sub(e.inserted_at) <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
