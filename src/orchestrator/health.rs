// =============================================================================
// Heartbeats — per-component liveness and last-error tracking
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::clock::Clock;

/// Component status as surfaced by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: ComponentStatus,
    /// Seconds since the last heartbeat.
    pub last_beat_age_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
}

struct Entry {
    last_beat: Duration,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

/// Registry of component heartbeats.
pub struct HeartbeatRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    /// A component silent beyond this is DEGRADED; beyond 3× it is FAILED.
    stale_after: Duration,
}

impl HeartbeatRegistry {
    pub fn new(clock: Arc<dyn Clock>, stale_after: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            stale_after,
        }
    }

    /// Record a healthy beat. Clears any recorded error.
    pub fn beat(&self, component: &str) {
        let now = self.clock.monotonic();
        let mut entries = self.entries.write();
        let entry = entries.entry(component.to_string()).or_insert(Entry {
            last_beat: now,
            last_error: None,
            last_error_at: None,
        });
        entry.last_beat = now;
        entry.last_error = None;
    }

    /// Record a component failure. The beat timestamp still advances — the
    /// component is alive, just erroring.
    pub fn fail(&self, component: &str, error: impl Into<String>) {
        let now = self.clock.monotonic();
        let wall = self.clock.now();
        let mut entries = self.entries.write();
        let entry = entries.entry(component.to_string()).or_insert(Entry {
            last_beat: now,
            last_error: None,
            last_error_at: None,
        });
        entry.last_beat = now;
        entry.last_error = Some(error.into());
        entry.last_error_at = Some(wall);
    }

    pub fn report(&self) -> Vec<ComponentHealth> {
        let now = self.clock.monotonic();
        let entries = self.entries.read();
        let mut out: Vec<ComponentHealth> = entries
            .iter()
            .map(|(name, entry)| {
                let age = now.saturating_sub(entry.last_beat);
                let status = if entry.last_error.is_some() {
                    ComponentStatus::Degraded
                } else if age > self.stale_after * 3 {
                    ComponentStatus::Failed
                } else if age > self.stale_after {
                    ComponentStatus::Degraded
                } else {
                    ComponentStatus::Healthy
                };
                ComponentHealth {
                    name: name.clone(),
                    status,
                    last_beat_age_secs: age.as_secs(),
                    last_error: entry.last_error.clone(),
                    last_error_at: entry.last_error_at,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
