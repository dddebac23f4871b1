// =============================================================================
// StateStore — durable state collaborator contract + in-memory implementation
// =============================================================================
//
// The store owns durable copies of intents, execution records, fills,
// positions, pattern performance, and the audit chain. The unique index on
// `client_id` is the linearization point for order creation: a second insert
// of the same intent reports `DuplicateClientId` and the caller loads the
// existing row instead of creating a new order.
//
// `MemoryStore` backs the scenario tests and demo mode. It supports audit
// write-failure injection so SAFE_MODE escalation is testable.
// =============================================================================

pub mod audit;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::execution::types::{ExecutionRecord, Fill, OrderIntent};
use crate::memory::MemoryState;
use crate::position::Position;

pub use audit::{verify_chain, AuditChain, AuditRecord, ChainBreak};

/// Durable state operations the core depends on.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Record an intent before submission. `DuplicateClientId` when the
    /// unique index already holds this `client_id`.
    async fn insert_intent(&self, intent: &OrderIntent) -> Result<(), StoreError>;

    async fn load_intent(&self, client_id: Uuid) -> Result<Option<OrderIntent>, StoreError>;

    /// All intents whose execution record is absent or non-terminal. Restart
    /// recovery re-queries each of these at the venue.
    async fn non_terminal_intents(&self) -> Result<Vec<OrderIntent>, StoreError>;

    async fn upsert_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    async fn load_execution(&self, client_id: Uuid)
        -> Result<Option<ExecutionRecord>, StoreError>;

    async fn append_fill(&self, client_id: Uuid, fill: &Fill) -> Result<(), StoreError>;

    async fn upsert_position(&self, position: &Position) -> Result<(), StoreError>;

    async fn load_positions(&self) -> Result<Vec<Position>, StoreError>;

    async fn save_memory_state(&self, state: &MemoryState) -> Result<(), StoreError>;

    async fn load_memory_state(&self) -> Result<Option<MemoryState>, StoreError>;

    /// Append one audit event to the hash chain. Failure here escalates to
    /// SAFE_MODE at the orchestrator.
    async fn append_audit(&self, kind: &str, payload: Value, ts: DateTime<Utc>)
        -> Result<AuditRecord, StoreError>;

    async fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    intents: HashMap<Uuid, OrderIntent>,
    executions: HashMap<Uuid, ExecutionRecord>,
    fills: Vec<(Uuid, Fill)>,
    positions: HashMap<Uuid, Position>,
    memory_state: Option<MemoryState>,
    audit: Vec<AuditRecord>,
    chain: AuditChain,
}

/// In-process store used by scenario tests and demo mode.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    /// Test hook: when set, audit appends fail as if the store were down.
    fail_audit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make audit appends fail (or recover) — drives the SAFE_MODE
    /// escalation path in tests.
    pub fn set_audit_failing(&self, failing: bool) {
        self.fail_audit.store(failing, Ordering::SeqCst);
    }

    /// Count of audit records with the given kind.
    pub fn audit_count(&self, kind: &str) -> usize {
        self.inner
            .lock()
            .audit
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn insert_intent(&self, intent: &OrderIntent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.intents.contains_key(&intent.client_id) {
            return Err(StoreError::DuplicateClientId(intent.client_id));
        }
        inner.intents.insert(intent.client_id, intent.clone());
        Ok(())
    }

    async fn load_intent(&self, client_id: Uuid) -> Result<Option<OrderIntent>, StoreError> {
        Ok(self.inner.lock().intents.get(&client_id).cloned())
    }

    async fn non_terminal_intents(&self) -> Result<Vec<OrderIntent>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .intents
            .values()
            .filter(|intent| {
                inner
                    .executions
                    .get(&intent.client_id)
                    .map(|record| !record.is_terminal())
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn upsert_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.inner
            .lock()
            .executions
            .insert(record.client_id, record.clone());
        Ok(())
    }

    async fn load_execution(
        &self,
        client_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.inner.lock().executions.get(&client_id).cloned())
    }

    async fn append_fill(&self, client_id: Uuid, fill: &Fill) -> Result<(), StoreError> {
        self.inner.lock().fills.push((client_id, fill.clone()));
        Ok(())
    }

    async fn upsert_position(&self, position: &Position) -> Result<(), StoreError> {
        self.inner
            .lock()
            .positions
            .insert(position.position_id, position.clone());
        Ok(())
    }

    async fn load_positions(&self) -> Result<Vec<Position>, StoreError> {
        Ok(self.inner.lock().positions.values().cloned().collect())
    }

    async fn save_memory_state(&self, state: &MemoryState) -> Result<(), StoreError> {
        self.inner.lock().memory_state = Some(state.clone());
        Ok(())
    }

    async fn load_memory_state(&self) -> Result<Option<MemoryState>, StoreError> {
        Ok(self.inner.lock().memory_state.clone())
    }

    async fn append_audit(
        &self,
        kind: &str,
        payload: Value,
        ts: DateTime<Utc>,
    ) -> Result<AuditRecord, StoreError> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit log injected failure".into()));
        }
        let mut inner = self.inner.lock();
        let record = inner.chain.append(kind, payload, ts);
        inner.audit.push(record.clone());
        Ok(record)
    }

    async fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError> {
        Ok(self.inner.lock().audit.clone())
    }
}
