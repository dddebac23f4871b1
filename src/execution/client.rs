// =============================================================================
// Execution Client — idempotent order submission with crash recovery
// =============================================================================
//
// Submission protocol:
//   1. Persist the intent row first (unique `client_id` in the store).
//   2. Submit to the venue with bounded retries + jitter behind the venue
//      circuit breaker.
//   3. Persist the resulting record; the venue report is server-of-truth.
//
// Restart recovery walks every non-terminal intent: if the venue knows the
// `client_id` the record is rehydrated, otherwise the SAME `client_id` is
// re-submitted. Either way at most one venue order can ever exist per
// `client_id`.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysts::circuit::{CircuitBreaker, CircuitConfig};
use crate::clock::Clock;
use crate::error::{ExecError, StoreError};
use crate::metrics::Metrics;
use crate::store::StateStore;
use crate::types::Side;

use super::types::{ExecutionRecord, OrderIntent, OrderStatus};
use super::venue::{snap_price, snap_quantity, ExchangeVenue, RoundMode, VenueReport};

/// Retry policy for transient venue errors.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base: Duration::from_millis(250),
            cap: Duration::from_secs(5),
        }
    }
}

/// The execution gateway client.
pub struct ExecutionClient {
    venue: Arc<dyn ExchangeVenue>,
    store: Arc<dyn StateStore>,
    breaker: CircuitBreaker,
    retry: RetrySettings,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl ExecutionClient {
    pub fn new(
        venue: Arc<dyn ExchangeVenue>,
        store: Arc<dyn StateStore>,
        circuit: CircuitConfig,
        retry: RetrySettings,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let breaker = CircuitBreaker::new("venue", circuit, clock.clone());
        Self {
            venue,
            store,
            breaker,
            retry,
            clock,
            metrics,
        }
    }

    // -------------------------------------------------------------------------
    // Submit
    // -------------------------------------------------------------------------

    /// Submit an intent. Idempotent by `client_id`: re-running for the same
    /// intent converges on the one existing venue order.
    pub async fn submit(&self, intent: &OrderIntent) -> Result<ExecutionRecord, ExecError> {
        let intent = self.normalize(intent);

        // Intent row goes down before anything reaches the venue.
        match self.store.insert_intent(&intent).await {
            Ok(()) => {}
            Err(StoreError::DuplicateClientId(_)) => {
                // Already attempted. If the venue knows the order, converge
                // on its state instead of creating anything new.
                if let Some(record) = self.reconcile(intent.client_id).await? {
                    return Ok(record);
                }
                // Intent persisted but the venue never saw it — fall through
                // and submit with the same client_id.
            }
            Err(e) => return Err(ExecError::Transient(format!("intent persist failed: {e}"))),
        }

        let now = self.clock.now();
        let mut record = ExecutionRecord::new(&intent, now);
        self.persist(&record).await?;

        let report = match self.submit_with_retries(&intent).await {
            Ok(report) => report,
            Err(e) => {
                if matches!(e, ExecError::Permanent(_)) {
                    // Permanent: terminal record, reservation freed upstream.
                    record.status = OrderStatus::Rejected;
                    record.last_update = self.clock.now();
                    self.persist(&record).await?;
                }
                // Transient exhaustion leaves the record Pending; restart
                // recovery re-drives it with the same client_id.
                return Err(e);
            }
        };

        self.apply_report(&mut record, &report);
        self.persist(&record).await?;
        Metrics::inc(&self.metrics.intents_submitted);

        info!(
            client_id = %intent.client_id,
            symbol = %intent.symbol,
            side = %intent.side,
            quantity = %intent.quantity,
            status = %record.status,
            "order submitted"
        );
        Ok(record)
    }

    /// Cancel the unfilled remainder. The venue's answer (which may report a
    /// fill that raced the cancel) is authoritative.
    pub async fn cancel(&self, client_id: Uuid) -> Result<ExecutionRecord, ExecError> {
        let report = self.venue.cancel(client_id).await?;
        let mut record = self
            .store
            .load_execution(client_id)
            .await
            .map_err(|e| ExecError::Transient(format!("load record: {e}")))?
            .ok_or_else(|| ExecError::Permanent(format!("no record for {client_id}")))?;

        self.apply_report(&mut record, &report);
        self.persist(&record).await?;
        info!(client_id = %client_id, status = %record.status, "cancel processed");
        Ok(record)
    }

    /// Refresh one record from the venue. `None` when the venue never saw
    /// the order.
    pub async fn query(&self, client_id: Uuid) -> Result<Option<ExecutionRecord>, ExecError> {
        self.reconcile(client_id).await
    }

    // -------------------------------------------------------------------------
    // Restart recovery
    // -------------------------------------------------------------------------

    /// Converge every non-terminal intent after a restart. Returns the
    /// refreshed records.
    pub async fn recover(&self) -> Result<Vec<ExecutionRecord>, ExecError> {
        let pending = self
            .store
            .non_terminal_intents()
            .await
            .map_err(|e| ExecError::Transient(format!("scan intents: {e}")))?;

        let mut recovered = Vec::with_capacity(pending.len());
        for intent in pending {
            Metrics::inc(&self.metrics.intents_recovered);
            match self.reconcile(intent.client_id).await? {
                Some(record) => {
                    info!(client_id = %intent.client_id, status = %record.status, "intent rehydrated from venue");
                    recovered.push(record);
                }
                None => {
                    // The crash hit between persist and submit. Same
                    // client_id goes out again — at most one venue order.
                    info!(client_id = %intent.client_id, "intent never reached venue — resubmitting");
                    let report = self.submit_with_retries(&intent).await?;
                    let mut record = ExecutionRecord::new(&intent, self.clock.now());
                    self.apply_report(&mut record, &report);
                    self.persist(&record).await?;
                    recovered.push(record);
                }
            }
        }
        Ok(recovered)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Snap prices to the venue tick and the quantity to the venue step.
    /// Rounding never increases the risk taken: buys round their limit down,
    /// sells round it up, quantities round down.
    fn normalize(&self, intent: &OrderIntent) -> OrderIntent {
        let spec = self.venue.symbol_spec(&intent.symbol);
        let mut out = intent.clone();
        out.quantity = snap_quantity(intent.quantity, spec.step);
        let mode = match intent.side {
            Side::Buy => RoundMode::Down,
            Side::Sell => RoundMode::Up,
        };
        out.limit_price = intent.limit_price.map(|p| snap_price(p, spec.tick, mode));
        out.stop_price = intent.stop_price.map(|p| snap_price(p, spec.tick, mode));
        out
    }

    async fn submit_with_retries(&self, intent: &OrderIntent) -> Result<VenueReport, ExecError> {
        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            if !self.breaker.try_acquire() {
                return Err(ExecError::CircuitOpen);
            }
            match self.venue.submit(intent).await {
                Ok(report) => {
                    self.breaker.on_success();
                    return Ok(report);
                }
                Err(e @ ExecError::Transient(_)) => {
                    self.breaker.on_failure();
                    Metrics::inc(&self.metrics.exec_retries);
                    last_error = e.to_string();
                    warn!(
                        client_id = %intent.client_id,
                        attempt,
                        error = %e,
                        "transient venue error — backing off"
                    );
                    let delay = crate::feed::ingestor::backoff_delay(
                        attempt,
                        self.retry.base,
                        self.retry.cap,
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // Permanent errors mean the venue answered; the breaker
                    // only counts connectivity failures.
                    self.breaker.on_success();
                    return Err(e);
                }
            }
        }
        Err(ExecError::RetriesExhausted {
            attempts: self.retry.max_attempts,
            last: last_error,
        })
    }

    /// Pull the venue's view of one order into the stored record.
    async fn reconcile(&self, client_id: Uuid) -> Result<Option<ExecutionRecord>, ExecError> {
        let Some(report) = self.venue.query(client_id).await? else {
            return Ok(None);
        };

        let mut record = match self
            .store
            .load_execution(client_id)
            .await
            .map_err(|e| ExecError::Transient(format!("load record: {e}")))?
        {
            Some(record) => record,
            None => {
                // Venue has the order but we lost the record — rebuild from
                // the intent row.
                let intent = self
                    .store
                    .load_intent(client_id)
                    .await
                    .map_err(|e| ExecError::Transient(format!("load intent: {e}")))?
                    .ok_or_else(|| {
                        ExecError::Permanent(format!("venue order without intent: {client_id}"))
                    })?;
                ExecutionRecord::new(&intent, self.clock.now())
            }
        };

        self.apply_report(&mut record, &report);
        self.persist(&record).await?;
        Ok(Some(record))
    }

    /// The venue report is server-of-truth: fills are replaced wholesale and
    /// the status is taken as reported (a cancel that raced a fill keeps the
    /// fill and the cancelled status).
    fn apply_report(&self, record: &mut ExecutionRecord, report: &VenueReport) {
        record.venue_order_id = Some(report.venue_order_id.clone());
        record.fills = report.fills.clone();
        record.filled_qty = report.fills.iter().map(|f| f.qty).sum();
        record.remaining_qty = (record.quantity - record.filled_qty).max(Decimal::ZERO);

        let notional: Decimal = report.fills.iter().map(|f| f.qty * f.price).sum();
        record.avg_fill_price = if record.filled_qty > Decimal::ZERO {
            Some(notional / record.filled_qty)
        } else {
            None
        };

        record.status = if record.remaining_qty == Decimal::ZERO
            && record.filled_qty == record.quantity
        {
            OrderStatus::Filled
        } else {
            report.status
        };
        record.last_update = self.clock.now();
    }

    async fn persist(&self, record: &ExecutionRecord) -> Result<(), ExecError> {
        self.store
            .upsert_execution(record)
            .await
            .map_err(|e| ExecError::Transient(format!("record persist failed: {e}")))
    }
}
