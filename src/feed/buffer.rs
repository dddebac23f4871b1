// =============================================================================
// BarBuffer — per-(symbol, timeframe) ring buffer of finalized bars
// =============================================================================
//
// Bars are immutable once written. The buffer enforces strictly increasing
// open_time per series: out-of-order arrivals are rejected, exact duplicates
// are ignored, and a duplicate open_time with different contents is rejected
// as a feed integrity violation.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::bar::{Bar, Timeframe};

/// Identifies one bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Result of offering a bar to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Bar appended to the series.
    Appended,
    /// Identical bar already present — ignored.
    Duplicate,
    /// Bar arrived with open_time at or before the series head and does not
    /// match the stored bar. Discarded.
    OutOfOrder,
}

/// Thread-safe ring buffer of closed bars, capped per series.
pub struct BarBuffer {
    series: RwLock<HashMap<SeriesKey, VecDeque<Bar>>>,
    capacity: usize,
}

impl BarBuffer {
    /// Retain at most `capacity` bars per (symbol, timeframe).
    pub fn new(capacity: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Offer a bar. Ordering is enforced per series; the caller is expected to
    /// have validated the bar already.
    pub fn push(&self, bar: Bar) -> PushOutcome {
        let key = SeriesKey::new(bar.symbol.clone(), bar.timeframe);
        let mut map = self.series.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        if let Some(last) = ring.back() {
            if bar.open_time < last.open_time {
                return PushOutcome::OutOfOrder;
            }
            if bar.open_time == last.open_time {
                return if *last == bar {
                    PushOutcome::Duplicate
                } else {
                    PushOutcome::OutOfOrder
                };
            }
        }

        ring.push_back(bar);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        PushOutcome::Appended
    }

    /// Most recent `count` bars, oldest first.
    pub fn window(&self, key: &SeriesKey, count: usize) -> Vec<Bar> {
        let map = self.series.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Latest bar of a series, if any.
    pub fn last(&self, key: &SeriesKey) -> Option<Bar> {
        self.series.read().get(key).and_then(|r| r.back().cloned())
    }

    /// Open time the next bar of this series should carry.
    pub fn expected_next(&self, key: &SeriesKey) -> Option<DateTime<Utc>> {
        self.last(key).map(|b| b.open_time + b.timeframe.duration())
    }

    pub fn len(&self, key: &SeriesKey) -> usize {
        self.series.read().get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, key: &SeriesKey) -> bool {
        self.len(key) == 0
    }
}
