// =============================================================================
// Bar — immutable OHLCV summary of one timeframe interval
// =============================================================================
//
// Prices and volume are exact decimals; two bars for the same
// (symbol, timeframe, open_time) must be byte-for-byte identical.
// =============================================================================

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Supported bar intervals. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [Self::M15, Self::H1, Self::H4, Self::D1];

    /// Interval length in milliseconds.
    pub fn millis(self) -> i64 {
        match self {
            Self::M15 => 15 * 60 * 1000,
            Self::H1 => 60 * 60 * 1000,
            Self::H4 => 4 * 60 * 60 * 1000,
            Self::D1 => 24 * 60 * 60 * 1000,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::milliseconds(self.millis())
    }

    /// Floor `ts` to the start of the interval that contains it (UTC).
    pub fn align(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let ms = ts.timestamp_millis();
        let aligned = ms - ms.rem_euclid(self.millis());
        Utc.timestamp_millis_opt(aligned).unwrap()
    }

    /// True when `ts` falls exactly on an interval boundary.
    pub fn is_aligned(self, ts: DateTime<Utc>) -> bool {
        ts.timestamp_millis().rem_euclid(self.millis()) == 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "15m" => Ok(Self::M15),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => Err(FeedError::SchemaMismatch(format!(
                "unknown timeframe: {other}"
            ))),
        }
    }
}

/// One finalized OHLCV bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Start of the interval, aligned to the timeframe (UTC).
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trades_count: Option<u64>,
}

impl Bar {
    /// End of the interval (exclusive).
    pub fn close_time(&self) -> DateTime<Utc> {
        self.open_time + self.timeframe.duration()
    }

    /// Enforce the bar invariants:
    /// low ≤ min(open, close) ≤ max(open, close) ≤ high, positive prices,
    /// non-negative volume, and timeframe-aligned open_time.
    pub fn validate(&self) -> Result<(), FeedError> {
        if self.open <= Decimal::ZERO
            || self.high <= Decimal::ZERO
            || self.low <= Decimal::ZERO
            || self.close <= Decimal::ZERO
        {
            return Err(FeedError::Malformed(format!(
                "{}/{}: non-positive price",
                self.symbol, self.timeframe
            )));
        }
        if self.volume < Decimal::ZERO {
            return Err(FeedError::Malformed(format!(
                "{}/{}: negative volume",
                self.symbol, self.timeframe
            )));
        }
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        if self.low > body_lo || body_hi > self.high {
            return Err(FeedError::Malformed(format!(
                "{}/{} @ {}: OHLC ordering violated (o={} h={} l={} c={})",
                self.symbol, self.timeframe, self.open_time, self.open, self.high, self.low,
                self.close
            )));
        }
        if !self.timeframe.is_aligned(self.open_time) {
            return Err(FeedError::Malformed(format!(
                "{}/{}: open_time {} not aligned to timeframe",
                self.symbol, self.timeframe, self.open_time
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Bar {
        Bar {
            symbol: "BTCUSD".into(),
            timeframe: Timeframe::H1,
            open_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: dec!(10),
            trades_count: Some(100),
        }
    }

    #[test]
    fn valid_bar_passes() {
        assert!(bar(dec!(100), dec!(110), dec!(95), dec!(105)).validate().is_ok());
    }

    #[test]
    fn high_below_body_rejected() {
        assert!(bar(dec!(100), dec!(102), dec!(95), dec!(105)).validate().is_err());
    }

    #[test]
    fn low_above_body_rejected() {
        assert!(bar(dec!(100), dec!(110), dec!(101), dec!(105)).validate().is_err());
    }

    #[test]
    fn negative_volume_rejected() {
        let mut b = bar(dec!(100), dec!(110), dec!(95), dec!(105));
        b.volume = dec!(-1);
        assert!(b.validate().is_err());
    }

    #[test]
    fn unaligned_open_time_rejected() {
        let mut b = bar(dec!(100), dec!(110), dec!(95), dec!(105));
        b.open_time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 7, 0).unwrap();
        assert!(b.validate().is_err());
    }

    #[test]
    fn alignment_helpers() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 13, 47, 12).unwrap();
        assert_eq!(
            Timeframe::M15.align(ts),
            Utc.with_ymd_and_hms(2024, 3, 1, 13, 45, 0).unwrap()
        );
        assert_eq!(
            Timeframe::H4.align(ts),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(
            Timeframe::D1.align(ts),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
        assert!(Timeframe::H1.is_aligned(
            Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap()
        ));
        assert!(!Timeframe::H1.is_aligned(ts));
    }

    #[test]
    fn timeframe_parse_roundtrip() {
        for tf in Timeframe::ALL {
            let parsed: Timeframe = tf.as_str().parse().unwrap();
            assert_eq!(parsed, tf);
        }
        assert!("3m".parse::<Timeframe>().is_err());
    }
}
