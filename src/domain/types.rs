use chrono::{DateTime, FixedOffset, Timelike};

/// One decoded trade, already converted to market time.
///
/// Ticks are transient: they are folded into a candle by the ingestor and
/// never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub security_id: u32,
    pub price: f64,
    pub qty: u32,
    pub exchange_time: DateTime<FixedOffset>,
}

/// Identifies one candle: a symbol and the start of its minute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandleKey {
    pub symbol: String,
    pub minute: DateTime<FixedOffset>,
}

/// A one-minute OHLCV bar.
///
/// Mutable only while it lives in the candle store. Once the closer removes
/// it, it is handed to the persister as-is and never touched again.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub minute: DateTime<FixedOffset>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub hv: f64,
    pub iv: f64,
}

impl Candle {
    pub fn new(symbol: String, minute: DateTime<FixedOffset>, price: f64, qty: u32) -> Self {
        Self {
            symbol,
            minute,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: qty as u64,
            hv: 0.0,
            iv: 0.0,
        }
    }

    /// Fold one more trade into the bar. OHLC math is commutative enough
    /// (max/min/last/sum) that any interleaving of ticks applied atomically
    /// under the store lock yields a correct result.
    pub fn apply(&mut self, price: f64, qty: u32) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += qty as u64;
    }
}

/// Truncate a timestamp to the start of its minute.
pub fn minute_floor(ts: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}
