//! Tick validation and the single fold-into-store path.

use crate::application::store::{CandleStore, Fold};
use crate::domain::types::{Tick, minute_floor};
use crate::infrastructure::timeconv::now_market;
use crate::infrastructure::universe::SymbolUniverse;
use chrono::{DateTime, Duration, FixedOffset, Timelike};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// How many rejections are logged at WARN before throttling to DEBUG.
const REJECT_LOG_BUDGET: u64 = 5;

/// Grace-window acceptance rule.
///
/// A tick for the current minute is always accepted. A tick for the
/// previous minute is accepted only while `now` is still within the grace
/// window after the boundary. Everything else is rejected; a tick one
/// second late and a tick one hour late are rejected identically.
pub fn tick_acceptable(
    tick_time: DateTime<FixedOffset>,
    now: DateTime<FixedOffset>,
    grace_window_seconds: u32,
) -> bool {
    let tick_minute = minute_floor(tick_time);
    let now_minute = minute_floor(now);

    if tick_minute == now_minute {
        return true;
    }
    if tick_minute == now_minute - Duration::minutes(1) {
        return now.second() <= grace_window_seconds;
    }
    false
}

pub struct TickIngestor {
    store: Arc<CandleStore>,
    universe: Arc<SymbolUniverse>,
    grace_window_seconds: u32,
    rejected: AtomicU64,
}

impl TickIngestor {
    pub fn new(
        store: Arc<CandleStore>,
        universe: Arc<SymbolUniverse>,
        grace_window_seconds: u32,
    ) -> Self {
        Self {
            store,
            universe,
            grace_window_seconds,
            rejected: AtomicU64::new(0),
        }
    }

    pub fn ingest(&self, tick: &Tick) {
        self.ingest_at(tick, now_market());
    }

    /// Validate against `now` and fold into the store. Split out from
    /// `ingest` so the connection loop can reuse the wall-clock reading it
    /// already took for time conversion, and so tests can pin the clock.
    pub fn ingest_at(&self, tick: &Tick, now: DateTime<FixedOffset>) {
        let symbol = self.universe.display_name(tick.security_id);

        if !tick_acceptable(tick.exchange_time, now, self.grace_window_seconds) {
            let n = self.rejected.fetch_add(1, Ordering::Relaxed);
            if n < REJECT_LOG_BUDGET {
                warn!(
                    "{} tick at {} outside acceptance window (now: {})",
                    symbol,
                    tick.exchange_time.format("%H:%M:%S"),
                    now.format("%H:%M:%S")
                );
            } else if (n + 1) % 1000 == 0 {
                warn!("{} ticks rejected so far", n + 1);
            } else {
                debug!(
                    "{} tick at {} rejected (now: {})",
                    symbol,
                    tick.exchange_time.format("%H:%M:%S"),
                    now.format("%H:%M:%S")
                );
            }
            return;
        }

        let minute = minute_floor(tick.exchange_time);
        match self.store.apply_tick(&symbol, minute, tick.price, tick.qty) {
            Fold::Created => debug!(
                "{} {} new candle O/H/L/C:{:.2} V:{}",
                symbol,
                tick.exchange_time.format("%H:%M:%S"),
                tick.price,
                tick.qty
            ),
            Fold::Updated => debug!(
                "{} {} tick {:.2} V:{}",
                symbol,
                tick.exchange_time.format("%H:%M:%S"),
                tick.price,
                tick.qty
            ),
        }
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::universe::SymbolUniverse;
    use chrono::TimeZone;

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<FixedOffset> {
        tz().with_ymd_and_hms(2024, 6, 3, h, m, s).unwrap()
    }

    #[test]
    fn current_minute_always_accepted() {
        assert!(tick_acceptable(at(10, 0, 10), at(10, 0, 59), 2));
        assert!(tick_acceptable(at(10, 0, 59), at(10, 0, 0), 2));
    }

    #[test]
    fn previous_minute_accepted_only_within_grace() {
        // Boundary: second == grace window is still accepted.
        assert!(tick_acceptable(at(10, 0, 59), at(10, 1, 2), 2));
        assert!(!tick_acceptable(at(10, 0, 59), at(10, 1, 3), 2));
    }

    #[test]
    fn older_and_future_minutes_rejected() {
        // Two minutes old: rejected even at second zero.
        assert!(!tick_acceptable(at(9, 58, 59), at(10, 0, 0), 2));
        // One hour late rejected identically to one second late.
        assert!(!tick_acceptable(at(9, 0, 30), at(10, 0, 3), 2));
        // Future minute.
        assert!(!tick_acceptable(at(10, 1, 0), at(10, 0, 30), 2));
    }

    fn ingestor() -> (Arc<CandleStore>, TickIngestor) {
        let store = Arc::new(CandleStore::new(60));
        let universe = Arc::new(SymbolUniverse::default());
        (store.clone(), TickIngestor::new(store, universe, 2))
    }

    fn tick(price: f64, time: DateTime<FixedOffset>) -> Tick {
        Tick {
            security_id: 1333,
            price,
            qty: 10,
            exchange_time: time,
        }
    }

    #[test]
    fn minute_scenario_folds_to_expected_candle() {
        let (store, ingestor) = ingestor();

        ingestor.ingest_at(&tick(100.0, at(10, 0, 10)), at(10, 0, 10));
        ingestor.ingest_at(&tick(105.0, at(10, 0, 40)), at(10, 0, 40));
        ingestor.ingest_at(&tick(98.0, at(10, 0, 59)), at(10, 0, 59));

        // Close at 10:01:02.
        assert_eq!(store.close_minute(at(10, 0, 0)), 1);
        let closed = store.drain_closed();
        let c = &closed[0];
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 105.0);
        assert_eq!(c.low, 98.0);
        assert_eq!(c.close, 98.0);
        assert_eq!(c.volume, 30);
    }

    #[test]
    fn late_tick_cannot_recreate_closed_candle() {
        let (store, ingestor) = ingestor();

        ingestor.ingest_at(&tick(100.0, at(10, 0, 30)), at(10, 0, 30));
        assert_eq!(store.close_minute(at(10, 0, 0)), 1);
        store.drain_closed();

        // Arrives at 10:01:03, one second past the grace window.
        ingestor.ingest_at(&tick(101.0, at(10, 0, 59)), at(10, 1, 3));
        assert_eq!(store.open_count(), 0);
        assert_eq!(ingestor.rejected_count(), 1);
    }

    #[test]
    fn unknown_security_id_falls_back_to_numeric_symbol() {
        let (store, ingestor) = ingestor();
        ingestor.ingest_at(&tick(55.0, at(10, 0, 5)), at(10, 0, 5));

        store.close_minute(at(10, 0, 0));
        let closed = store.drain_closed();
        assert_eq!(closed[0].symbol, "1333");
    }
}
