//! Shared in-memory candle state for one trading session.
//!
//! One mutex guards the open-candle map, the closed-candle queue and the
//! per-symbol rolling close windows. Every critical section is a pure map
//! or queue operation; no I/O and no awaiting happens under the lock.

use crate::application::volatility::RollingWindow;
use crate::domain::types::{Candle, CandleKey};
use chrono::{DateTime, FixedOffset};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Whether a tick created a new candle or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    Created,
    Updated,
}

#[derive(Default)]
struct StoreInner {
    open: HashMap<CandleKey, Candle>,
    closed: VecDeque<Candle>,
    windows: HashMap<String, RollingWindow>,
}

pub struct CandleStore {
    hv_window: usize,
    inner: Mutex<StoreInner>,
}

impl CandleStore {
    pub fn new(hv_window: usize) -> Self {
        Self {
            hv_window,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Fold an accepted tick into the candle for (symbol, minute), creating
    /// it on first touch. Appends the price to the symbol's rolling window
    /// and refreshes `hv` so the candle carries the latest reading when it
    /// closes. This is the only mutation path besides `close_minute`.
    pub fn apply_tick(
        &self,
        symbol: &str,
        minute: DateTime<FixedOffset>,
        price: f64,
        qty: u32,
    ) -> Fold {
        let mut guard = self.inner.lock().expect("candle store mutex poisoned");
        let inner = &mut *guard;

        let window = inner
            .windows
            .entry(symbol.to_string())
            .or_insert_with(|| RollingWindow::new(self.hv_window));
        window.push(price);

        let key = CandleKey {
            symbol: symbol.to_string(),
            minute,
        };
        match inner.open.get_mut(&key) {
            None => {
                inner
                    .open
                    .insert(key, Candle::new(symbol.to_string(), minute, price, qty));
                Fold::Created
            }
            Some(candle) => {
                candle.apply(price, qty);
                candle.hv = window.hv();
                Fold::Updated
            }
        }
    }

    /// Remove every open candle whose minute equals `minute` and move it to
    /// the closed queue. Returns how many were closed. Calling this again
    /// for the same minute is a no-op: the keys are already gone.
    pub fn close_minute(&self, minute: DateTime<FixedOffset>) -> usize {
        let mut guard = self.inner.lock().expect("candle store mutex poisoned");
        let inner = &mut *guard;

        let keys: Vec<CandleKey> = inner
            .open
            .keys()
            .filter(|k| k.minute == minute)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(candle) = inner.open.remove(key) {
                inner.closed.push_back(candle);
            }
        }
        keys.len()
    }

    /// Take everything pending persistence, oldest first.
    pub fn drain_closed(&self) -> Vec<Candle> {
        let mut guard = self.inner.lock().expect("candle store mutex poisoned");
        guard.closed.drain(..).collect()
    }

    /// Shutdown path: take the closed queue plus every still-open candle so
    /// nothing is discarded when the session ends.
    pub fn drain_all(&self) -> Vec<Candle> {
        let mut guard = self.inner.lock().expect("candle store mutex poisoned");
        let inner = &mut *guard;
        let mut out: Vec<Candle> = inner.closed.drain(..).collect();
        out.extend(inner.open.drain().map(|(_, c)| c));
        out
    }

    pub fn open_count(&self) -> usize {
        self.inner
            .lock()
            .expect("candle store mutex poisoned")
            .open
            .len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .expect("candle store mutex poisoned")
            .closed
            .len()
    }

    /// Clear all state at the start of a new session. Nothing survives in
    /// memory across sessions; durability is the on-disk files only.
    pub fn reset(&self) {
        let mut guard = self.inner.lock().expect("candle store mutex poisoned");
        guard.open.clear();
        guard.closed.clear();
        guard.windows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
    }

    fn minute(h: u32, m: u32) -> DateTime<FixedOffset> {
        tz().with_ymd_and_hms(2024, 6, 3, h, m, 0).unwrap()
    }

    #[test]
    fn first_tick_creates_then_updates() {
        let store = CandleStore::new(60);
        assert_eq!(store.apply_tick("INFY", minute(10, 0), 100.0, 5), Fold::Created);
        assert_eq!(store.apply_tick("INFY", minute(10, 0), 101.0, 5), Fold::Updated);
        assert_eq!(store.open_count(), 1);

        store.close_minute(minute(10, 0));
        let closed = store.drain_closed();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].open, 100.0);
        assert_eq!(closed[0].close, 101.0);
        assert_eq!(closed[0].volume, 10);
    }

    #[test]
    fn close_minute_only_touches_target_minute() {
        let store = CandleStore::new(60);
        store.apply_tick("INFY", minute(10, 0), 100.0, 1);
        store.apply_tick("INFY", minute(10, 1), 101.0, 1);
        store.apply_tick("TCS", minute(10, 0), 3900.0, 1);

        let n = store.close_minute(minute(10, 0));
        assert_eq!(n, 2);
        assert_eq!(store.open_count(), 1);
        assert_eq!(store.pending_count(), 2);
    }

    #[test]
    fn close_minute_is_idempotent() {
        let store = CandleStore::new(60);
        store.apply_tick("INFY", minute(10, 0), 100.0, 1);

        assert_eq!(store.close_minute(minute(10, 0)), 1);
        assert_eq!(store.close_minute(minute(10, 0)), 0);
        assert_eq!(store.drain_closed().len(), 1);
    }

    #[test]
    fn hv_updates_on_subsequent_ticks() {
        let store = CandleStore::new(60);
        store.apply_tick("INFY", minute(10, 0), 100.0, 1);
        store.apply_tick("INFY", minute(10, 0), 102.0, 1);
        store.apply_tick("INFY", minute(10, 0), 99.5, 1);

        store.close_minute(minute(10, 0));
        let closed = store.drain_closed();
        assert!(closed[0].hv > 0.0);
        assert!(closed[0].hv.is_finite());
    }

    #[test]
    fn drain_all_includes_open_candles() {
        let store = CandleStore::new(60);
        store.apply_tick("INFY", minute(10, 0), 100.0, 1);
        store.apply_tick("TCS", minute(10, 1), 3900.0, 1);
        store.close_minute(minute(10, 0));

        let all = store.drain_all();
        assert_eq!(all.len(), 2);
        assert_eq!(store.open_count(), 0);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let store = CandleStore::new(60);
        store.apply_tick("INFY", minute(10, 0), 100.0, 1);
        store.close_minute(minute(10, 0));
        store.apply_tick("INFY", minute(10, 1), 100.0, 1);

        store.reset();
        assert_eq!(store.open_count(), 0);
        assert_eq!(store.pending_count(), 0);
        assert!(store.drain_all().is_empty());
    }
}
