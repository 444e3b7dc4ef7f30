//! Time-driven candle closing: the single authority that retires candles.

use crate::application::store::CandleStore;
use crate::domain::types::minute_floor;
use crate::infrastructure::timeconv::now_market;
use chrono::{Duration as ChronoDuration, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct CandleCloser {
    store: Arc<CandleStore>,
    close_second: u32,
}

impl CandleCloser {
    pub fn new(store: Arc<CandleStore>, close_second: u32) -> Self {
        Self {
            store,
            close_second,
        }
    }

    /// Poll the wall clock twice per second. When the trigger second of a
    /// minute is reached, retire every candle of the minute that has just
    /// fully elapsed, then back off briefly so the same second cannot fire
    /// twice. The ingestor never deletes candles; this loop never creates
    /// them.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Candle closer started - closes at HH:MM:{:02}",
            self.close_second
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(Duration::from_millis(500)) => {}
            }

            let now = now_market();
            if now.second() == self.close_second {
                let target = minute_floor(now) - ChronoDuration::minutes(1);
                let closed = self.store.close_minute(target);
                if closed > 0 {
                    info!(
                        "Closing {} candles for {}",
                        closed,
                        target.format("%H:%M")
                    );
                }
                // Skip past the trigger second.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(Duration::from_millis(600)) => {}
                }
            }
        }
        info!("Candle closer stopped");
    }
}
