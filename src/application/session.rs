//! Daily session lifecycle: PRE_OPEN -> ACTIVE -> CLOSED -> SLEEPING.
//!
//! One session runs from market open to the hard stop. On entry all shared
//! state is reset and the workers are started; on exit everything is
//! cancelled, joined with a bounded timeout, and remaining candles are
//! force-flushed. Between sessions the controller sleeps in small chunks so
//! shutdown stays responsive.

use crate::application::closer::CandleCloser;
use crate::application::ingest::TickIngestor;
use crate::application::persister::Persister;
use crate::application::store::CandleStore;
use crate::config::Config;
use crate::domain::ports::CredentialProvider;
use crate::infrastructure::decode::FrameDecoder;
use crate::infrastructure::feed::{ConnectionManager, FeedSettings};
use crate::infrastructure::timeconv::now_market;
use crate::infrastructure::universe::SymbolUniverse;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long to wait for worker tasks on session teardown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Credential watcher period.
const CREDENTIAL_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Fixed local market boundaries for one trading day.
#[derive(Debug, Clone, Copy)]
pub struct MarketHours {
    pub pre_open: NaiveTime,
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub hard_stop: NaiveTime,
}

impl MarketHours {
    /// Past the hard stop: the session (if any) must end.
    pub fn is_past_close(&self, now: DateTime<FixedOffset>) -> bool {
        now.time() >= self.hard_stop
    }

    pub fn is_before_pre_open(&self, now: DateTime<FixedOffset>) -> bool {
        now.time() < self.pre_open
    }

    /// The next pre-open instant strictly after `now`.
    pub fn next_pre_open(&self, now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        let today = now
            .with_time(self.pre_open)
            .single()
            .unwrap_or(now);
        if now < today {
            today
        } else {
            today + ChronoDuration::days(1)
        }
    }
}

pub struct SessionController {
    config: Config,
    hours: MarketHours,
    universe: Arc<SymbolUniverse>,
    credentials: Arc<dyn CredentialProvider>,
    store: Arc<CandleStore>,
}

impl SessionController {
    pub fn new(
        config: Config,
        universe: Arc<SymbolUniverse>,
        credentials: Arc<dyn CredentialProvider>,
        store: Arc<CandleStore>,
    ) -> Self {
        let hours = MarketHours {
            pre_open: config.market_pre_open,
            open: config.market_open,
            close: config.market_close,
            hard_stop: config.market_hard_stop,
        };
        Self {
            config,
            hours,
            universe,
            credentials,
            store,
        }
    }

    /// Outer loop: run one session per trading day until shutdown.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Credentials must be obtainable before a session starts.
            match self.credentials.valid_token().await {
                Ok(creds) => info!("Credentials OK (client {})", creds.client_id),
                Err(e) => {
                    error!("Failed to get valid credentials: {}. Retrying in 60s", e);
                    if pause(&shutdown, Duration::from_secs(60)).await {
                        break;
                    }
                    continue;
                }
            }

            let now = now_market();
            if self.hours.is_past_close(now) {
                info!(
                    "Market is closed ({}). Sleeping until next pre-open",
                    now.format("%H:%M:%S")
                );
            } else if self.hours.is_before_pre_open(now) {
                info!(
                    "Market has not opened yet ({}). Sleeping until pre-open",
                    now.format("%H:%M:%S")
                );
            } else {
                self.run_session(&shutdown).await;
                if shutdown.is_cancelled() {
                    break;
                }
                info!("Market closed for today");
            }

            if self.sleep_until_pre_open(&shutdown).await {
                break;
            }
            info!("Waking up for the next trading session");
        }
        info!("Session controller stopped");
        Ok(())
    }

    /// One trading session: reset state, start workers, supervise until the
    /// hard stop or shutdown, then tear down and force-flush.
    async fn run_session(&self, shutdown: &CancellationToken) {
        info!(
            "Starting OHLCV capture: {} instruments, 1-minute candles, candle close at HH:MM:{:02}, market {}-{} (hard stop {})",
            self.universe.len(),
            self.config.candle_close_second,
            self.hours.open.format("%H:%M"),
            self.hours.close.format("%H:%M"),
            self.hours.hard_stop.format("%H:%M")
        );
        self.store.reset();

        let session = shutdown.child_token();
        let decoder = Arc::new(FrameDecoder::new());
        let ingestor = Arc::new(TickIngestor::new(
            self.store.clone(),
            self.universe.clone(),
            self.config.grace_window_seconds,
        ));
        let persister = Arc::new(Persister::new(
            self.store.clone(),
            self.config.output_root.clone(),
        ));
        let (reconnect_tx, reconnect_rx) = watch::channel(0u64);

        let closer = CandleCloser::new(self.store.clone(), self.config.candle_close_second);
        let closer_handle = tokio::spawn(closer.run(session.child_token()));
        let flusher_handle = tokio::spawn(persister.clone().run(session.child_token()));
        let watcher_handle = tokio::spawn(credential_watcher(
            self.credentials.clone(),
            reconnect_tx,
            session.child_token(),
        ));

        let manager = ConnectionManager::spawn(
            self.universe.security_ids(),
            self.config.max_per_connection,
            self.config.connection_stagger,
            FeedSettings {
                ws_url: self.config.feed_ws_url.clone(),
                subscription_batch_size: self.config.subscription_batch_size,
                subscription_batch_delay: self.config.subscription_batch_delay,
                max_subscription_retries: self.config.max_subscription_retries,
                subscription_retry_delay: self.config.subscription_retry_delay,
                ping_interval: self.config.ping_interval,
                ping_timeout: self.config.ping_timeout,
            },
            self.credentials.clone(),
            decoder.clone(),
            ingestor.clone(),
            reconnect_rx,
            session.child_token(),
        );

        let mut stats_timer = tokio::time::interval(self.config.stats_interval);
        stats_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        stats_timer.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested mid-session");
                    break;
                }
                _ = stats_timer.tick() => {
                    info!(
                        "Stats: clients={} messages={} frames={} decoded={} rejected_frames={} rejected_ticks={} open_candles={} pending={}",
                        manager.connection_count(),
                        manager.total_messages(),
                        decoder.total(),
                        decoder.processed(),
                        decoder.rejected(),
                        ingestor.rejected_count(),
                        self.store.open_count(),
                        self.store.pending_count()
                    );
                }
                _ = sleep(Duration::from_secs(1)) => {
                    if self.hours.is_past_close(now_market()) {
                        info!("Market close reached. Stopping data collection");
                        break;
                    }
                }
            }
        }

        session.cancel();
        manager.join(JOIN_TIMEOUT).await;
        for handle in [closer_handle, flusher_handle, watcher_handle] {
            if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Session worker did not stop within {:?}", JOIN_TIMEOUT);
            }
        }

        let flushed = persister.flush_all();
        info!("Session end: cleanup complete, {} candles force-flushed", flushed);
    }

    /// Returns true when interrupted by shutdown.
    async fn sleep_until_pre_open(&self, shutdown: &CancellationToken) -> bool {
        let now = now_market();
        let target = self.hours.next_pre_open(now);
        let mut remaining = (target - now).num_seconds().max(0) as u64;
        info!(
            "Sleeping {:.2}h until {}",
            remaining as f64 / 3600.0,
            target.format("%Y-%m-%d %H:%M:%S")
        );

        while remaining > 0 {
            let chunk = remaining.min(60);
            if pause(shutdown, Duration::from_secs(chunk)).await {
                return true;
            }
            remaining -= chunk;
        }
        false
    }
}

/// Returns true when cancelled before the duration elapsed.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

/// Periodically verify the credentials and signal every connection to
/// reconnect when an external rotation is detected.
async fn credential_watcher(
    credentials: Arc<dyn CredentialProvider>,
    reconnect_tx: watch::Sender<u64>,
    cancel: CancellationToken,
) {
    info!("Credential watcher started");
    loop {
        if pause(&cancel, CREDENTIAL_CHECK_INTERVAL).await {
            break;
        }
        if let Err(e) = credentials.valid_token().await {
            warn!("Credential check failed: {}", e);
            continue;
        }
        if credentials.has_changed().await {
            info!("Credential rotation detected, signalling reconnect to all connections");
            reconnect_tx.send_modify(|epoch| *epoch += 1);
        }
    }
    info!("Credential watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::timeconv::market_offset;
    use chrono::TimeZone;

    fn hours() -> MarketHours {
        MarketHours {
            pre_open: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            hard_stop: NaiveTime::from_hms_opt(15, 31, 0).unwrap(),
        }
    }

    fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
        market_offset().with_ymd_and_hms(2024, 6, 3, h, m, 0).unwrap()
    }

    #[test]
    fn hard_stop_boundary() {
        let h = hours();
        assert!(!h.is_past_close(at(15, 30)));
        assert!(h.is_past_close(at(15, 31)));
        assert!(h.is_past_close(at(16, 0)));
    }

    #[test]
    fn pre_open_boundary() {
        let h = hours();
        assert!(h.is_before_pre_open(at(8, 59)));
        assert!(!h.is_before_pre_open(at(9, 0)));
    }

    #[test]
    fn next_pre_open_rolls_to_tomorrow_after_target() {
        let h = hours();
        assert_eq!(h.next_pre_open(at(8, 0)), at(9, 0));

        let tomorrow = h.next_pre_open(at(16, 0));
        assert_eq!(tomorrow, at(9, 0) + ChronoDuration::days(1));
    }
}
