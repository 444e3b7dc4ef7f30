//! Feed transport: socket connections, subscription batching, reconnect.
//!
//! The symbol universe is partitioned into groups no larger than the
//! per-connection cap (upstream fan-out limit) and one socket is opened per
//! group, staggered to avoid simultaneous-connect throttling. Each
//! connection re-acquires credentials before every connect, applies
//! exponential backoff on ordinary errors, and a single long cool-down on
//! rate-limit signals: exceeding upstream limits must not be retried
//! aggressively or the block is extended.

use crate::application::ingest::TickIngestor;
use crate::domain::errors::FeedError;
use crate::domain::ports::CredentialProvider;
use crate::domain::types::Tick;
use crate::infrastructure::decode::FrameDecoder;
use crate::infrastructure::timeconv::{feed_time_to_market, now_market};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Transport knobs, fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub ws_url: String,
    pub subscription_batch_size: usize,
    pub subscription_batch_delay: Duration,
    pub max_subscription_retries: u32,
    pub subscription_retry_delay: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

/// Per-connection observability counters, shared with the stats loop.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub messages: AtomicU64,
}

/// A half-open socket keeps accepting outbound pings into the send buffer,
/// so liveness is judged on inbound traffic only: the peer is dead once
/// nothing has arrived for a full ping cycle plus the pong timeout.
fn peer_is_silent(idle: Duration, ping_interval: Duration, ping_timeout: Duration) -> bool {
    idle > ping_interval + ping_timeout
}

/// JSON subscription message for one batch of security ids.
pub fn subscription_payload(security_ids: &[String]) -> String {
    json!({
        "RequestCode": 21,
        "FeedType": "FULL",
        "InstrumentCount": security_ids.len(),
        "InstrumentList": security_ids
            .iter()
            .map(|sid| json!({"ExchangeSegment": "NSE_EQ", "SecurityId": sid}))
            .collect::<Vec<_>>(),
    })
    .to_string()
}

/// Feed URL with fresh credentials baked into the query string.
pub fn feed_url(base: &str, token: &str, client_id: &str) -> Result<String, url::ParseError> {
    let url = Url::parse_with_params(
        base,
        &[
            ("version", "2"),
            ("token", token),
            ("clientId", client_id),
            ("authType", "2"),
        ],
    )?;
    Ok(url.into())
}

enum ConnectionEnd {
    Shutdown,
    Reconnect,
}

pub struct FeedConnection {
    id: usize,
    security_ids: Vec<String>,
    settings: FeedSettings,
    credentials: Arc<dyn CredentialProvider>,
    decoder: Arc<FrameDecoder>,
    ingestor: Arc<TickIngestor>,
    stats: Arc<ConnectionStats>,
    reconnect_rx: watch::Receiver<u64>,
    cancel: CancellationToken,
}

impl FeedConnection {
    /// Reconnect loop. Failures inside this connection never affect other
    /// connections; every non-fatal error path ends in another attempt.
    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);

        while !self.cancel.is_cancelled() {
            let creds = match self.credentials.valid_token().await {
                Ok(creds) => creds,
                Err(e) => {
                    error!("[conn {}] no valid credentials: {}. Retrying in 30s", self.id, e);
                    if self.pause(Duration::from_secs(30)).await {
                        break;
                    }
                    continue;
                }
            };

            let url = match feed_url(&self.settings.ws_url, &creds.token, &creds.client_id) {
                Ok(url) => url,
                Err(e) => {
                    error!("[conn {}] bad feed URL: {}", self.id, e);
                    break;
                }
            };

            info!(
                "[conn {}] connecting ({} instruments, client {})",
                self.id,
                self.security_ids.len(),
                creds.client_id
            );

            match self.run_connection(&url).await {
                Ok(ConnectionEnd::Shutdown) => break,
                Ok(ConnectionEnd::Reconnect) => {
                    info!("[conn {}] credential rotation, reconnecting", self.id);
                    backoff = Duration::from_secs(1);
                }
                Err(FeedError::RateLimited { detail }) => {
                    warn!(
                        "[conn {}] rate limit detected ({}). Cooling down for 300s; do not restart",
                        self.id, detail
                    );
                    if self.pause(Duration::from_secs(300)).await {
                        break;
                    }
                    backoff = Duration::from_secs(30);
                }
                Err(e) => {
                    error!(
                        "[conn {}] {}. Reconnecting in {:?}",
                        self.id, e, backoff
                    );
                    if self.pause(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
        info!("[conn {}] stopped", self.id);
    }

    /// Sleep unless cancelled first; returns true when cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = sleep(duration) => false,
        }
    }

    async fn run_connection(&self, url: &str) -> Result<ConnectionEnd, FeedError> {
        let (stream, _) = connect_async(url).await.map_err(FeedError::from_transport)?;
        let (mut write, mut read) = stream.split();

        // A fresh clone has already seen the current epoch, so only
        // rotations that happen after this connect trigger a reconnect.
        let mut reconnect_rx = self.reconnect_rx.clone();

        self.send_subscriptions(&mut write).await;
        info!("[conn {}] waiting for tick data", self.id);

        let mut ping = tokio::time::interval(self.settings.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut text_messages = 0u32;
        let mut last_inbound = Instant::now();
        // Disarmed once the rotation sender is gone, so a dead channel
        // cannot turn this loop into a busy spin.
        let mut rotation_live = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(ConnectionEnd::Shutdown);
                }
                changed = reconnect_rx.changed(), if rotation_live => {
                    match changed {
                        Ok(()) => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(ConnectionEnd::Reconnect);
                        }
                        Err(_) => rotation_live = false,
                    }
                }
                _ = ping.tick() => {
                    let idle = last_inbound.elapsed();
                    if peer_is_silent(idle, self.settings.ping_interval, self.settings.ping_timeout) {
                        return Err(FeedError::ConnectionLost {
                            reason: format!("no inbound data for {idle:.0?}"),
                        });
                    }
                    write
                        .send(Message::Ping(Vec::new().into()))
                        .await
                        .map_err(FeedError::from_transport)?;
                }
                msg = read.next() => match msg {
                    Some(Ok(msg)) => {
                        last_inbound = Instant::now();
                        match msg {
                            Message::Binary(frame) => self.on_frame(&frame),
                            Message::Text(text) => {
                                text_messages += 1;
                                if text_messages <= 5 {
                                    let preview: String = text.chars().take(100).collect();
                                    debug!("[conn {}] text message: {}", self.id, preview);
                                }
                            }
                            Message::Close(frame) => {
                                return Err(FeedError::from_transport(format!(
                                    "closed by server: {frame:?}"
                                )));
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => return Err(FeedError::from_transport(e)),
                    None => {
                        return Err(FeedError::ConnectionLost {
                            reason: "stream ended".to_string(),
                        });
                    }
                }
            }
        }
    }

    fn on_frame(&self, frame: &[u8]) {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);
        let now = now_market();

        if let Some(raw) = self.decoder.decode(frame) {
            let tick = Tick {
                security_id: raw.security_id,
                price: raw.price as f64,
                qty: raw.qty as u32,
                exchange_time: feed_time_to_market(raw.trade_time as u64, now),
            };
            self.ingestor.ingest_at(&tick, now);
        }
    }

    /// Send subscriptions in batches with an inter-batch delay, retrying
    /// each batch a bounded number of times. Failed batches are reported
    /// but never fatal to the connection.
    async fn send_subscriptions(&self, write: &mut WsSink) {
        let total = self.security_ids.len();
        let batch_size = self.settings.subscription_batch_size.max(1);
        let batches: Vec<&[String]> = self.security_ids.chunks(batch_size).collect();
        let num_batches = batches.len();

        if num_batches > 1 {
            info!(
                "[conn {}] splitting {} instruments into {} batches of ~{}",
                self.id, total, num_batches, batch_size
            );
        }

        let mut failed_instruments = 0;
        for (i, batch) in batches.iter().enumerate() {
            let payload = subscription_payload(batch);
            let mut sent = false;

            for attempt in 1..=self.settings.max_subscription_retries {
                match write.send(Message::Text(payload.clone().into())).await {
                    Ok(()) => {
                        sent = true;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            "[conn {}] batch {}/{} send failed (attempt {}/{}): {}",
                            self.id,
                            i + 1,
                            num_batches,
                            attempt,
                            self.settings.max_subscription_retries,
                            e
                        );
                        if attempt < self.settings.max_subscription_retries
                            && self.pause(self.settings.subscription_retry_delay).await
                        {
                            return;
                        }
                    }
                }
            }

            if !sent {
                failed_instruments += batch.len();
            }
            if sent && i < num_batches - 1 && self.pause(self.settings.subscription_batch_delay).await {
                return;
            }
        }

        if failed_instruments > 0 {
            warn!(
                "[conn {}] {} of {} instruments failed to subscribe",
                self.id, failed_instruments, total
            );
        } else {
            info!(
                "[conn {}] subscribed {} instruments in {} batches",
                self.id, total, num_batches
            );
        }
    }
}

/// Owns one connection task per symbol partition.
pub struct ConnectionManager {
    stats: Vec<Arc<ConnectionStats>>,
    handles: Vec<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Partition `security_ids` into groups of at most `max_per_connection`
    /// and spawn one connection per group, staggered by `stagger` to avoid
    /// simultaneous-connect throttling.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        security_ids: &[String],
        max_per_connection: usize,
        stagger: Duration,
        settings: FeedSettings,
        credentials: Arc<dyn CredentialProvider>,
        decoder: Arc<FrameDecoder>,
        ingestor: Arc<TickIngestor>,
        reconnect_rx: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) -> Self {
        let mut stats = Vec::new();
        let mut handles = Vec::new();

        for (id, group) in security_ids
            .chunks(max_per_connection.max(1))
            .enumerate()
        {
            let conn_stats = Arc::new(ConnectionStats::default());
            stats.push(conn_stats.clone());

            let connection = FeedConnection {
                id,
                security_ids: group.to_vec(),
                settings: settings.clone(),
                credentials: credentials.clone(),
                decoder: decoder.clone(),
                ingestor: ingestor.clone(),
                stats: conn_stats,
                reconnect_rx: reconnect_rx.clone(),
                cancel: cancel.clone(),
            };

            let delay = stagger * id as u32;
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                if delay > Duration::ZERO {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                }
                connection.run().await;
            }));
        }

        info!(
            "Started {} feed connections for {} instruments",
            handles.len(),
            security_ids.len()
        );
        Self { stats, handles }
    }

    pub fn connection_count(&self) -> usize {
        self.stats.len()
    }

    pub fn total_messages(&self) -> u64 {
        self.stats
            .iter()
            .map(|s| s.messages.load(Ordering::Relaxed))
            .sum()
    }

    /// Wait for all connection tasks, bounded by `timeout`.
    pub async fn join(self, timeout: Duration) {
        let join_all = async {
            for handle in self.handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, join_all).await.is_err() {
            warn!("Feed connections did not stop within {:?}", timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_payload_shape() {
        let payload = subscription_payload(&["1333".to_string(), "11536".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(value["RequestCode"], 21);
        assert_eq!(value["FeedType"], "FULL");
        assert_eq!(value["InstrumentCount"], 2);
        assert_eq!(value["InstrumentList"][0]["ExchangeSegment"], "NSE_EQ");
        assert_eq!(value["InstrumentList"][0]["SecurityId"], "1333");
        assert_eq!(value["InstrumentList"][1]["SecurityId"], "11536");
    }

    #[test]
    fn feed_url_carries_credentials() {
        let url = feed_url("wss://api-feed.example.co", "tok-abc", "C1").unwrap();
        assert!(url.starts_with("wss://api-feed.example.co"));
        assert!(url.contains("version=2"));
        assert!(url.contains("token=tok-abc"));
        assert!(url.contains("clientId=C1"));
        assert!(url.contains("authType=2"));
    }

    #[test]
    fn silent_peer_detected_after_ping_cycle_plus_timeout() {
        let interval = Duration::from_secs(20);
        let timeout = Duration::from_secs(10);
        assert!(!peer_is_silent(Duration::from_secs(19), interval, timeout));
        assert!(!peer_is_silent(Duration::from_secs(30), interval, timeout));
        assert!(peer_is_silent(Duration::from_secs(31), interval, timeout));
    }

    #[tokio::test]
    async fn rotation_branch_disarms_once_sender_is_gone() {
        let (tx, mut rx) = watch::channel(0u64);
        drop(tx);

        // Same guard shape as the connection read loop: the first Err
        // disarms the branch, after which the select falls through to the
        // other arms instead of re-polling the dead channel.
        let mut rotation_live = true;
        for _ in 0..2 {
            tokio::select! {
                changed = rx.changed(), if rotation_live => {
                    assert!(changed.is_err());
                    rotation_live = false;
                }
                _ = sleep(Duration::from_millis(5)) => {}
            }
        }
        assert!(!rotation_live);
    }

    #[test]
    fn universe_partitions_respect_connection_cap() {
        let ids: Vec<String> = (0..800).map(|i| i.to_string()).collect();
        let groups: Vec<&[String]> = ids.chunks(350).collect();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 350);
        assert_eq!(groups[2].len(), 100);
    }
}
