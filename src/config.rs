use anyhow::{Context, Result, ensure};
use chrono::NaiveTime;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub feed_ws_url: String,
    pub token_path: PathBuf,
    pub universe_path: PathBuf,
    pub output_root: PathBuf,
    // Connection fan-out
    pub max_per_connection: usize,
    pub connection_stagger: Duration,
    pub subscription_batch_size: usize,
    pub subscription_batch_delay: Duration,
    pub max_subscription_retries: u32,
    pub subscription_retry_delay: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    // Candle closing
    pub grace_window_seconds: u32,
    pub candle_close_second: u32,
    pub hv_window: usize,
    // Market hours (market-local time)
    pub market_pre_open: NaiveTime,
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
    pub market_hard_stop: NaiveTime,
    pub stats_interval: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_time(value: &str, key: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .with_context(|| format!("Failed to parse {key}: {value} (expected HH:MM)"))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let feed_ws_url = env_or("FEED_WS_URL", "wss://api-feed.dhan.co");
        let token_path = PathBuf::from(env_or("TOKEN_PATH", "dhan_token.json"));
        let universe_path = PathBuf::from(env_or("UNIVERSE_PATH", "mapping_security_ids.csv"));
        let output_root =
            PathBuf::from(env_or("TICKS_BASE_DIR", "data_ohlcv")).join(env_or("GROUP_NAME", "group_XX"));

        let max_per_connection = env_or("MAX_PER_CONNECTION", "350")
            .parse::<usize>()
            .context("Failed to parse MAX_PER_CONNECTION")?;

        let connection_stagger_secs = env_or("CONNECTION_STAGGER_SECS", "5")
            .parse::<u64>()
            .context("Failed to parse CONNECTION_STAGGER_SECS")?;

        let subscription_batch_size = env_or("SUBSCRIPTION_BATCH_SIZE", "20")
            .parse::<usize>()
            .context("Failed to parse SUBSCRIPTION_BATCH_SIZE")?;

        let subscription_batch_delay_ms = env_or("SUBSCRIPTION_BATCH_DELAY_MS", "1200")
            .parse::<u64>()
            .context("Failed to parse SUBSCRIPTION_BATCH_DELAY_MS")?;

        let max_subscription_retries = env_or("MAX_SUBSCRIPTION_RETRIES", "3")
            .parse::<u32>()
            .context("Failed to parse MAX_SUBSCRIPTION_RETRIES")?;

        let subscription_retry_delay_secs = env_or("SUBSCRIPTION_RETRY_DELAY_SECS", "5")
            .parse::<u64>()
            .context("Failed to parse SUBSCRIPTION_RETRY_DELAY_SECS")?;

        let ping_interval_secs = env_or("PING_INTERVAL_SECS", "20")
            .parse::<u64>()
            .context("Failed to parse PING_INTERVAL_SECS")?;

        let ping_timeout_secs = env_or("PING_TIMEOUT_SECS", "10")
            .parse::<u64>()
            .context("Failed to parse PING_TIMEOUT_SECS")?;

        let grace_window_seconds = env_or("GRACE_WINDOW_SECONDS", "2")
            .parse::<u32>()
            .context("Failed to parse GRACE_WINDOW_SECONDS")?;

        let candle_close_second = env_or("CANDLE_CLOSE_SECOND", "2")
            .parse::<u32>()
            .context("Failed to parse CANDLE_CLOSE_SECOND")?;

        let hv_window = env_or("HV_WINDOW", "60")
            .parse::<usize>()
            .context("Failed to parse HV_WINDOW")?;

        let market_pre_open = parse_time(&env_or("MARKET_PRE_OPEN", "09:00"), "MARKET_PRE_OPEN")?;
        let market_open = parse_time(&env_or("MARKET_OPEN", "09:15"), "MARKET_OPEN")?;
        let market_close = parse_time(&env_or("MARKET_CLOSE", "15:30"), "MARKET_CLOSE")?;
        let market_hard_stop =
            parse_time(&env_or("MARKET_HARD_STOP", "15:31"), "MARKET_HARD_STOP")?;

        let stats_interval_secs = env_or("STATS_INTERVAL_SECS", "30")
            .parse::<u64>()
            .context("Failed to parse STATS_INTERVAL_SECS")?;

        ensure!(
            candle_close_second < 60,
            "CANDLE_CLOSE_SECOND must be < 60, got {candle_close_second}"
        );
        ensure!(
            grace_window_seconds < 60,
            "GRACE_WINDOW_SECONDS must be < 60, got {grace_window_seconds}"
        );
        ensure!(max_per_connection > 0, "MAX_PER_CONNECTION must be > 0");
        ensure!(subscription_batch_size > 0, "SUBSCRIPTION_BATCH_SIZE must be > 0");
        ensure!(hv_window >= 2, "HV_WINDOW must be >= 2, got {hv_window}");
        ensure!(
            market_pre_open <= market_open && market_open < market_close
                && market_close <= market_hard_stop,
            "market times must satisfy pre_open <= open < close <= hard_stop"
        );

        Ok(Config {
            feed_ws_url,
            token_path,
            universe_path,
            output_root,
            max_per_connection,
            connection_stagger: Duration::from_secs(connection_stagger_secs),
            subscription_batch_size,
            subscription_batch_delay: Duration::from_millis(subscription_batch_delay_ms),
            max_subscription_retries,
            subscription_retry_delay: Duration::from_secs(subscription_retry_delay_secs),
            ping_interval: Duration::from_secs(ping_interval_secs),
            ping_timeout: Duration::from_secs(ping_timeout_secs),
            grace_window_seconds,
            candle_close_second,
            hv_window,
            market_pre_open,
            market_open,
            market_close,
            market_hard_stop,
            stats_interval: Duration::from_secs(stats_interval_secs),
        })
    }
}
