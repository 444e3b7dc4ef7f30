//! Appends closed candles to per-symbol, per-day CSV files.
//!
//! Delivery is at-most-once: a row that fails to write is logged and
//! dropped. This is near-real-time telemetry, not an audit ledger.

use crate::application::store::CandleStore;
use crate::domain::types::Candle;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const CSV_HEADER: [&str; 8] = [
    "timestamp", "open", "high", "low", "close", "volume", "hv", "iv",
];

/// Strip characters that are unsafe in file names; company names come from
/// an external mapping file and are not trusted.
pub fn sanitize_for_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        "UNKNOWN".to_string()
    } else {
        cleaned
    }
}

/// `<root>/<company>/<company> <DD-MM-YYYY>.csv`
pub fn candle_path(root: &Path, candle: &Candle) -> PathBuf {
    let name = sanitize_for_filename(&candle.symbol);
    let date = candle.minute.format("%d-%m-%Y");
    root.join(&name).join(format!("{name} {date}.csv"))
}

fn write_candle(root: &Path, candle: &Candle) -> Result<()> {
    let path = candle_path(root, candle);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let needs_header = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if needs_header {
        writer.write_record(CSV_HEADER)?;
    }
    writer.write_record([
        candle.minute.format("%Y-%m-%d %H:%M:%S").to_string(),
        format!("{:.2}", candle.open),
        format!("{:.2}", candle.high),
        format!("{:.2}", candle.low),
        format!("{:.2}", candle.close),
        candle.volume.to_string(),
        format!("{:.4}", candle.hv),
        format!("{:.4}", candle.iv),
    ])?;
    writer.flush()?;
    Ok(())
}

pub struct Persister {
    store: Arc<CandleStore>,
    output_root: PathBuf,
}

impl Persister {
    pub fn new(store: Arc<CandleStore>, output_root: PathBuf) -> Self {
        Self { store, output_root }
    }

    /// Drain the closed queue once a second until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(Duration::from_secs(1)) => {}
            }
            self.flush_pending();
        }
        info!("Flusher stopped");
    }

    /// Write everything in the closed queue. The queue is drained under the
    /// store lock; the writes happen after it is released.
    pub fn flush_pending(&self) -> usize {
        let batch = self.store.drain_closed();
        for candle in &batch {
            self.write_one(candle);
        }
        batch.len()
    }

    /// Shutdown path: persist queued candles and anything still open so a
    /// clean stop discards nothing.
    pub fn flush_all(&self) -> usize {
        let batch = self.store.drain_all();
        for candle in &batch {
            self.write_one(candle);
        }
        batch.len()
    }

    fn write_one(&self, candle: &Candle) {
        match write_candle(&self.output_root, candle) {
            Ok(()) => info!(
                "Closed {} {} O:{:.2} H:{:.2} L:{:.2} C:{:.2} V:{} HV:{:.4} IV:{:.4}",
                candle.symbol,
                candle.minute.format("%Y-%m-%d %H:%M:%S"),
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume,
                candle.hv,
                candle.iv
            ),
            // Dropped, not retried.
            Err(e) => error!("Failed to persist candle for {}: {:#}", candle.symbol, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
    }

    fn sample_candle() -> Candle {
        Candle {
            symbol: "Tata Motors".to_string(),
            minute: tz().with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap(),
            open: 985.5,
            high: 989.25,
            low: 984.0,
            close: 988.1,
            volume: 1520,
            hv: 0.1234,
            iv: 0.0,
        }
    }

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "minutebar-test-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        root
    }

    #[test]
    fn sanitize_strips_unsafe_characters() {
        assert_eq!(sanitize_for_filename("Tata Motors"), "Tata Motors");
        assert_eq!(sanitize_for_filename("M&M/Ltd"), "MMLtd");
        assert_eq!(sanitize_for_filename("///"), "UNKNOWN");
    }

    #[test]
    fn path_uses_company_directory_and_day_suffix() {
        let candle = sample_candle();
        let path = candle_path(Path::new("/data"), &candle);
        assert_eq!(
            path,
            Path::new("/data/Tata Motors/Tata Motors 03-06-2024.csv")
        );
    }

    #[test]
    fn written_row_round_trips_at_stored_precision() {
        let root = temp_root("roundtrip");
        let candle = sample_candle();
        write_candle(&root, &candle).unwrap();

        let path = candle_path(&root, &candle);
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers, &CSV_HEADER[..]);

        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(&record[0], "2024-06-03 10:00:00");
        assert_eq!(record[1].parse::<f64>().unwrap(), 985.50);
        assert_eq!(record[2].parse::<f64>().unwrap(), 989.25);
        assert_eq!(record[3].parse::<f64>().unwrap(), 984.00);
        assert_eq!(record[4].parse::<f64>().unwrap(), 988.10);
        assert_eq!(record[5].parse::<u64>().unwrap(), 1520);
        assert_eq!(record[6].parse::<f64>().unwrap(), 0.1234);
        assert_eq!(record[7].parse::<f64>().unwrap(), 0.0);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn header_written_once_per_file() {
        let root = temp_root("header");
        let candle = sample_candle();
        write_candle(&root, &candle).unwrap();
        write_candle(&root, &candle).unwrap();

        let contents = std::fs::read_to_string(candle_path(&root, &candle)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,"));
        assert!(!lines[1].starts_with("timestamp,"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn flush_all_persists_open_and_queued_candles() {
        let root = temp_root("flushall");
        let store = Arc::new(CandleStore::new(60));
        let minute = tz().with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();
        store.apply_tick("INFY", minute, 1500.0, 3);
        store.close_minute(minute);
        store.apply_tick("TCS", tz().with_ymd_and_hms(2024, 6, 3, 10, 1, 0).unwrap(), 3900.0, 1);

        let persister = Persister::new(store.clone(), root.clone());
        assert_eq!(persister.flush_all(), 2);
        assert_eq!(store.open_count(), 0);

        let _ = std::fs::remove_dir_all(&root);
    }
}
