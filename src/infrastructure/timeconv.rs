//! Feed timestamp conversion into market time.
//!
//! The feed is inconsistent about units (seconds vs milliseconds) and some
//! frames carry UTC-naive values mislabeled as already-local. Both
//! heuristics live here, isolated and unit-tested, and take `now` as an
//! argument rather than reading the clock themselves.

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use tracing::warn;

/// Market timezone is a fixed +05:30 offset.
pub const MARKET_UTC_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

/// Values above this are taken to be milliseconds.
const MILLIS_THRESHOLD: u64 = 100_000_000_000;

pub fn market_offset() -> FixedOffset {
    FixedOffset::east_opt(MARKET_UTC_OFFSET_SECS).expect("offset within +/-24h")
}

pub fn now_market() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&market_offset())
}

/// Convert a raw feed trade time to market time.
///
/// If the converted value lands more than 3 hours ahead of `now`, the
/// market UTC offset is subtracted once; this repairs a known upstream bug
/// where frames carry UTC-naive values already shifted to local time. The
/// correction is best-effort: future values it does not catch are simply
/// rejected downstream by the grace window.
pub fn feed_time_to_market(raw: u64, now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let secs = if raw > MILLIS_THRESHOLD {
        raw / 1000
    } else {
        raw
    };

    let utc = Utc
        .timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_else(|| now.with_timezone(&Utc));
    let converted = utc.with_timezone(&market_offset());

    if converted - now > Duration::hours(3) {
        let corrected = converted - Duration::seconds(MARKET_UTC_OFFSET_SECS as i64);
        warn!(
            "Adjusted future trade time {} -> {}",
            converted.format("%Y-%m-%d %H:%M:%S"),
            corrected.format("%Y-%m-%d %H:%M:%S")
        );
        return corrected;
    }
    converted
}
