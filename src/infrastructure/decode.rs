//! Binary feed frame decoding.
//!
//! Frame layout (little-endian): byte 0 marker, [4..8] u32 security id,
//! [8..12] f32 last-traded price, [12..14] u16 last-traded quantity,
//! [14..18] u32 last-traded time. Minimum total length 62 bytes.
//!
//! One decoder instance is shared across all connections so the rejection
//! counters aggregate globally. Each distinct rejection reason is logged on
//! its first occurrence only; the ongoing tallies surface in the periodic
//! stats line instead of flooding the log.

use crate::domain::errors::DecodeError;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

pub const PACKET_MARKER: u8 = 8;
pub const MIN_PACKET_LEN: usize = 62;

/// How many decode errors get a full log line before going quiet.
const ERROR_LOG_BUDGET: u64 = 3;

/// Fields exactly as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawTick {
    pub security_id: u32,
    pub price: f32,
    pub qty: u16,
    pub trade_time: u32,
}

#[derive(Debug, Default)]
pub struct DecodeStats {
    pub total: AtomicU64,
    pub too_short: AtomicU64,
    pub wrong_marker: AtomicU64,
    pub processed: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    pub stats: DecodeStats,
}

fn read_u32(frame: &[u8], offset: usize, field: &'static str) -> Result<u32, DecodeError> {
    let bytes: [u8; 4] = frame
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or(DecodeError::Truncated { field })?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u16(frame: &[u8], offset: usize, field: &'static str) -> Result<u16, DecodeError> {
    let bytes: [u8; 2] = frame
        .get(offset..offset + 2)
        .and_then(|s| s.try_into().ok())
        .ok_or(DecodeError::Truncated { field })?;
    Ok(u16::from_le_bytes(bytes))
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame; `None` means it was rejected and counted. Never
    /// panics on malformed input, so a bad frame cannot take down the
    /// connection read loop.
    pub fn decode(&self, frame: &[u8]) -> Option<RawTick> {
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        match Self::unpack(frame) {
            Ok(tick) => {
                if self.stats.processed.fetch_add(1, Ordering::Relaxed) == 0 {
                    info!(
                        "First tick decoded: id={} ltp={:.2} ltq={} ltt={}",
                        tick.security_id, tick.price, tick.qty, tick.trade_time
                    );
                }
                Some(tick)
            }
            Err(e @ DecodeError::TooShort { .. }) => {
                if self.stats.too_short.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("{}", e);
                }
                None
            }
            Err(e @ DecodeError::WrongMarker { .. }) => {
                if self.stats.wrong_marker.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("{}", e);
                }
                None
            }
            Err(e) => {
                if self.stats.errors.fetch_add(1, Ordering::Relaxed) < ERROR_LOG_BUDGET {
                    error!("Frame decode error: {}", e);
                }
                None
            }
        }
    }

    fn unpack(frame: &[u8]) -> Result<RawTick, DecodeError> {
        if frame.len() < MIN_PACKET_LEN {
            return Err(DecodeError::TooShort {
                len: frame.len(),
                min: MIN_PACKET_LEN,
            });
        }
        if frame[0] != PACKET_MARKER {
            return Err(DecodeError::WrongMarker {
                found: frame[0],
                expected: PACKET_MARKER,
            });
        }
        Ok(RawTick {
            security_id: read_u32(frame, 4, "security id")?,
            price: f32::from_le_bytes(
                frame
                    .get(8..12)
                    .and_then(|s| s.try_into().ok())
                    .ok_or(DecodeError::Truncated { field: "price" })?,
            ),
            qty: read_u16(frame, 12, "quantity")?,
            trade_time: read_u32(frame, 14, "trade time")?,
        })
    }

    pub fn total(&self) -> u64 {
        self.stats.total.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.stats.processed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.stats.too_short.load(Ordering::Relaxed)
            + self.stats.wrong_marker.load(Ordering::Relaxed)
            + self.stats.errors.load(Ordering::Relaxed)
    }
}
