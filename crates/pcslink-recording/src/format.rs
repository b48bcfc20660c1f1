// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Interchange record for captured frames.
//!
//! One [`RecordedFrame`] per bus frame, in the field order the sinks
//! emit: `ts_iso, ts_monotonic_ns, direction, can_id_hex, pf_hex,
//! payload_hex, decoded_json`.

use chrono::{DateTime, Utc};
use pcslink::{BusFrame, Decoded};
use serde::Serialize;
use std::time::Instant;

/// Who sent the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Controller -> PCS.
    Tx,
    /// PCS -> controller.
    Rx,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Tx => "tx",
            Direction::Rx => "rx",
        }
    }
}

/// One captured frame, ready for the CSV/JSONL sinks.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedFrame {
    /// Wall-clock capture time, ISO-8601 UTC.
    pub ts_iso: DateTime<Utc>,
    /// Monotonic capture time relative to recorder start.
    pub ts_monotonic_ns: u64,
    pub direction: Direction,
    /// Full 29-bit identifier, `0x`-prefixed.
    pub can_id_hex: String,
    /// PDU Format byte, `0x`-prefixed.
    pub pf_hex: String,
    /// Raw payload bytes, contiguous hex.
    pub payload_hex: String,
    /// Decoded record, if the PF had a decoder row.
    pub decoded_json: Option<Decoded>,
}

/// Timestamp anchor pairing a wall clock with a monotonic zero.
#[derive(Debug, Clone, Copy)]
pub struct CaptureClock {
    started_wall: DateTime<Utc>,
    started_mono: Instant,
}

impl CaptureClock {
    #[must_use]
    pub fn start() -> Self {
        Self {
            started_wall: Utc::now(),
            started_mono: Instant::now(),
        }
    }

    /// Build the record for one frame.
    #[must_use]
    pub fn record(
        &self,
        direction: Direction,
        frame: &BusFrame,
        decoded: Option<&Decoded>,
    ) -> RecordedFrame {
        let offset = frame
            .ts
            .saturating_duration_since(self.started_mono);
        let ts_iso = self.started_wall
            + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
        RecordedFrame {
            ts_iso,
            ts_monotonic_ns: offset.as_nanos() as u64,
            direction,
            can_id_hex: format!("{:#010X}", frame.id),
            pf_hex: format!("{:#04X}", (frame.id >> 16) & 0xFF),
            payload_hex: hex_string(&frame.data),
            decoded_json: decoded.cloned(),
        }
    }
}

fn hex_string(data: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{byte:02X}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(ts: Instant) -> BusFrame {
        BusFrame {
            id: 0x1811_B4FA,
            data: vec![0x1D, 0x6C, 0xFB, 0x4C, 0xFC, 0x76, 0x01, 0x9F],
            ts,
        }
    }

    #[test]
    fn record_fields_are_hex_formatted() {
        let clock = CaptureClock::start();
        let ts = clock.started_mono + Duration::from_millis(250);
        let record = clock.record(Direction::Rx, &frame(ts), None);
        assert_eq!(record.can_id_hex, "0x1811B4FA");
        assert_eq!(record.pf_hex, "0x11");
        assert_eq!(record.payload_hex, "1D6CFB4CFC76019F");
        assert_eq!(record.ts_monotonic_ns, 250_000_000);
        assert_eq!(record.direction.as_str(), "rx");
        assert!(record.decoded_json.is_none());
    }

    #[test]
    fn decoded_record_is_carried() {
        let clock = CaptureClock::start();
        let raw = frame(clock.started_mono);
        let decoded = pcslink::protocol::decode(0x11, &raw.data).unwrap();
        let record = clock.record(Direction::Rx, &raw, Some(&decoded));
        assert!(matches!(record.decoded_json, Some(Decoded::DcElectrical(_))));
    }
}
