// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CSV and JSONL sinks over any `io::Write`.
//!
//! Column order is fixed: `ts_iso, ts_monotonic_ns, direction,
//! can_id_hex, pf_hex, payload_hex, decoded_json`. The JSONL sink emits
//! one object per frame with `decoded_json` inlined as a nested object.

use crate::format::RecordedFrame;
use crate::RecordError;
use serde::Serialize;
use std::io::{BufWriter, Write};

/// CSV header, in the interchange column order.
pub const CSV_HEADER: &str =
    "ts_iso,ts_monotonic_ns,direction,can_id_hex,pf_hex,payload_hex,decoded_json";

/// CSV frame sink. The header row is written on construction.
pub struct CsvWriter<W: Write> {
    out: BufWriter<W>,
    rows: u64,
}

impl<W: Write> CsvWriter<W> {
    pub fn new(sink: W) -> Result<Self, RecordError> {
        let mut out = BufWriter::new(sink);
        writeln!(out, "{CSV_HEADER}")?;
        Ok(Self { out, rows: 0 })
    }

    pub fn write(&mut self, frame: &RecordedFrame) -> Result<(), RecordError> {
        let decoded = match &frame.decoded_json {
            Some(decoded) => serde_json::to_string(decoded)?,
            None => String::new(),
        };
        writeln!(
            self.out,
            "{},{},{},{},{},{},{}",
            frame.ts_iso.to_rfc3339(),
            frame.ts_monotonic_ns,
            frame.direction.as_str(),
            frame.can_id_hex,
            frame.pf_hex,
            frame.payload_hex,
            csv_escape(&decoded),
        )?;
        self.rows += 1;
        Ok(())
    }

    /// Flush and hand back the sink.
    pub fn finish(mut self) -> Result<W, RecordError> {
        self.out.flush()?;
        tracing::info!(rows = self.rows, "CSV capture finished");
        self.out
            .into_inner()
            .map_err(|err| RecordError::Io(err.into_error()))
    }
}

/// Quote a CSV field if it holds a delimiter, quote or newline.
fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        let mut quoted = String::with_capacity(field.len() + 2);
        quoted.push('"');
        for ch in field.chars() {
            if ch == '"' {
                quoted.push('"');
            }
            quoted.push(ch);
        }
        quoted.push('"');
        quoted
    } else {
        field.to_owned()
    }
}

/// JSONL frame sink: one object per line.
pub struct JsonlWriter<W: Write> {
    out: BufWriter<W>,
    rows: u64,
}

#[derive(Serialize)]
struct JsonlRow<'a> {
    ts_iso: &'a chrono::DateTime<chrono::Utc>,
    ts_monotonic_ns: u64,
    direction: crate::Direction,
    can_id_hex: &'a str,
    pf_hex: &'a str,
    payload_hex: &'a str,
    decoded_json: &'a Option<pcslink::Decoded>,
}

impl<W: Write> JsonlWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            out: BufWriter::new(sink),
            rows: 0,
        }
    }

    pub fn write(&mut self, frame: &RecordedFrame) -> Result<(), RecordError> {
        let row = JsonlRow {
            ts_iso: &frame.ts_iso,
            ts_monotonic_ns: frame.ts_monotonic_ns,
            direction: frame.direction,
            can_id_hex: &frame.can_id_hex,
            pf_hex: &frame.pf_hex,
            payload_hex: &frame.payload_hex,
            decoded_json: &frame.decoded_json,
        };
        serde_json::to_writer(&mut self.out, &row)?;
        self.out.write_all(b"\n")?;
        self.rows += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W, RecordError> {
        self.out.flush()?;
        tracing::info!(rows = self.rows, "JSONL capture finished");
        self.out
            .into_inner()
            .map_err(|err| RecordError::Io(err.into_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{CaptureClock, Direction};
    use pcslink::BusFrame;
    use std::io::Write as _;
    use std::time::Instant;

    fn sample_frame() -> RecordedFrame {
        let clock = CaptureClock::start();
        let frame = BusFrame {
            id: 0x1813_B4FA,
            data: vec![0x00, 0x04, 0x80, 0x0D, 0x00, 0x00, 0x00, 0x00],
            ts: Instant::now(),
        };
        let decoded = pcslink::protocol::decode(0x13, &frame.data).unwrap();
        clock.record(Direction::Rx, &frame, Some(&decoded))
    }

    #[test]
    fn csv_column_order_is_stable() {
        let mut writer = CsvWriter::new(Vec::new()).unwrap();
        writer.write(&sample_frame()).unwrap();
        let bytes = writer.finish().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), CSV_HEADER);
        let row = lines.next().unwrap();
        let cells: Vec<&str> = row.splitn(7, ',').collect();
        assert_eq!(cells[2], "rx");
        assert_eq!(cells[3], "0x1813B4FA");
        assert_eq!(cells[4], "0x13");
        assert_eq!(cells[5], "0004800D00000000");
        // decoded_json column is quoted JSON
        assert!(cells[6].starts_with('"'));
        assert!(cells[6].contains("device_status"));
    }

    #[test]
    fn jsonl_nests_the_decoded_object() {
        let mut writer = JsonlWriter::new(Vec::new());
        writer.write(&sample_frame()).unwrap();
        let bytes = writer.finish().unwrap();
        let value: serde_json::Value = serde_json::from_slice(bytes.trim_ascii_end()).unwrap();
        assert_eq!(value["direction"], "rx");
        assert_eq!(value["pf_hex"], "0x13");
        assert_eq!(value["decoded_json"]["frame"], "device_status");
        assert_eq!(value["decoded_json"]["fields"]["fault"], 0x800D);
    }

    #[test]
    fn csv_escaping_doubles_quotes() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn file_round_trip_with_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = JsonlWriter::new(file);
        writer.write(&sample_frame()).unwrap();
        let mut file = writer.finish().unwrap();
        file.flush().unwrap();
        drop(file);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}
