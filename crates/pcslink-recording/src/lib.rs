// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Raw frame recording for pcslink sessions.
//!
//! Captures bus frames into the interchange formats front-ends and
//! offline tooling consume:
//!
//! - **CSV** - columns `ts_iso, ts_monotonic_ns, direction, can_id_hex,
//!   pf_hex, payload_hex, decoded_json`, in that order
//! - **JSONL** - one object per frame, `decoded_json` inlined as a
//!   nested object
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pcslink_recording::{CaptureClock, CsvWriter, Direction};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = CaptureClock::start();
//! let mut csv = CsvWriter::new(std::fs::File::create("capture.csv")?)?;
//! // inside a pcslink subscriber or bus tap:
//! # let frame = pcslink::BusFrame { id: 0, data: vec![], ts: std::time::Instant::now() };
//! csv.write(&clock.record(Direction::Rx, &frame, None))?;
//! csv.finish()?;
//! # Ok(())
//! # }
//! ```

pub mod format;
pub mod writer;

pub use format::{CaptureClock, Direction, RecordedFrame};
pub use writer::{CsvWriter, JsonlWriter, CSV_HEADER};

use thiserror::Error;

/// Recording sink failures.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}
