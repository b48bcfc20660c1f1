// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bus adapters: abstract send/receive of CAN frames with lifecycle and
//! filters.
//!
//! Two backends implement [`BusAdapter`]:
//!
//! - `socketcan` - a SocketCAN network interface (Linux)
//! - `vbus` - an in-process virtual bus for the simulator and tests
//!
//! Adapters retry a transient send error once before surfacing it; the
//! reconnect schedule is 100 ms doubling up to the configured cap, with
//! unbounded attempts until close.

use crate::config::{InterfaceKind, DEFAULT_BITRATE};
use std::io;
use std::time::{Duration, Instant};

/// SocketCAN backend (Linux).
#[cfg(target_os = "linux")]
pub mod socketcan;

/// SocketCAN stub for non-Linux hosts -- the virtual backend still works.
#[cfg(not(target_os = "linux"))]
pub mod socketcan {
    use super::{BusAdapter, BusConfig, BusError};

    pub struct SocketCanAdapter;

    impl SocketCanAdapter {
        pub fn open(_config: &BusConfig) -> Result<Box<dyn BusAdapter>, BusError> {
            Err(BusError::Transient(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "SocketCAN is only available on Linux",
            )))
        }
    }

    /// No CAN network devices off Linux.
    #[must_use]
    pub fn list_interfaces() -> Vec<String> {
        Vec::new()
    }
}

/// In-process virtual bus.
pub mod vbus;

// ============================================================================
// Errors
// ============================================================================

/// Bus-level send/receive failures.
#[derive(Debug)]
pub enum BusError {
    /// Controller went bus-off (error-passive beyond recovery).
    BusOff,
    /// Send deadline expired at the driver.
    Timeout,
    /// Adapter was closed.
    Closed,
    /// Transient I/O failure; retried once inside the adapter.
    Transient(io::Error),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::BusOff => write!(f, "bus off"),
            BusError::Timeout => write!(f, "send timeout"),
            BusError::Closed => write!(f, "adapter closed"),
            BusError::Transient(err) => write!(f, "transient bus error: {err}"),
        }
    }
}

impl std::error::Error for BusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BusError::Transient(err) => Some(err),
            _ => None,
        }
    }
}

impl BusError {
    /// Retryable inside the adapter (exactly once).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Transient(_))
    }
}

// ============================================================================
// Frames and configuration
// ============================================================================

/// One frame off the bus, stamped with a monotonic receive time.
#[derive(Debug, Clone)]
pub struct BusFrame {
    /// 29-bit identifier (extended-frame flag stripped).
    pub id: u32,
    /// Payload, at most 8 bytes.
    pub data: Vec<u8>,
    /// Monotonic receive timestamp.
    pub ts: Instant,
}

/// Adapter open parameters.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Channel selector: SocketCAN interface name or virtual bus name.
    pub channel: String,
    /// Requested bit rate; on SocketCAN the link configuration owns the
    /// actual rate.
    pub bitrate: u32,
    /// Backend selection.
    pub interface: InterfaceKind,
    /// Initial (PF, PS) acceptance filters; empty accepts everything.
    pub filters: Vec<(u8, u8)>,
    /// Reconnect backoff ceiling.
    pub reconnect_backoff_cap: Duration,
}

/// First reconnect backoff step; doubles per attempt up to the cap.
pub const RECONNECT_BACKOFF_START: Duration = Duration::from_millis(100);

// ============================================================================
// Adapter contract
// ============================================================================

/// Abstract CAN bus endpoint.
///
/// All methods take `&self`; adapters are shared across the session's
/// pump, heartbeat and caller threads.
pub trait BusAdapter: Send + Sync {
    /// Send one frame. Transient errors are retried once internally.
    fn send(&self, id: u32, payload: &[u8]) -> Result<(), BusError>;

    /// Receive one frame, waiting at most `deadline`. `Ok(None)` on
    /// deadline expiry; `Err(Closed)` once the adapter is closed.
    fn recv(&self, deadline: Duration) -> Result<Option<BusFrame>, BusError>;

    /// Re-establish the bus connection, backing off 100 ms doubling up to
    /// the configured cap, until success or close.
    fn reconnect(&self) -> Result<(), BusError>;

    /// Install (PF, PS) acceptance filters, replacing any previous set.
    fn install_filters(&self, filters: &[(u8, u8)]) -> Result<(), BusError>;

    /// Close the adapter: idempotent, unblocks any pending `recv`.
    fn close(&self);
}

/// Open a bus adapter for the configured backend.
pub fn open(config: &BusConfig) -> Result<Box<dyn BusAdapter>, BusError> {
    if config.bitrate != DEFAULT_BITRATE {
        log::warn!(
            "[BUS] non-standard bitrate {} requested (PCS bus runs at {})",
            config.bitrate,
            DEFAULT_BITRATE
        );
    }
    match config.interface {
        InterfaceKind::Hardware => socketcan::SocketCanAdapter::open(config),
        InterfaceKind::Virtual => vbus::VirtualBus::named(&config.channel).open(config),
    }
}

/// Enumerate candidate channels for a backend. Never fails; unknown
/// environments yield an empty list.
#[must_use]
pub fn list_interfaces(kind: InterfaceKind) -> Vec<String> {
    match kind {
        InterfaceKind::Hardware => socketcan::list_interfaces(),
        InterfaceKind::Virtual => vbus::list_buses(),
    }
}

/// Run `op`, retrying exactly once if the first failure is transient.
pub(crate) fn retry_transient<F>(what: &str, op: F) -> Result<(), BusError>
where
    F: Fn() -> Result<(), BusError>,
{
    match op() {
        Err(err) if err.is_transient() => {
            log::debug!("[BUS] transient {what} failure, retrying once: {err}");
            op()
        }
        other => other,
    }
}

/// True if a frame passes a (PF, PS) filter set; empty sets pass all.
#[must_use]
pub(crate) fn passes_filters(filters: &[(u8, u8)], pf: u8, ps: u8) -> bool {
    filters.is_empty() || filters.iter().any(|&(f_pf, f_ps)| f_pf == pf && f_ps == ps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_match_semantics() {
        assert!(passes_filters(&[], 0x11, 0xB4));
        assert!(passes_filters(&[(0x11, 0xB4)], 0x11, 0xB4));
        assert!(!passes_filters(&[(0x11, 0xB4)], 0x12, 0xB4));
        assert!(!passes_filters(&[(0x11, 0xB4)], 0x11, 0xFA));
    }

    #[test]
    fn retry_transient_retries_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = AtomicUsize::new(0);
        let result = retry_transient("send", || {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(BusError::Transient(io::Error::other("flap")))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 2);

        let calls = AtomicUsize::new(0);
        let result = retry_transient("send", || {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(BusError::BusOff)
        });
        assert!(matches!(result, Err(BusError::BusOff)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
