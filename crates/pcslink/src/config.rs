// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol constants and session configuration - Single Source of Truth
//!
//! This module centralizes the bus-level constants of the YSTECH PCS
//! application protocol and the runtime knobs of a session.
//! **NEVER hardcode these elsewhere!**

use crate::session::SessionError;
use std::time::Duration;

// =======================================================================
// Bus addressing (J1939-derived 29-bit identifier, see protocol::id)
// =======================================================================

/// Fixed source address of the host controller.
pub const CONTROLLER_ADDR: u8 = 0xB4;

/// Factory-default source address of a PCS module.
///
/// Configurable per session via [`SessionConfig::pcs_addr`]; the peer
/// address is assumed unique on the bus.
pub const DEFAULT_PCS_ADDR: u8 = 0xFA;

/// Default J1939 priority for all frames (0 = highest, 7 = lowest).
pub const DEFAULT_PRIORITY: u8 = 6;

/// Nominal CAN bit rate of the PCS bus.
pub const DEFAULT_BITRATE: u32 = 250_000;

// =======================================================================
// PDU Format (PF) numbers
// =======================================================================

/// Set working mode: mode word + first parameter (controller -> PCS).
pub const PF_SET_MODE: u8 = 0x0B;
/// Mode parameter registers 2-3 (controller -> PCS).
pub const PF_MODE_PARAMS_A: u8 = 0x0C;
/// Mode parameter registers 4-5 (controller -> PCS).
pub const PF_MODE_PARAMS_B: u8 = 0x0D;
/// Control word: start/stop, clear-faults (controller -> PCS).
pub const PF_CONTROL: u8 = 0x0F;

/// DC voltage/current/power/temperature, 200 ms periodic (PCS -> controller).
pub const PF_DC_ELECTRICAL: u8 = 0x11;
/// Accumulated capacity and net energy (PCS -> controller).
pub const PF_CAPACITY_ENERGY: u8 = 0x12;
/// Running state, fault code, alarm code (PCS -> controller).
pub const PF_DEVICE_STATUS: u8 = 0x13;
/// Grid phase voltages U/V/W (PCS -> controller).
pub const PF_GRID_VOLTAGES: u8 = 0x14;
/// Grid phase currents and power factor (PCS -> controller).
pub const PF_GRID_CURRENTS: u8 = 0x15;
/// System P/Q/S and grid frequency (PCS -> controller).
pub const PF_SYSTEM_POWER: u8 = 0x16;
/// Periodic echo of the applied control field vector (PCS -> controller).
pub const PF_CONTROL_STATE: u8 = 0x17;

/// Controller heartbeat with battery-side mirror data (controller -> PCS).
pub const PF_HEARTBEAT: u8 = 0x1A;
/// Firmware version query/reply.
pub const PF_FIRMWARE_VERSION: u8 = 0x1E;
/// Protection parameter query/reply.
pub const PF_PROTECTION_PARAMS: u8 = 0x1F;

/// High-resolution DC voltage/current (PCS -> controller).
pub const PF_DC_PRECISE: u8 = 0x39;

// =======================================================================
// Timing
// =======================================================================

/// Heartbeat transmission cadence. The PCS latches fault 0x800D (CAN1
/// communication fault) after [`HEARTBEAT_STARVATION`] without one.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_millis(200);

/// Heartbeat silence after which the PCS latches 0x800D and shuts down.
pub const HEARTBEAT_STARVATION: Duration = Duration::from_secs(5);

/// RX silence after which the session degrades.
pub const DEFAULT_RX_TIMEOUT: Duration = Duration::from_secs(1);

/// Reply wait for request/response commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Ceiling of the adapter reconnect backoff schedule.
pub const DEFAULT_RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Snapshot per-field freshness window.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(1);

/// Receive deadline of one pump iteration.
pub const RECV_DEADLINE: Duration = Duration::from_millis(100);

/// BusOff occurrences within this window promote the session to Faulted.
pub const BUS_OFF_WINDOW: Duration = Duration::from_secs(10);
/// Number of BusOff occurrences within [`BUS_OFF_WINDOW`] that fault the session.
pub const BUS_OFF_LIMIT: usize = 3;

// =======================================================================
// Session configuration
// =======================================================================

/// Which bus backend a session opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    /// SocketCAN network interface (e.g. `can0`).
    Hardware,
    /// In-process virtual bus (simulator, tests).
    Virtual,
}

/// Runtime configuration of one PCS session.
///
/// `Default` yields the virtual backend with the factory peer address; a
/// hardware session needs at least `channel` and `interface` set.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bus channel selector passed to the adapter (interface name for
    /// SocketCAN, label for the virtual bus).
    pub channel: String,
    /// CAN bit rate. Values other than 250 000 are accepted with a WARNING;
    /// on SocketCAN the actual rate is owned by the link configuration.
    pub bitrate: u32,
    /// Backend selection.
    pub interface: InterfaceKind,
    /// Peer (PCS) source address.
    pub pcs_addr: u8,
    /// J1939 priority used for outbound frames.
    pub priority: u8,
    /// RX silence threshold for the Degraded state.
    pub rx_timeout: Duration,
    /// Reply wait for commands.
    pub command_timeout: Duration,
    /// Heartbeat cadence.
    pub heartbeat_period: Duration,
    /// Reconnect backoff ceiling.
    pub reconnect_backoff_cap: Duration,
    /// Snapshot freshness window.
    pub freshness_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel: String::new(),
            bitrate: DEFAULT_BITRATE,
            interface: InterfaceKind::Virtual,
            pcs_addr: DEFAULT_PCS_ADDR,
            priority: DEFAULT_PRIORITY,
            rx_timeout: DEFAULT_RX_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            reconnect_backoff_cap: DEFAULT_RECONNECT_BACKOFF_CAP,
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
        }
    }
}

impl SessionConfig {
    /// Validate the configuration before a session opens with it.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.priority > 7 {
            return Err(SessionError::InvalidConfig(format!(
                "priority {} out of range (0-7)",
                self.priority
            )));
        }
        if self.pcs_addr == CONTROLLER_ADDR {
            return Err(SessionError::InvalidConfig(format!(
                "pcs_addr {:#04X} collides with the controller address",
                self.pcs_addr
            )));
        }
        if self.heartbeat_period.is_zero() {
            return Err(SessionError::InvalidConfig(
                "heartbeat_period must be non-zero".into(),
            ));
        }
        if self.heartbeat_period >= HEARTBEAT_STARVATION {
            return Err(SessionError::InvalidConfig(format!(
                "heartbeat_period {:?} cannot satisfy the {:?} starvation deadline",
                self.heartbeat_period, HEARTBEAT_STARVATION
            )));
        }
        if self.rx_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(SessionError::InvalidConfig(
                "rx_timeout and command_timeout must be non-zero".into(),
            ));
        }
        if self.interface == InterfaceKind::Hardware && self.channel.is_empty() {
            return Err(SessionError::InvalidConfig(
                "hardware backend needs a channel name".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SessionConfig::default().validate().expect("default config");
    }

    #[test]
    fn rejects_controller_address_as_peer() {
        let cfg = SessionConfig {
            pcs_addr: CONTROLLER_ADDR,
            ..SessionConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_hardware_without_channel() {
        let cfg = SessionConfig {
            interface: InterfaceKind::Hardware,
            ..SessionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_heartbeat_slower_than_starvation() {
        let cfg = SessionConfig {
            heartbeat_period: Duration::from_secs(6),
            ..SessionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
