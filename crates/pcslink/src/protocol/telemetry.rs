// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic telemetry frames (PCS -> controller).
//!
//! Every frame is 8 bytes, big-endian, fixed layout. Decoders length-guard
//! before indexing; encoders exist because the simulator plays the PCS side
//! of the protocol with the same codec.
//!
//! Sign convention for DC current and power: negative is charging (energy
//! into the battery), positive is discharging. It holds in both directions.

use crate::config::{
    PF_CAPACITY_ENERGY, PF_CONTROL_STATE, PF_DC_ELECTRICAL, PF_DC_PRECISE, PF_DEVICE_STATUS,
    PF_GRID_CURRENTS, PF_GRID_VOLTAGES, PF_SYSTEM_POWER,
};
use crate::protocol::wire::{
    be_i16, be_i32, be_u16, be_u32, need, scale_i16, scale_i32, scale_u16, scale_u32,
    unscale_i16, unscale_i32, unscale_u16, unscale_u32,
};
use crate::protocol::ProtocolError;

// ============================================================================
// Running state and fault code (PF=0x13)
// ============================================================================

/// 16-bit running state reported in the periodic status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RunningState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Faulted,
    Standby,
    /// Raw value outside the documented table.
    Unknown(u16),
}

impl RunningState {
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => RunningState::Stopped,
            1 => RunningState::Starting,
            2 => RunningState::Running,
            3 => RunningState::Stopping,
            4 => RunningState::Faulted,
            5 => RunningState::Standby,
            other => RunningState::Unknown(other),
        }
    }

    #[must_use]
    pub fn raw(self) -> u16 {
        match self {
            RunningState::Stopped => 0,
            RunningState::Starting => 1,
            RunningState::Running => 2,
            RunningState::Stopping => 3,
            RunningState::Faulted => 4,
            RunningState::Standby => 5,
            RunningState::Unknown(raw) => raw,
        }
    }
}

/// 16-bit fault code from the closed device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FaultCode(pub u16);

impl FaultCode {
    pub const NONE: FaultCode = FaultCode(0x0000);
    pub const DC_OVERVOLTAGE: FaultCode = FaultCode(0x8001);
    pub const DC_UNDERVOLTAGE: FaultCode = FaultCode(0x8002);
    pub const DC_OVERCURRENT: FaultCode = FaultCode(0x8003);
    pub const AC_OVERVOLTAGE: FaultCode = FaultCode(0x8004);
    pub const AC_UNDERVOLTAGE: FaultCode = FaultCode(0x8005);
    pub const AC_OVERFREQUENCY: FaultCode = FaultCode(0x8006);
    pub const AC_UNDERFREQUENCY: FaultCode = FaultCode(0x8007);
    pub const OVERTEMPERATURE: FaultCode = FaultCode(0x8008);
    pub const DC_INSULATION: FaultCode = FaultCode(0x8009);
    pub const PHASE_LOSS: FaultCode = FaultCode(0x800A);
    pub const FAN_FAILURE: FaultCode = FaultCode(0x800B);
    pub const EMERGENCY_STOP: FaultCode = FaultCode(0x800C);
    /// Latched by the PCS after 5 s without a controller heartbeat.
    pub const CAN1_COMM_FAULT: FaultCode = FaultCode(0x800D);
    pub const CAN2_COMM_FAULT: FaultCode = FaultCode(0x800E);
    pub const INTERNAL_BUS_FAULT: FaultCode = FaultCode(0x800F);

    /// True for any non-zero code.
    #[must_use]
    pub fn is_fault(self) -> bool {
        self.0 != 0
    }

    /// Human-readable name from the device fault table.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            FaultCode::NONE => "no fault",
            FaultCode::DC_OVERVOLTAGE => "DC overvoltage",
            FaultCode::DC_UNDERVOLTAGE => "DC undervoltage",
            FaultCode::DC_OVERCURRENT => "DC overcurrent",
            FaultCode::AC_OVERVOLTAGE => "AC overvoltage",
            FaultCode::AC_UNDERVOLTAGE => "AC undervoltage",
            FaultCode::AC_OVERFREQUENCY => "AC overfrequency",
            FaultCode::AC_UNDERFREQUENCY => "AC underfrequency",
            FaultCode::OVERTEMPERATURE => "overtemperature",
            FaultCode::DC_INSULATION => "DC insulation fault",
            FaultCode::PHASE_LOSS => "grid phase loss",
            FaultCode::FAN_FAILURE => "fan failure",
            FaultCode::EMERGENCY_STOP => "emergency stop",
            FaultCode::CAN1_COMM_FAULT => "CAN1 communication fault",
            FaultCode::CAN2_COMM_FAULT => "CAN2 communication fault",
            FaultCode::INTERNAL_BUS_FAULT => "internal bus fault",
            _ => "unknown fault",
        }
    }
}

// ============================================================================
// PF=0x11 DC electrical quantities
// ============================================================================

/// DC-side electrical quantities (PF=0x11).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DcElectrical {
    /// DC bus voltage, V (raw u16 x0.1).
    pub voltage: f64,
    /// DC current, A (raw i16 x0.1, negative = charging).
    pub current: f64,
    /// DC power, kW (raw i16 x0.1, negative = charging).
    pub power: f64,
    /// Module temperature, degC (raw i16 x0.1).
    pub temperature: f64,
}

impl DcElectrical {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(PF_DC_ELECTRICAL, data, 8)?;
        Ok(Self {
            voltage: scale_u16(be_u16(data, 0), 0.1),
            current: scale_i16(be_i16(data, 2), 0.1),
            power: scale_i16(be_i16(data, 4), 0.1),
            temperature: scale_i16(be_i16(data, 6), 0.1),
        })
    }

    pub fn encode(&self) -> Result<[u8; 8], ProtocolError> {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&unscale_u16(PF_DC_ELECTRICAL, "voltage", self.voltage, 0.1)?.to_be_bytes());
        out[2..4].copy_from_slice(&unscale_i16(PF_DC_ELECTRICAL, "current", self.current, 0.1)?.to_be_bytes());
        out[4..6].copy_from_slice(&unscale_i16(PF_DC_ELECTRICAL, "power", self.power, 0.1)?.to_be_bytes());
        out[6..8].copy_from_slice(&unscale_i16(PF_DC_ELECTRICAL, "temperature", self.temperature, 0.1)?.to_be_bytes());
        Ok(out)
    }
}

// ============================================================================
// PF=0x12 capacity and energy
// ============================================================================

/// Accumulated capacity and net energy (PF=0x12).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CapacityEnergy {
    /// Accumulated capacity, Ah (raw u32 x0.001).
    pub capacity: f64,
    /// Net energy, kWh (raw i32 x0.001, negative = charged into the battery).
    pub energy: f64,
}

impl CapacityEnergy {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(PF_CAPACITY_ENERGY, data, 8)?;
        Ok(Self {
            capacity: scale_u32(be_u32(data, 0), 0.001),
            energy: scale_i32(be_i32(data, 4), 0.001),
        })
    }

    pub fn encode(&self) -> Result<[u8; 8], ProtocolError> {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&unscale_u32(PF_CAPACITY_ENERGY, "capacity", self.capacity, 0.001)?.to_be_bytes());
        out[4..8].copy_from_slice(&unscale_i32(PF_CAPACITY_ENERGY, "energy", self.energy, 0.001)?.to_be_bytes());
        Ok(out)
    }
}

// ============================================================================
// PF=0x13 running state and faults
// ============================================================================

/// Running state, fault code and alarm code (PF=0x13).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceStatus {
    pub state: RunningState,
    pub fault: FaultCode,
    /// Non-latching alarm bits (device-specific).
    pub alarm: u16,
}

impl DeviceStatus {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(PF_DEVICE_STATUS, data, 6)?;
        Ok(Self {
            state: RunningState::from_raw(be_u16(data, 0)),
            fault: FaultCode(be_u16(data, 2)),
            alarm: be_u16(data, 4),
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&self.state.raw().to_be_bytes());
        out[2..4].copy_from_slice(&self.fault.0.to_be_bytes());
        out[4..6].copy_from_slice(&self.alarm.to_be_bytes());
        out
    }
}

// ============================================================================
// PF=0x14 / 0x15 grid quantities
// ============================================================================

/// Grid phase voltages (PF=0x14).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GridVoltages {
    /// Phase U voltage, V (raw u16 x0.1).
    pub phase_u: f64,
    /// Phase V voltage, V (raw u16 x0.1).
    pub phase_v: f64,
    /// Phase W voltage, V (raw u16 x0.1).
    pub phase_w: f64,
}

impl GridVoltages {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(PF_GRID_VOLTAGES, data, 6)?;
        Ok(Self {
            phase_u: scale_u16(be_u16(data, 0), 0.1),
            phase_v: scale_u16(be_u16(data, 2), 0.1),
            phase_w: scale_u16(be_u16(data, 4), 0.1),
        })
    }

    pub fn encode(&self) -> Result<[u8; 8], ProtocolError> {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&unscale_u16(PF_GRID_VOLTAGES, "phase_u", self.phase_u, 0.1)?.to_be_bytes());
        out[2..4].copy_from_slice(&unscale_u16(PF_GRID_VOLTAGES, "phase_v", self.phase_v, 0.1)?.to_be_bytes());
        out[4..6].copy_from_slice(&unscale_u16(PF_GRID_VOLTAGES, "phase_w", self.phase_w, 0.1)?.to_be_bytes());
        Ok(out)
    }
}

/// Grid phase currents and power factor (PF=0x15).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GridCurrents {
    /// Phase U current, A (raw i16 x0.1).
    pub phase_u: f64,
    /// Phase V current, A (raw i16 x0.1).
    pub phase_v: f64,
    /// Phase W current, A (raw i16 x0.1).
    pub phase_w: f64,
    /// Power factor (raw i16 x0.001).
    pub power_factor: f64,
}

impl GridCurrents {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(PF_GRID_CURRENTS, data, 8)?;
        Ok(Self {
            phase_u: scale_i16(be_i16(data, 0), 0.1),
            phase_v: scale_i16(be_i16(data, 2), 0.1),
            phase_w: scale_i16(be_i16(data, 4), 0.1),
            power_factor: scale_i16(be_i16(data, 6), 0.001),
        })
    }

    pub fn encode(&self) -> Result<[u8; 8], ProtocolError> {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&unscale_i16(PF_GRID_CURRENTS, "phase_u", self.phase_u, 0.1)?.to_be_bytes());
        out[2..4].copy_from_slice(&unscale_i16(PF_GRID_CURRENTS, "phase_v", self.phase_v, 0.1)?.to_be_bytes());
        out[4..6].copy_from_slice(&unscale_i16(PF_GRID_CURRENTS, "phase_w", self.phase_w, 0.1)?.to_be_bytes());
        out[6..8].copy_from_slice(&unscale_i16(PF_GRID_CURRENTS, "power_factor", self.power_factor, 0.001)?.to_be_bytes());
        Ok(out)
    }
}

// ============================================================================
// PF=0x16 system power
// ============================================================================

/// System power and grid frequency (PF=0x16).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SystemPower {
    /// Active power, kW (raw i16 x0.1).
    pub active: f64,
    /// Reactive power, kvar (raw i16 x0.1).
    pub reactive: f64,
    /// Apparent power, kVA (raw u16 x0.1).
    pub apparent: f64,
    /// Grid frequency, Hz (raw u16 x0.01).
    pub frequency: f64,
}

impl SystemPower {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(PF_SYSTEM_POWER, data, 8)?;
        Ok(Self {
            active: scale_i16(be_i16(data, 0), 0.1),
            reactive: scale_i16(be_i16(data, 2), 0.1),
            apparent: scale_u16(be_u16(data, 4), 0.1),
            frequency: scale_u16(be_u16(data, 6), 0.01),
        })
    }

    pub fn encode(&self) -> Result<[u8; 8], ProtocolError> {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&unscale_i16(PF_SYSTEM_POWER, "active", self.active, 0.1)?.to_be_bytes());
        out[2..4].copy_from_slice(&unscale_i16(PF_SYSTEM_POWER, "reactive", self.reactive, 0.1)?.to_be_bytes());
        out[4..6].copy_from_slice(&unscale_u16(PF_SYSTEM_POWER, "apparent", self.apparent, 0.1)?.to_be_bytes());
        out[6..8].copy_from_slice(&unscale_u16(PF_SYSTEM_POWER, "frequency", self.frequency, 0.01)?.to_be_bytes());
        Ok(out)
    }
}

// ============================================================================
// PF=0x17 control vector echo
// ============================================================================

/// Periodic echo of the control field vector last applied by the PCS
/// (PF=0x17). The raw bytes are kept opaque: only bit 0/1 of byte 0 are
/// documented, the rest must be carried over verbatim into control writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ControlVector(pub [u8; 8]);

impl ControlVector {
    /// Start/stop bit (byte 0, bit 0).
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(PF_CONTROL_STATE, data, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[0..8]);
        Ok(Self(raw))
    }

    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        self.0
    }
}

// ============================================================================
// PF=0x39 high-resolution DC quantities
// ============================================================================

/// High-resolution DC voltage and current (PF=0x39).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DcPrecise {
    /// DC bus voltage, V (raw u32 x0.001).
    pub voltage: f64,
    /// DC current, A (raw i32 x0.001, negative = charging).
    pub current: f64,
}

impl DcPrecise {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(PF_DC_PRECISE, data, 8)?;
        Ok(Self {
            voltage: scale_u32(be_u32(data, 0), 0.001),
            current: scale_i32(be_i32(data, 4), 0.001),
        })
    }

    pub fn encode(&self) -> Result<[u8; 8], ProtocolError> {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&unscale_u32(PF_DC_PRECISE, "voltage", self.voltage, 0.001)?.to_be_bytes());
        out[4..8].copy_from_slice(&unscale_i32(PF_DC_PRECISE, "current", self.current, 0.001)?.to_be_bytes());
        Ok(out)
    }
}
