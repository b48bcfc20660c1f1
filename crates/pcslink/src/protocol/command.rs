// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command frames (controller -> PCS) and their replies.
//!
//! Set-mode payloads: PF=0x0B carries the 16-bit mode word plus the first
//! 32-bit parameter; parameters 2-3 ride in PF=0x0C, 4-5 in PF=0x0D. The
//! auxiliary register frames are sent before the 0x0B commit frame. All
//! values big-endian, signed parameters in 32-bit two's complement.

use crate::config::{PF_HEARTBEAT, PF_MODE_PARAMS_A, PF_MODE_PARAMS_B, PF_SET_MODE};
use crate::protocol::telemetry::ControlVector;
use crate::protocol::wire::{be_i16, be_u16, be_u32, need, scale_i16, scale_u16, unscale_i16, unscale_u16};
use crate::protocol::ProtocolError;

// ============================================================================
// Working modes
// ============================================================================

/// Working mode of the PCS with its setpoint parameters.
///
/// Sign convention on the DC side: negative current/power is charging
/// (energy into the battery), positive is discharging.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum WorkingMode {
    /// 0x02 - DC constant voltage. Volts.
    DcConstantVoltage { voltage: f64 },
    /// 0x03 - DC constant voltage with ramped approach. Volts, V/s.
    DcConstantVoltageRamped { voltage: f64, ramp_rate: f64 },
    /// 0x08 - DC constant voltage with charge/discharge current limits.
    /// Volts, amps (both limits unsigned).
    DcConstantVoltageLimitedCurrent {
        voltage: f64,
        max_charge_current: f64,
        max_discharge_current: f64,
    },
    /// 0x09 - DC constant voltage with charge/discharge power limits.
    /// Volts, watts (both limits unsigned).
    DcConstantVoltageLimitedPower {
        voltage: f64,
        max_charge_power: f64,
        max_discharge_power: f64,
    },
    /// 0x21 - DC constant current. Amps, negative = charging.
    DcConstantCurrent { current: f64 },
    /// 0x22 - DC constant power. Watts, negative = charging.
    DcConstantPower { power: f64 },
    /// 0x23 - DC constant resistance. Ohms.
    DcConstantResistance { resistance: f64 },
    /// 0x24 - DC constant current inside a voltage window. Amps, volts.
    DcConstantCurrentLimitedVoltage {
        current: f64,
        min_voltage: f64,
        max_voltage: f64,
    },
    /// 0x29 - constant current then constant voltage, terminated at the
    /// end-of-charge current. Volts, amps, amps.
    DcCcCv {
        voltage: f64,
        current: f64,
        end_current: f64,
    },
    /// 0x2A - constant power then constant voltage. Volts, watts, amps.
    DcCpCv {
        voltage: f64,
        power: f64,
        end_current: f64,
    },
    /// 0x2B - battery terminal emulation. Volts, ohms.
    BatterySimulation {
        open_circuit_voltage: f64,
        internal_resistance: f64,
    },
    /// 0x40 - AC constant active/reactive power. Watts, vars (signed).
    AcConstantPower {
        active_power: f64,
        reactive_power: f64,
    },
    /// 0x41 - off-grid inverter with fixed voltage/frequency. Volts, hertz.
    IndependentInverter { voltage: f64, frequency: f64 },
    /// 0x42 - AC constant current. Amps active/reactive (signed).
    AcConstantCurrent {
        active_current: f64,
        reactive_current: f64,
    },
    /// 0x44 - reactive power support only. Vars (signed).
    AcReactivePower { reactive_power: f64 },
    /// 0x91 - power stage gated off, control alive.
    Idle,
    /// 0x92 - internal self check.
    SelfCheck,
    /// 0x93 - maintenance mode.
    Maintenance,
    /// 0x94 - standby.
    Standby,
    /// Mode word outside the documented table, carried as raw parameter
    /// registers. Accepted on decode, refused on encode.
    Unknown { code: u16, params: Vec<u32> },
}

/// Scale/signedness of one 32-bit setpoint parameter.
#[derive(Debug, Clone, Copy)]
struct ParamDef {
    name: &'static str,
    scale: f64,
    signed: bool,
}

const MV: f64 = 0.001; // volts per raw count
const MA: f64 = 0.001; // amps per raw count
const MW: f64 = 0.001; // watts / vars per raw count
const MOHM: f64 = 0.001; // ohms per raw count

const fn p(name: &'static str, scale: f64, signed: bool) -> ParamDef {
    ParamDef { name, scale, signed }
}

impl WorkingMode {
    /// Mode word on the wire. Fails for [`WorkingMode::Unknown`].
    pub fn code(&self) -> Result<u16, ProtocolError> {
        Ok(match self {
            WorkingMode::DcConstantVoltage { .. } => 0x02,
            WorkingMode::DcConstantVoltageRamped { .. } => 0x03,
            WorkingMode::DcConstantVoltageLimitedCurrent { .. } => 0x08,
            WorkingMode::DcConstantVoltageLimitedPower { .. } => 0x09,
            WorkingMode::DcConstantCurrent { .. } => 0x21,
            WorkingMode::DcConstantPower { .. } => 0x22,
            WorkingMode::DcConstantResistance { .. } => 0x23,
            WorkingMode::DcConstantCurrentLimitedVoltage { .. } => 0x24,
            WorkingMode::DcCcCv { .. } => 0x29,
            WorkingMode::DcCpCv { .. } => 0x2A,
            WorkingMode::BatterySimulation { .. } => 0x2B,
            WorkingMode::AcConstantPower { .. } => 0x40,
            WorkingMode::IndependentInverter { .. } => 0x41,
            WorkingMode::AcConstantCurrent { .. } => 0x42,
            WorkingMode::AcReactivePower { .. } => 0x44,
            WorkingMode::Idle => 0x91,
            WorkingMode::SelfCheck => 0x92,
            WorkingMode::Maintenance => 0x93,
            WorkingMode::Standby => 0x94,
            WorkingMode::Unknown { code, .. } => {
                return Err(ProtocolError::UnknownMode(*code));
            }
        })
    }

    /// Parameter layout and engineering values, in wire order.
    fn params(&self) -> Vec<(ParamDef, f64)> {
        match *self {
            WorkingMode::DcConstantVoltage { voltage } => {
                vec![(p("voltage", MV, false), voltage)]
            }
            WorkingMode::DcConstantVoltageRamped { voltage, ramp_rate } => vec![
                (p("voltage", MV, false), voltage),
                (p("ramp_rate", MV, false), ramp_rate),
            ],
            WorkingMode::DcConstantVoltageLimitedCurrent {
                voltage,
                max_charge_current,
                max_discharge_current,
            } => vec![
                (p("voltage", MV, false), voltage),
                (p("max_charge_current", MA, false), max_charge_current),
                (p("max_discharge_current", MA, false), max_discharge_current),
            ],
            WorkingMode::DcConstantVoltageLimitedPower {
                voltage,
                max_charge_power,
                max_discharge_power,
            } => vec![
                (p("voltage", MV, false), voltage),
                (p("max_charge_power", MW, false), max_charge_power),
                (p("max_discharge_power", MW, false), max_discharge_power),
            ],
            WorkingMode::DcConstantCurrent { current } => {
                vec![(p("current", MA, true), current)]
            }
            WorkingMode::DcConstantPower { power } => vec![(p("power", MW, true), power)],
            WorkingMode::DcConstantResistance { resistance } => {
                vec![(p("resistance", MOHM, false), resistance)]
            }
            WorkingMode::DcConstantCurrentLimitedVoltage {
                current,
                min_voltage,
                max_voltage,
            } => vec![
                (p("current", MA, true), current),
                (p("min_voltage", MV, false), min_voltage),
                (p("max_voltage", MV, false), max_voltage),
            ],
            WorkingMode::DcCcCv {
                voltage,
                current,
                end_current,
            } => vec![
                (p("voltage", MV, false), voltage),
                (p("current", MA, true), current),
                (p("end_current", MA, false), end_current),
            ],
            WorkingMode::DcCpCv {
                voltage,
                power,
                end_current,
            } => vec![
                (p("voltage", MV, false), voltage),
                (p("power", MW, true), power),
                (p("end_current", MA, false), end_current),
            ],
            WorkingMode::BatterySimulation {
                open_circuit_voltage,
                internal_resistance,
            } => vec![
                (p("open_circuit_voltage", MV, false), open_circuit_voltage),
                (p("internal_resistance", MOHM, false), internal_resistance),
            ],
            WorkingMode::AcConstantPower {
                active_power,
                reactive_power,
            } => vec![
                (p("active_power", MW, true), active_power),
                (p("reactive_power", MW, true), reactive_power),
            ],
            WorkingMode::IndependentInverter { voltage, frequency } => vec![
                (p("voltage", 0.1, false), voltage),
                (p("frequency", 0.01, false), frequency),
            ],
            WorkingMode::AcConstantCurrent {
                active_current,
                reactive_current,
            } => vec![
                (p("active_current", MA, true), active_current),
                (p("reactive_current", MA, true), reactive_current),
            ],
            WorkingMode::AcReactivePower { reactive_power } => {
                vec![(p("reactive_power", MW, true), reactive_power)]
            }
            WorkingMode::Idle
            | WorkingMode::SelfCheck
            | WorkingMode::Maintenance
            | WorkingMode::Standby => Vec::new(),
            WorkingMode::Unknown { .. } => Vec::new(),
        }
    }

    /// Rebuild a mode from its wire code and decoded parameter registers.
    /// Unknown codes keep the raw registers.
    #[must_use]
    fn from_wire(code: u16, raw: &[u32]) -> Self {
        let reg = |i: usize| raw.get(i).copied().unwrap_or(0);
        let u = |i: usize, scale: f64| f64::from(reg(i)) * scale;
        let s = |i: usize, scale: f64| f64::from(reg(i) as i32) * scale;
        match code {
            0x02 => WorkingMode::DcConstantVoltage { voltage: u(0, MV) },
            0x03 => WorkingMode::DcConstantVoltageRamped {
                voltage: u(0, MV),
                ramp_rate: u(1, MV),
            },
            0x08 => WorkingMode::DcConstantVoltageLimitedCurrent {
                voltage: u(0, MV),
                max_charge_current: u(1, MA),
                max_discharge_current: u(2, MA),
            },
            0x09 => WorkingMode::DcConstantVoltageLimitedPower {
                voltage: u(0, MV),
                max_charge_power: u(1, MW),
                max_discharge_power: u(2, MW),
            },
            0x21 => WorkingMode::DcConstantCurrent { current: s(0, MA) },
            0x22 => WorkingMode::DcConstantPower { power: s(0, MW) },
            0x23 => WorkingMode::DcConstantResistance {
                resistance: u(0, MOHM),
            },
            0x24 => WorkingMode::DcConstantCurrentLimitedVoltage {
                current: s(0, MA),
                min_voltage: u(1, MV),
                max_voltage: u(2, MV),
            },
            0x29 => WorkingMode::DcCcCv {
                voltage: u(0, MV),
                current: s(1, MA),
                end_current: u(2, MA),
            },
            0x2A => WorkingMode::DcCpCv {
                voltage: u(0, MV),
                power: s(1, MW),
                end_current: u(2, MA),
            },
            0x2B => WorkingMode::BatterySimulation {
                open_circuit_voltage: u(0, MV),
                internal_resistance: u(1, MOHM),
            },
            0x40 => WorkingMode::AcConstantPower {
                active_power: s(0, MW),
                reactive_power: s(1, MW),
            },
            0x41 => WorkingMode::IndependentInverter {
                voltage: u(0, 0.1),
                frequency: u(1, 0.01),
            },
            0x42 => WorkingMode::AcConstantCurrent {
                active_current: s(0, MA),
                reactive_current: s(1, MA),
            },
            0x44 => WorkingMode::AcReactivePower {
                reactive_power: s(0, MW),
            },
            0x91 => WorkingMode::Idle,
            0x92 => WorkingMode::SelfCheck,
            0x93 => WorkingMode::Maintenance,
            0x94 => WorkingMode::Standby,
            code => WorkingMode::Unknown {
                code,
                params: raw.to_vec(),
            },
        }
    }
}

/// One encoded command frame: PF plus 8-byte payload.
pub type CommandFrame = (u8, [u8; 8]);

fn encode_param(pf: u8, def: ParamDef, value: f64) -> Result<u32, ProtocolError> {
    let raw = (value / def.scale).round();
    let out_of_range = ProtocolError::OutOfRange {
        pf,
        field: def.name,
    };
    if !raw.is_finite() {
        return Err(out_of_range);
    }
    if def.signed {
        if raw < f64::from(i32::MIN) || raw > f64::from(i32::MAX) {
            return Err(out_of_range);
        }
        Ok((raw as i32) as u32)
    } else {
        if raw < 0.0 || raw > f64::from(u32::MAX) {
            return Err(out_of_range);
        }
        Ok(raw as u32)
    }
}

/// Encode a set-mode request as the frames to send, in send order: the
/// auxiliary parameter registers (0x0C, then 0x0D if needed) followed by
/// the 0x0B commit frame. At most five parameters per mode.
pub fn encode_set_mode(mode: &WorkingMode) -> Result<Vec<CommandFrame>, ProtocolError> {
    let code = mode.code()?;
    let params = mode.params();
    debug_assert!(params.len() <= 5);

    let mut raw = Vec::with_capacity(params.len());
    for (def, value) in &params {
        // Aux registers share the commit frame's PF in error reports so the
        // caller sees the command it issued, not the transport split.
        raw.push(encode_param(PF_SET_MODE, *def, *value)?);
    }

    let mut frames = Vec::with_capacity(3);
    if raw.len() > 1 {
        let mut payload = [0u8; 8];
        payload[0..4].copy_from_slice(&raw[1].to_be_bytes());
        if let Some(third) = raw.get(2) {
            payload[4..8].copy_from_slice(&third.to_be_bytes());
        }
        frames.push((PF_MODE_PARAMS_A, payload));
    }
    if raw.len() > 3 {
        let mut payload = [0u8; 8];
        payload[0..4].copy_from_slice(&raw[3].to_be_bytes());
        if let Some(fifth) = raw.get(4) {
            payload[4..8].copy_from_slice(&fifth.to_be_bytes());
        }
        frames.push((PF_MODE_PARAMS_B, payload));
    }

    let mut commit = [0u8; 8];
    commit[0..2].copy_from_slice(&code.to_be_bytes());
    if let Some(first) = raw.first() {
        commit[2..6].copy_from_slice(&first.to_be_bytes());
    }
    frames.push((PF_SET_MODE, commit));
    Ok(frames)
}

/// Decode a set-mode request from the commit frame plus whatever auxiliary
/// register frames preceded it. Unknown mode words are carried raw.
pub fn decode_set_mode(
    commit: &[u8],
    aux_a: Option<&[u8]>,
    aux_b: Option<&[u8]>,
) -> Result<WorkingMode, ProtocolError> {
    need(PF_SET_MODE, commit, 6)?;
    let code = be_u16(commit, 0);

    let mut raw = vec![be_u32(commit, 2)];
    if let Some(data) = aux_a {
        need(PF_MODE_PARAMS_A, data, 8)?;
        raw.push(be_u32(data, 0));
        raw.push(be_u32(data, 4));
    }
    if let Some(data) = aux_b {
        need(PF_MODE_PARAMS_B, data, 8)?;
        raw.push(be_u32(data, 0));
        raw.push(be_u32(data, 4));
    }
    Ok(WorkingMode::from_wire(code, &raw))
}

// ============================================================================
// Control word (PF=0x0F)
// ============================================================================

/// One mutation of the PF=0x0F control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Set the start bit (byte 0, bit 0).
    Start,
    /// Clear the start bit.
    Stop,
    /// Pulse the clear-faults bit (byte 0, bit 1; the PCS self-clears it).
    ClearFaults,
}

/// Encode a control write, overlaying exactly one mutation onto the last
/// control vector observed from the PCS. All undocumented bits carry over
/// verbatim; without an observed vector the write cannot be built.
pub fn encode_control(
    previous: Option<&ControlVector>,
    action: ControlAction,
) -> Result<[u8; 8], ProtocolError> {
    let previous = previous.ok_or(ProtocolError::MissingContextForControl)?;
    let mut out = previous.0;
    match action {
        ControlAction::Start => out[0] |= 0x01,
        ControlAction::Stop => out[0] &= !0x01,
        ControlAction::ClearFaults => out[0] |= 0x02,
    }
    Ok(out)
}

// ============================================================================
// Heartbeat (PF=0x1A)
// ============================================================================

/// Battery-side mirror values carried in the controller heartbeat. The PCS
/// treats the heartbeat purely as a liveness signal; these values are
/// informational.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ExternalData {
    /// Battery terminal voltage, V (raw u16 x0.1).
    pub battery_voltage: f64,
    /// Battery current, A (raw i16 x0.1, negative = charging).
    pub battery_current: f64,
    /// State of charge, % (raw u16 x0.1).
    pub soc: f64,
}

/// Encode the heartbeat payload. No operator data yields the documented
/// zero-fill pattern.
pub fn encode_heartbeat(data: Option<&ExternalData>) -> Result<[u8; 8], ProtocolError> {
    let Some(data) = data else {
        return Ok([0u8; 8]);
    };
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&unscale_u16(PF_HEARTBEAT, "battery_voltage", data.battery_voltage, 0.1)?.to_be_bytes());
    out[2..4].copy_from_slice(&unscale_i16(PF_HEARTBEAT, "battery_current", data.battery_current, 0.1)?.to_be_bytes());
    out[4..6].copy_from_slice(&unscale_u16(PF_HEARTBEAT, "soc", data.soc, 0.1)?.to_be_bytes());
    Ok(out)
}

/// Decode a heartbeat payload; the zero-fill pattern decodes as `None`.
pub fn decode_heartbeat(data: &[u8]) -> Result<Option<ExternalData>, ProtocolError> {
    need(PF_HEARTBEAT, data, 6)?;
    if data.iter().all(|&b| b == 0) {
        return Ok(None);
    }
    Ok(Some(ExternalData {
        battery_voltage: scale_u16(be_u16(data, 0), 0.1),
        battery_current: scale_i16(be_i16(data, 2), 0.1),
        soc: scale_u16(be_u16(data, 4), 0.1),
    }))
}

// ============================================================================
// Set-command replies
// ============================================================================

/// Acknowledgement check for set-command replies (same PF, PCS ->
/// controller). Two encodings are in the field: `data[0] == 0x01`, and
/// `data[1] == 0x01` with a leading status byte. Empty payloads are
/// not-acknowledged, never an index fault.
#[must_use]
pub fn decode_set_reply(data: &[u8]) -> bool {
    if data.first() == Some(&0x01) {
        return true;
    }
    data.len() >= 2 && data[1] == 0x01
}

// ============================================================================
// Queries (PF=0x1E firmware version, PF=0x1F protection parameters)
// ============================================================================

/// Zero request payload shared by the query commands.
#[must_use]
pub fn encode_query() -> [u8; 8] {
    [0u8; 8]
}

/// Firmware/hardware/protocol versions (PF=0x1E reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FirmwareVersion {
    /// Software version, (major, minor).
    pub software: (u8, u8),
    /// Hardware revision, (major, minor).
    pub hardware: (u8, u8),
    /// Application protocol version.
    pub protocol: u16,
}

impl FirmwareVersion {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(crate::config::PF_FIRMWARE_VERSION, data, 6)?;
        Ok(Self {
            software: (data[0], data[1]),
            hardware: (data[2], data[3]),
            protocol: be_u16(data, 4),
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.software.0;
        out[1] = self.software.1;
        out[2] = self.hardware.0;
        out[3] = self.hardware.1;
        out[4..6].copy_from_slice(&self.protocol.to_be_bytes());
        out
    }
}

/// Device protection limits (PF=0x1F reply). These are reported by the
/// PCS and surfaced to the integrator; the codec never enforces them.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ProtectionParams {
    /// Maximum DC voltage, V (raw u16 x0.1).
    pub max_dc_voltage: f64,
    /// Minimum DC voltage, V (raw u16 x0.1).
    pub min_dc_voltage: f64,
    /// Maximum DC current, A (raw u16 x0.1).
    pub max_dc_current: f64,
    /// Maximum power, kW (raw u16 x0.1).
    pub max_power: f64,
}

impl ProtectionParams {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(crate::config::PF_PROTECTION_PARAMS, data, 8)?;
        Ok(Self {
            max_dc_voltage: scale_u16(be_u16(data, 0), 0.1),
            min_dc_voltage: scale_u16(be_u16(data, 2), 0.1),
            max_dc_current: scale_u16(be_u16(data, 4), 0.1),
            max_power: scale_u16(be_u16(data, 6), 0.1),
        })
    }

    pub fn encode(&self) -> Result<[u8; 8], ProtocolError> {
        let pf = crate::config::PF_PROTECTION_PARAMS;
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&unscale_u16(pf, "max_dc_voltage", self.max_dc_voltage, 0.1)?.to_be_bytes());
        out[2..4].copy_from_slice(&unscale_u16(pf, "min_dc_voltage", self.min_dc_voltage, 0.1)?.to_be_bytes());
        out[4..6].copy_from_slice(&unscale_u16(pf, "max_dc_current", self.max_dc_current, 0.1)?.to_be_bytes());
        out[6..8].copy_from_slice(&unscale_u16(pf, "max_power", self.max_power, 0.1)?.to_be_bytes());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_constant_voltage_literal() {
        // 400.000 V -> mode word 0x0002, raw 400000 = 0x00061A80
        let frames = encode_set_mode(&WorkingMode::DcConstantVoltage { voltage: 400.0 }).unwrap();
        assert_eq!(frames.len(), 1);
        let (pf, payload) = frames[0];
        assert_eq!(pf, PF_SET_MODE);
        assert_eq!(
            payload,
            [0x00, 0x02, 0x00, 0x06, 0x1A, 0x80, 0x00, 0x00]
        );

        let back = decode_set_mode(&payload, None, None).unwrap();
        assert_eq!(back, WorkingMode::DcConstantVoltage { voltage: 400.0 });
    }

    #[test]
    fn constant_current_sign_convention() {
        // -50.000 A (charging) survives the round trip exactly
        let frames = encode_set_mode(&WorkingMode::DcConstantCurrent { current: -50.0 }).unwrap();
        let (_, payload) = frames[0];
        assert_eq!(&payload[2..6], &(-50_000i32).to_be_bytes());
        let back = decode_set_mode(&payload, None, None).unwrap();
        assert_eq!(back, WorkingMode::DcConstantCurrent { current: -50.0 });

        // and +50.000 A decodes as discharging
        let frames = encode_set_mode(&WorkingMode::DcConstantCurrent { current: 50.0 }).unwrap();
        let back = decode_set_mode(&frames[0].1, None, None).unwrap();
        assert_eq!(back, WorkingMode::DcConstantCurrent { current: 50.0 });
    }

    #[test]
    fn multi_parameter_modes_split_across_frames() {
        let mode = WorkingMode::DcCcCv {
            voltage: 403.2,
            current: -25.0,
            end_current: 2.5,
        };
        let frames = encode_set_mode(&mode).unwrap();
        assert_eq!(frames.len(), 2);
        // register frame first, commit frame last
        assert_eq!(frames[0].0, PF_MODE_PARAMS_A);
        assert_eq!(frames[1].0, PF_SET_MODE);

        let back = decode_set_mode(&frames[1].1, Some(&frames[0].1), None).unwrap();
        assert_eq!(back, mode);
    }

    #[test]
    fn all_documented_modes_round_trip() {
        let modes = [
            WorkingMode::DcConstantVoltage { voltage: 750.0 },
            WorkingMode::DcConstantVoltageRamped { voltage: 750.0, ramp_rate: 10.0 },
            WorkingMode::DcConstantVoltageLimitedCurrent {
                voltage: 420.0,
                max_charge_current: 100.0,
                max_discharge_current: 125.0,
            },
            WorkingMode::DcConstantVoltageLimitedPower {
                voltage: 420.0,
                max_charge_power: 60_000.0,
                max_discharge_power: 90_000.0,
            },
            WorkingMode::DcConstantCurrent { current: -120.0 },
            WorkingMode::DcConstantPower { power: -90_000.0 },
            WorkingMode::DcConstantResistance { resistance: 4.7 },
            WorkingMode::DcConstantCurrentLimitedVoltage {
                current: 80.0,
                min_voltage: 320.0,
                max_voltage: 436.0,
            },
            WorkingMode::DcCcCv { voltage: 436.0, current: -100.0, end_current: 5.0 },
            WorkingMode::DcCpCv { voltage: 436.0, power: -45_000.0, end_current: 5.0 },
            WorkingMode::BatterySimulation {
                open_circuit_voltage: 380.0,
                internal_resistance: 0.05,
            },
            WorkingMode::AcConstantPower { active_power: -30_000.0, reactive_power: 5_000.0 },
            WorkingMode::IndependentInverter { voltage: 230.0, frequency: 50.0 },
            WorkingMode::AcConstantCurrent { active_current: -43.5, reactive_current: 7.2 },
            WorkingMode::AcReactivePower { reactive_power: 20_000.0 },
            WorkingMode::Idle,
            WorkingMode::SelfCheck,
            WorkingMode::Maintenance,
            WorkingMode::Standby,
        ];
        assert_eq!(modes.len(), 19);
        for mode in modes {
            let frames = encode_set_mode(&mode).unwrap();
            let commit = frames.last().unwrap();
            assert_eq!(commit.0, PF_SET_MODE);
            let aux_a = frames.iter().find(|f| f.0 == PF_MODE_PARAMS_A).map(|f| &f.1[..]);
            let aux_b = frames.iter().find(|f| f.0 == PF_MODE_PARAMS_B).map(|f| &f.1[..]);
            let back = decode_set_mode(&commit.1, aux_a, aux_b).unwrap();
            assert_eq!(back, mode, "round trip of {mode:?}");
        }
    }

    #[test]
    fn unknown_mode_decodes_raw_and_refuses_encode() {
        let payload = [0x00, 0x77, 0x00, 0x00, 0x12, 0x34, 0x00, 0x00];
        let mode = decode_set_mode(&payload, None, None).unwrap();
        assert_eq!(
            mode,
            WorkingMode::Unknown {
                code: 0x77,
                params: vec![0x1234],
            }
        );
        assert!(matches!(
            encode_set_mode(&mode),
            Err(ProtocolError::UnknownMode(0x77))
        ));
    }

    #[test]
    fn out_of_range_setpoint_is_refused() {
        // raw count 5e9 does not fit u32
        let result = encode_set_mode(&WorkingMode::DcConstantVoltage { voltage: 5_000_000.0 });
        assert!(matches!(
            result,
            Err(ProtocolError::OutOfRange { pf: 0x0B, field: "voltage" })
        ));
        // negative value for an unsigned field
        let result = encode_set_mode(&WorkingMode::DcConstantResistance { resistance: -1.0 });
        assert!(result.is_err());
    }

    #[test]
    fn control_overlay_keeps_undocumented_bits() {
        let prev = ControlVector([0x00, 0xAB, 0x00, 0x00, 0x5A, 0x00, 0x00, 0x01]);
        let started = encode_control(Some(&prev), ControlAction::Start).unwrap();
        assert_eq!(started[0], 0x01);
        assert_eq!(&started[1..], &prev.0[1..]);

        let stopped = encode_control(Some(&ControlVector(started)), ControlAction::Stop).unwrap();
        assert_eq!(stopped[0], 0x00);
        assert_eq!(&stopped[1..], &prev.0[1..]);

        let cleared = encode_control(Some(&prev), ControlAction::ClearFaults).unwrap();
        assert_eq!(cleared[0], 0x02);

        assert!(matches!(
            encode_control(None, ControlAction::Start),
            Err(ProtocolError::MissingContextForControl)
        ));
    }

    #[test]
    fn heartbeat_zero_fill_without_operator_data() {
        assert_eq!(encode_heartbeat(None).unwrap(), [0u8; 8]);
        assert_eq!(decode_heartbeat(&[0u8; 8]).unwrap(), None);

        let data = ExternalData {
            battery_voltage: 396.8,
            battery_current: -110.5,
            soc: 67.5,
        };
        let payload = encode_heartbeat(Some(&data)).unwrap();
        assert_eq!(decode_heartbeat(&payload).unwrap(), Some(data));
    }

    #[test]
    fn set_reply_acceptance() {
        assert!(decode_set_reply(b"\x01"));
        assert!(decode_set_reply(b"\x00\x01"));
        assert!(!decode_set_reply(b""));
        assert!(!decode_set_reply(b"\x00\x00"));
    }

    #[test]
    fn query_replies_round_trip() {
        let version = FirmwareVersion {
            software: (2, 14),
            hardware: (1, 3),
            protocol: 0x0102,
        };
        assert_eq!(FirmwareVersion::decode(&version.encode()).unwrap(), version);

        let limits = ProtectionParams {
            max_dc_voltage: 1000.0,
            min_dc_voltage: 150.0,
            max_dc_current: 300.0,
            max_power: 120.0,
        };
        assert_eq!(
            ProtectionParams::decode(&limits.encode().unwrap()).unwrap(),
            limits
        );
    }

    #[test]
    fn truncated_command_frames_are_rejected() {
        assert!(decode_set_mode(&[0x00], None, None).is_err());
        assert!(decode_heartbeat(&[0x00, 0x00]).is_err());
        assert!(FirmwareVersion::decode(&[1, 2, 3]).is_err());
        assert!(ProtectionParams::decode(&[0; 7]).is_err());
    }
}
