// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocol of the YSTECH PCS application layer.
//!
//! - [`id`] - 29-bit J1939-style identifier pack/unpack
//! - [`telemetry`] - periodic PCS -> controller frames
//! - [`command`] - controller -> PCS commands and their replies
//!
//! Decoding is dispatched through a static PF-indexed table of tagged
//! [`Decoder`] variants; adding a frame type is adding a row.

/// Command frames (set mode, control word, heartbeat, queries).
pub mod command;
/// 29-bit extended identifier codec.
pub mod id;
/// Periodic telemetry frames.
pub mod telemetry;

pub(crate) mod wire;

use crate::config::{
    PF_CAPACITY_ENERGY, PF_CONTROL, PF_CONTROL_STATE, PF_DC_ELECTRICAL, PF_DC_PRECISE,
    PF_DEVICE_STATUS, PF_FIRMWARE_VERSION, PF_GRID_CURRENTS, PF_GRID_VOLTAGES, PF_MODE_PARAMS_A,
    PF_MODE_PARAMS_B, PF_PROTECTION_PARAMS, PF_SET_MODE, PF_SYSTEM_POWER,
};
use crate::protocol::command::{decode_set_reply, FirmwareVersion, ProtectionParams};
use crate::protocol::telemetry::{
    CapacityEnergy, ControlVector, DcElectrical, DcPrecise, DeviceStatus, GridCurrents,
    GridVoltages, SystemPower,
};

// ============================================================================
// Errors
// ============================================================================

/// Protocol-level encode/decode failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload shorter than the fields its decoder reads.
    TruncatedFrame { pf: u8, have: usize, need: usize },
    /// No decoder row for this PF.
    UnknownPf(u8),
    /// Engineering value does not fit the raw integer after scaling.
    OutOfRange { pf: u8, field: &'static str },
    /// Mode word outside the documented table on the encode side.
    UnknownMode(u16),
    /// Control write attempted before any control vector was observed.
    MissingContextForControl,
    /// Identifier fields out of range, above 29 bits, or paged.
    InvalidIdentifier(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::TruncatedFrame { pf, have, need } => {
                write!(f, "truncated PF={pf:#04X} frame: have {have} bytes, need {need}")
            }
            ProtocolError::UnknownPf(pf) => write!(f, "unknown PF {pf:#04X}"),
            ProtocolError::OutOfRange { pf, field } => {
                write!(f, "field `{field}` out of range for PF={pf:#04X}")
            }
            ProtocolError::UnknownMode(code) => write!(f, "unknown working mode {code:#06X}"),
            ProtocolError::MissingContextForControl => {
                write!(f, "no control vector observed yet; cannot overlay a control write")
            }
            ProtocolError::InvalidIdentifier(reason) => {
                write!(f, "invalid identifier: {reason}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

// ============================================================================
// Decoder dispatch
// ============================================================================

/// One decoded inbound (PCS -> controller) frame.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "frame", content = "fields", rename_all = "snake_case")
)]
pub enum Decoded {
    DcElectrical(DcElectrical),
    CapacityEnergy(CapacityEnergy),
    DeviceStatus(DeviceStatus),
    GridVoltages(GridVoltages),
    GridCurrents(GridCurrents),
    SystemPower(SystemPower),
    ControlState(ControlVector),
    DcPrecise(DcPrecise),
    /// Acknowledgement for a set command (same PF as the command).
    SetReply { pf: u8, acknowledged: bool },
    FirmwareVersion(FirmwareVersion),
    ProtectionParams(ProtectionParams),
}

impl Decoded {
    /// PF the record was decoded from.
    #[must_use]
    pub fn pf(&self) -> u8 {
        match self {
            Decoded::DcElectrical(_) => PF_DC_ELECTRICAL,
            Decoded::CapacityEnergy(_) => PF_CAPACITY_ENERGY,
            Decoded::DeviceStatus(_) => PF_DEVICE_STATUS,
            Decoded::GridVoltages(_) => PF_GRID_VOLTAGES,
            Decoded::GridCurrents(_) => PF_GRID_CURRENTS,
            Decoded::SystemPower(_) => PF_SYSTEM_POWER,
            Decoded::ControlState(_) => PF_CONTROL_STATE,
            Decoded::DcPrecise(_) => PF_DC_PRECISE,
            Decoded::SetReply { pf, .. } => *pf,
            Decoded::FirmwareVersion(_) => PF_FIRMWARE_VERSION,
            Decoded::ProtectionParams(_) => PF_PROTECTION_PARAMS,
        }
    }
}

/// Tagged decoder entry of the static PF dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    DcElectrical,
    CapacityEnergy,
    DeviceStatus,
    GridVoltages,
    GridCurrents,
    SystemPower,
    ControlState,
    DcPrecise,
    SetReply,
    FirmwareVersion,
    ProtectionParams,
}

/// Static decode table: one row per inbound PF.
pub const DECODERS: &[(u8, Decoder)] = &[
    (PF_SET_MODE, Decoder::SetReply),
    (PF_MODE_PARAMS_A, Decoder::SetReply),
    (PF_MODE_PARAMS_B, Decoder::SetReply),
    (PF_CONTROL, Decoder::SetReply),
    (PF_DC_ELECTRICAL, Decoder::DcElectrical),
    (PF_CAPACITY_ENERGY, Decoder::CapacityEnergy),
    (PF_DEVICE_STATUS, Decoder::DeviceStatus),
    (PF_GRID_VOLTAGES, Decoder::GridVoltages),
    (PF_GRID_CURRENTS, Decoder::GridCurrents),
    (PF_SYSTEM_POWER, Decoder::SystemPower),
    (PF_CONTROL_STATE, Decoder::ControlState),
    (PF_FIRMWARE_VERSION, Decoder::FirmwareVersion),
    (PF_PROTECTION_PARAMS, Decoder::ProtectionParams),
    (PF_DC_PRECISE, Decoder::DcPrecise),
];

/// Look up the decoder for a PF.
#[must_use]
pub fn decoder_for(pf: u8) -> Option<Decoder> {
    DECODERS
        .iter()
        .find(|(entry_pf, _)| *entry_pf == pf)
        .map(|(_, decoder)| *decoder)
}

/// Decode an inbound payload, dispatching on the PF's table row.
pub fn decode(pf: u8, data: &[u8]) -> Result<Decoded, ProtocolError> {
    let decoder = decoder_for(pf).ok_or(ProtocolError::UnknownPf(pf))?;
    Ok(match decoder {
        Decoder::DcElectrical => Decoded::DcElectrical(DcElectrical::decode(data)?),
        Decoder::CapacityEnergy => Decoded::CapacityEnergy(CapacityEnergy::decode(data)?),
        Decoder::DeviceStatus => Decoded::DeviceStatus(DeviceStatus::decode(data)?),
        Decoder::GridVoltages => Decoded::GridVoltages(GridVoltages::decode(data)?),
        Decoder::GridCurrents => Decoded::GridCurrents(GridCurrents::decode(data)?),
        Decoder::SystemPower => Decoded::SystemPower(SystemPower::decode(data)?),
        Decoder::ControlState => Decoded::ControlState(ControlVector::decode(data)?),
        Decoder::DcPrecise => Decoded::DcPrecise(DcPrecise::decode(data)?),
        Decoder::SetReply => Decoded::SetReply {
            pf,
            acknowledged: decode_set_reply(data),
        },
        Decoder::FirmwareVersion => Decoded::FirmwareVersion(FirmwareVersion::decode(data)?),
        Decoder::ProtectionParams => Decoded::ProtectionParams(ProtectionParams::decode(data)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_no_duplicate_rows() {
        for (i, (pf, _)) in DECODERS.iter().enumerate() {
            assert!(
                !DECODERS[i + 1..].iter().any(|(other, _)| other == pf),
                "duplicate decoder row for PF {pf:#04X}"
            );
        }
    }

    #[test]
    fn unknown_pf_is_reported_not_panicked() {
        assert!(matches!(
            decode(0xEE, &[0u8; 8]),
            Err(ProtocolError::UnknownPf(0xEE))
        ));
    }

    #[test]
    fn set_reply_dispatch_tolerates_empty_payloads() {
        // Length guards apply to telemetry; ACK decoding never index-faults.
        let decoded = decode(0x0F, &[]).unwrap();
        assert_eq!(
            decoded,
            Decoded::SetReply {
                pf: 0x0F,
                acknowledged: false
            }
        );
    }

    #[test]
    fn dispatch_reports_source_pf() {
        let status = decode(0x13, &[0, 2, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(status.pf(), 0x13);
        let reply = decode(0x0B, &[1]).unwrap();
        assert_eq!(reply.pf(), 0x0B);
    }
}
