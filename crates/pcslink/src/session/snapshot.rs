// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device snapshot: the most recent decoded value of every RX frame
//! family, timestamped per field.
//!
//! Updates are record-atomic: the snapshot lives under the session mutex
//! and a field is replaced wholesale by one decoded record, never patched
//! byte-wise.

use crate::protocol::telemetry::{
    CapacityEnergy, ControlVector, DcElectrical, DcPrecise, DeviceStatus, GridCurrents,
    GridVoltages,
};
use crate::protocol::telemetry::SystemPower;
use crate::protocol::Decoded;
use std::time::{Duration, Instant};

/// One snapshot field read-out: the value, when it arrived, and whether it
/// is within the freshness window.
#[derive(Debug, Clone, Copy)]
pub struct Reading<T> {
    pub value: T,
    /// Monotonic bus timestamp of the last update.
    pub at: Instant,
    /// True iff `at` is within the freshness window of the read.
    pub fresh: bool,
}

/// Latest decoded value of each RX frame family.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    dc: Option<(DcElectrical, Instant)>,
    capacity: Option<(CapacityEnergy, Instant)>,
    status: Option<(DeviceStatus, Instant)>,
    grid_voltages: Option<(GridVoltages, Instant)>,
    grid_currents: Option<(GridCurrents, Instant)>,
    system_power: Option<(SystemPower, Instant)>,
    control: Option<(ControlVector, Instant)>,
    dc_precise: Option<(DcPrecise, Instant)>,
}

fn read<T: Copy>(
    slot: &Option<(T, Instant)>,
    window: Duration,
    now: Instant,
) -> Option<Reading<T>> {
    slot.map(|(value, at)| Reading {
        value,
        at,
        fresh: now.saturating_duration_since(at) <= window,
    })
}

impl DeviceSnapshot {
    /// Fold one decoded frame into the snapshot. Reply frames carry no
    /// state and are ignored here.
    pub(crate) fn apply(&mut self, decoded: &Decoded, ts: Instant) {
        match decoded {
            Decoded::DcElectrical(v) => self.dc = Some((*v, ts)),
            Decoded::CapacityEnergy(v) => self.capacity = Some((*v, ts)),
            Decoded::DeviceStatus(v) => self.status = Some((*v, ts)),
            Decoded::GridVoltages(v) => self.grid_voltages = Some((*v, ts)),
            Decoded::GridCurrents(v) => self.grid_currents = Some((*v, ts)),
            Decoded::SystemPower(v) => self.system_power = Some((*v, ts)),
            Decoded::ControlState(v) => self.control = Some((*v, ts)),
            Decoded::DcPrecise(v) => self.dc_precise = Some((*v, ts)),
            Decoded::SetReply { .. }
            | Decoded::FirmwareVersion(_)
            | Decoded::ProtectionParams(_) => {}
        }
    }

    /// Last control vector observed from the PCS, if any. Carry-over
    /// context for control writes.
    #[must_use]
    pub(crate) fn control_vector(&self) -> Option<&ControlVector> {
        self.control.as_ref().map(|(vector, _)| vector)
    }

    #[must_use]
    pub fn dc_electrical(&self, window: Duration, now: Instant) -> Option<Reading<DcElectrical>> {
        read(&self.dc, window, now)
    }

    #[must_use]
    pub fn capacity_energy(
        &self,
        window: Duration,
        now: Instant,
    ) -> Option<Reading<CapacityEnergy>> {
        read(&self.capacity, window, now)
    }

    #[must_use]
    pub fn device_status(&self, window: Duration, now: Instant) -> Option<Reading<DeviceStatus>> {
        read(&self.status, window, now)
    }

    #[must_use]
    pub fn grid_voltages(&self, window: Duration, now: Instant) -> Option<Reading<GridVoltages>> {
        read(&self.grid_voltages, window, now)
    }

    #[must_use]
    pub fn grid_currents(&self, window: Duration, now: Instant) -> Option<Reading<GridCurrents>> {
        read(&self.grid_currents, window, now)
    }

    #[must_use]
    pub fn system_power(&self, window: Duration, now: Instant) -> Option<Reading<SystemPower>> {
        read(&self.system_power, window, now)
    }

    #[must_use]
    pub fn control_state(&self, window: Duration, now: Instant) -> Option<Reading<ControlVector>> {
        read(&self.control, window, now)
    }

    #[must_use]
    pub fn dc_precise(&self, window: Duration, now: Instant) -> Option<Reading<DcPrecise>> {
        read(&self.dc_precise, window, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::telemetry::{FaultCode, RunningState};

    #[test]
    fn apply_replaces_whole_records() {
        let mut snapshot = DeviceSnapshot::default();
        let t0 = Instant::now();
        snapshot.apply(
            &Decoded::DcElectrical(DcElectrical {
                voltage: 750.0,
                current: -120.0,
                power: -90.0,
                temperature: 40.0,
            }),
            t0,
        );
        let reading = snapshot.dc_electrical(Duration::from_secs(1), t0).unwrap();
        assert_eq!(reading.value.voltage, 750.0);
        assert!(reading.fresh);

        let t1 = t0 + Duration::from_millis(200);
        snapshot.apply(
            &Decoded::DcElectrical(DcElectrical {
                voltage: 751.0,
                current: -119.0,
                power: -89.4,
                temperature: 40.1,
            }),
            t1,
        );
        let reading = snapshot.dc_electrical(Duration::from_secs(1), t1).unwrap();
        assert_eq!(reading.value.voltage, 751.0);
        assert_eq!(reading.at, t1);
    }

    #[test]
    fn freshness_expires_with_the_window() {
        let mut snapshot = DeviceSnapshot::default();
        let t0 = Instant::now();
        snapshot.apply(
            &Decoded::DeviceStatus(DeviceStatus {
                state: RunningState::Running,
                fault: FaultCode::NONE,
                alarm: 0,
            }),
            t0,
        );
        let window = Duration::from_secs(1);
        assert!(snapshot.device_status(window, t0).unwrap().fresh);
        assert!(
            !snapshot
                .device_status(window, t0 + Duration::from_millis(1500))
                .unwrap()
                .fresh
        );
    }

    #[test]
    fn replies_do_not_touch_the_snapshot() {
        let mut snapshot = DeviceSnapshot::default();
        snapshot.apply(
            &Decoded::SetReply {
                pf: 0x0F,
                acknowledged: true,
            },
            Instant::now(),
        );
        assert!(snapshot
            .control_state(Duration::from_secs(1), Instant::now())
            .is_none());
    }
}
