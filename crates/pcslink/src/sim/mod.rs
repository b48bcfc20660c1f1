// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Loopback PCS simulator.
//!
//! A virtual-bus peer that plays the PCS side of the protocol with the
//! same codec and timing rules as the real module: periodic telemetry at
//! the tick period, command ACKs one tick later, the mode-change-requires-
//! stopped rule, and the CAN1 fault latch on heartbeat starvation.

use crate::config::{
    CONTROLLER_ADDR, DEFAULT_HEARTBEAT_PERIOD, DEFAULT_PCS_ADDR, DEFAULT_PRIORITY,
    HEARTBEAT_STARVATION, PF_CAPACITY_ENERGY, PF_CONTROL, PF_CONTROL_STATE, PF_DC_ELECTRICAL,
    PF_DC_PRECISE, PF_DEVICE_STATUS, PF_FIRMWARE_VERSION, PF_GRID_CURRENTS, PF_GRID_VOLTAGES,
    PF_HEARTBEAT, PF_MODE_PARAMS_A, PF_MODE_PARAMS_B, PF_PROTECTION_PARAMS, PF_SET_MODE,
    PF_SYSTEM_POWER,
};
use crate::protocol::command::{decode_set_mode, FirmwareVersion, ProtectionParams, WorkingMode};
use crate::protocol::id::{self, CanId};
use crate::protocol::telemetry::{
    CapacityEnergy, ControlVector, DcElectrical, DcPrecise, DeviceStatus, FaultCode, GridCurrents,
    GridVoltages, RunningState, SystemPower,
};
use crate::transport::vbus::{VirtualBus, VirtualBusAdapter};
use crate::transport::BusAdapter;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const ACK: [u8; 8] = [0x01, 0, 0, 0, 0, 0, 0, 0];
const NACK: [u8; 8] = [0x00; 8];

/// Simulator construction parameters.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Source address the simulated PCS answers from.
    pub pcs_addr: u8,
    /// Priority of emitted frames.
    pub priority: u8,
    /// Telemetry/reply tick period.
    pub tick_period: Duration,
    /// Heartbeat silence after which 0x800D latches.
    pub heartbeat_timeout: Duration,
    /// Telemetry noise amplitude (volts on the DC bus; other quantities
    /// scale from it).
    pub noise_amplitude: f64,
    /// Noise generator seed.
    pub seed: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            pcs_addr: DEFAULT_PCS_ADDR,
            priority: DEFAULT_PRIORITY,
            tick_period: DEFAULT_HEARTBEAT_PERIOD,
            heartbeat_timeout: HEARTBEAT_STARVATION,
            noise_amplitude: 0.4,
            seed: 0x1F2E_3D4C,
        }
    }
}

/// Marsaglia xorshift32; plenty for telemetry jitter.
struct XorShift(u32);

impl XorShift {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    /// Uniform in [-1.0, 1.0).
    fn next_signed(&mut self) -> f64 {
        f64::from(self.next_u32() as i32) / f64::from(i32::MAX)
    }
}

struct SimState {
    running: RunningState,
    fault: FaultCode,
    mode: WorkingMode,
    control: [u8; 8],
    last_heartbeat: Instant,
    /// Replies to emit on the next tick: (PF, payload).
    pending_replies: Vec<(u8, [u8; 8])>,
    /// Parameter registers received ahead of the 0x0B commit.
    aux_a: Option<[u8; 8]>,
    aux_b: Option<[u8; 8]>,
    paused: HashSet<u8>,
    rng: XorShift,
    /// Slowly wandering DC bus base voltage.
    dc_base_voltage: f64,
}

struct SimShared {
    state: Mutex<SimState>,
    stopping: AtomicBool,
}

/// The simulated PCS. Dropping it stops both worker threads.
pub struct PcsSimulator {
    shared: Arc<SimShared>,
    adapter: Arc<VirtualBusAdapter>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PcsSimulator {
    /// Attach to a virtual bus and start the tick and receive threads.
    pub fn start(bus: &VirtualBus, config: SimulatorConfig) -> io::Result<Self> {
        let filters = [
            PF_SET_MODE,
            PF_MODE_PARAMS_A,
            PF_MODE_PARAMS_B,
            PF_CONTROL,
            PF_HEARTBEAT,
            PF_FIRMWARE_VERSION,
            PF_PROTECTION_PARAMS,
        ]
        .iter()
        .map(|&pf| (pf, config.pcs_addr))
        .collect();
        let adapter = Arc::new(bus.attach(filters));

        let shared = Arc::new(SimShared {
            state: Mutex::new(SimState {
                running: RunningState::Stopped,
                fault: FaultCode::NONE,
                mode: WorkingMode::Standby,
                control: [0u8; 8],
                last_heartbeat: Instant::now(),
                pending_replies: Vec::new(),
                aux_a: None,
                aux_b: None,
                paused: HashSet::new(),
                rng: XorShift(config.seed | 1),
                dc_base_voltage: 752.0,
            }),
            stopping: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(2);
        {
            let shared = Arc::clone(&shared);
            let adapter = Arc::clone(&adapter);
            let cfg = config.clone();
            workers.push(
                thread::Builder::new()
                    .name("pcs-sim-tick".into())
                    .spawn(move || tick_loop(&shared, adapter.as_ref(), &cfg))?,
            );
        }
        {
            let shared = Arc::clone(&shared);
            let adapter = Arc::clone(&adapter);
            let cfg = config.clone();
            workers.push(
                thread::Builder::new()
                    .name("pcs-sim-rx".into())
                    .spawn(move || receive_loop(&shared, adapter.as_ref(), &cfg))?,
            );
        }

        log::info!(
            "[SIM] PCS simulator up: addr={:#04X} tick={:?} hb_timeout={:?}",
            config.pcs_addr,
            config.tick_period,
            config.heartbeat_timeout
        );
        Ok(Self {
            shared,
            adapter,
            workers: Mutex::new(workers),
        })
    }

    /// Suspend a telemetry PF (test control).
    pub fn pause_telemetry(&self, pf: u8) {
        self.shared.state.lock().paused.insert(pf);
    }

    /// Resume a paused telemetry PF.
    pub fn resume_telemetry(&self, pf: u8) {
        self.shared.state.lock().paused.remove(&pf);
    }

    /// Current simulated running state.
    #[must_use]
    pub fn running_state(&self) -> RunningState {
        self.shared.state.lock().running
    }

    /// Current simulated fault code.
    #[must_use]
    pub fn fault(&self) -> FaultCode {
        self.shared.state.lock().fault
    }

    /// Last commanded working mode.
    #[must_use]
    pub fn mode(&self) -> WorkingMode {
        self.shared.state.lock().mode.clone()
    }

    /// Stop both threads and detach from the bus.
    pub fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.adapter.close();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        log::info!("[SIM] PCS simulator stopped");
    }
}

impl Drop for PcsSimulator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tx_id(cfg: &SimulatorConfig, pf: u8) -> u32 {
    CanId {
        priority: cfg.priority,
        pf,
        ps: CONTROLLER_ADDR,
        sa: cfg.pcs_addr,
    }
    .pack()
}

// ============================================================================
// Tick loop: pending replies, starvation check, telemetry
// ============================================================================

fn tick_loop(shared: &SimShared, adapter: &VirtualBusAdapter, cfg: &SimulatorConfig) {
    let mut next = Instant::now() + cfg.tick_period;
    while !shared.stopping.load(Ordering::Acquire) {
        let now = Instant::now();
        if now < next {
            thread::sleep((next - now).min(Duration::from_millis(50)));
            continue;
        }
        next += cfg.tick_period;
        while next <= Instant::now() {
            next += cfg.tick_period;
        }

        let (replies, frames) = {
            let mut state = shared.state.lock();

            // Heartbeat starvation latches the CAN1 fault.
            if !state.fault.is_fault() && state.last_heartbeat.elapsed() > cfg.heartbeat_timeout {
                log::warn!(
                    "[SIM] heartbeat starved for {:?}; latching {:#06X}",
                    cfg.heartbeat_timeout,
                    FaultCode::CAN1_COMM_FAULT.0
                );
                state.fault = FaultCode::CAN1_COMM_FAULT;
                state.running = RunningState::Faulted;
            }

            let replies: Vec<(u8, [u8; 8])> = state.pending_replies.drain(..).collect();
            let frames = telemetry_frames(&mut state);

            // Start/stop ramps settle one tick after they were reported.
            match state.running {
                RunningState::Starting => state.running = RunningState::Running,
                RunningState::Stopping => state.running = RunningState::Stopped,
                _ => {}
            }
            (replies, frames)
        };

        for (pf, payload) in replies {
            let _ = adapter.send(tx_id(cfg, pf), &payload);
        }
        for (pf, payload) in frames {
            let _ = adapter.send(tx_id(cfg, pf), &payload);
        }
    }
}

/// Build this tick's telemetry set, honoring paused PFs.
fn telemetry_frames(state: &mut SimState) -> Vec<(u8, [u8; 8])> {
    // The DC bus wanders slowly; everything else derives from it.
    state.dc_base_voltage += state.rng.next_signed() * 0.05;
    let noise = |rng: &mut XorShift, amp: f64| rng.next_signed() * amp;

    let producing = state.running == RunningState::Running;
    let dc_current = if producing {
        match state.mode {
            WorkingMode::DcConstantCurrent { current } => current,
            WorkingMode::DcCcCv { current, .. } => current,
            WorkingMode::DcConstantPower { power } => power / state.dc_base_voltage,
            _ => -80.0,
        }
    } else {
        0.0
    } + noise(&mut state.rng, 0.05);
    let dc_voltage = state.dc_base_voltage + noise(&mut state.rng, 0.4);
    let dc_power_kw = dc_voltage * dc_current / 1000.0;

    let mut frames = Vec::with_capacity(8);
    let mut push = |pf: u8, payload: [u8; 8], paused: &HashSet<u8>| {
        if !paused.contains(&pf) {
            frames.push((pf, payload));
        }
    };

    if let Ok(payload) = (DcElectrical {
        voltage: dc_voltage,
        current: dc_current,
        power: dc_power_kw,
        temperature: 38.5 + noise(&mut state.rng, 0.2),
    })
    .encode()
    {
        push(PF_DC_ELECTRICAL, payload, &state.paused);
    }
    if let Ok(payload) = (CapacityEnergy {
        capacity: 180.0,
        energy: -42.5,
    })
    .encode()
    {
        push(PF_CAPACITY_ENERGY, payload, &state.paused);
    }
    push(
        PF_DEVICE_STATUS,
        DeviceStatus {
            state: state.running,
            fault: state.fault,
            alarm: 0,
        }
        .encode(),
        &state.paused,
    );
    if let Ok(payload) = (GridVoltages {
        phase_u: 230.0 + noise(&mut state.rng, 0.3),
        phase_v: 230.4 + noise(&mut state.rng, 0.3),
        phase_w: 229.7 + noise(&mut state.rng, 0.3),
    })
    .encode()
    {
        push(PF_GRID_VOLTAGES, payload, &state.paused);
    }
    let ac_current = dc_power_kw.abs() / 3.0 / 0.23;
    if let Ok(payload) = (GridCurrents {
        phase_u: ac_current,
        phase_v: ac_current,
        phase_w: ac_current,
        power_factor: 0.99,
    })
    .encode()
    {
        push(PF_GRID_CURRENTS, payload, &state.paused);
    }
    if let Ok(payload) = (SystemPower {
        active: dc_power_kw,
        reactive: 0.4,
        apparent: dc_power_kw.abs() + 0.4,
        frequency: 50.0 + noise(&mut state.rng, 0.01),
    })
    .encode()
    {
        push(PF_SYSTEM_POWER, payload, &state.paused);
    }
    push(
        PF_CONTROL_STATE,
        ControlVector(state.control).encode(),
        &state.paused,
    );
    if let Ok(payload) = (DcPrecise {
        voltage: dc_voltage,
        current: dc_current,
    })
    .encode()
    {
        push(PF_DC_PRECISE, payload, &state.paused);
    }
    frames
}

// ============================================================================
// Receive loop: heartbeats and commands
// ============================================================================

fn receive_loop(shared: &SimShared, adapter: &VirtualBusAdapter, cfg: &SimulatorConfig) {
    while !shared.stopping.load(Ordering::Acquire) {
        let frame = match adapter.recv(Duration::from_millis(50)) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(_) => break,
        };
        let fields = match id::unpack(frame.id) {
            Ok(fields) => fields,
            Err(err) => {
                log::debug!("[SIM] dropping frame {:#010X}: {err}", frame.id);
                continue;
            }
        };
        if !(fields.sa == CONTROLLER_ADDR && fields.ps == cfg.pcs_addr) {
            log::debug!("[SIM] dropping frame {:#010X}: not for this PCS", frame.id);
            continue;
        }
        handle_command(shared, fields.pf, &frame.data);
    }
}

fn handle_command(shared: &SimShared, pf: u8, data: &[u8]) {
    let mut state = shared.state.lock();
    match pf {
        PF_HEARTBEAT => {
            // Liveness only; payload content is ignored.
            state.last_heartbeat = Instant::now();
        }
        PF_MODE_PARAMS_A => {
            state.aux_a = copy_payload(data);
            state.pending_replies.push((pf, ACK));
        }
        PF_MODE_PARAMS_B => {
            state.aux_b = copy_payload(data);
            state.pending_replies.push((pf, ACK));
        }
        PF_SET_MODE => {
            let reply = apply_set_mode(&mut state, data);
            state.pending_replies.push((pf, reply));
            state.aux_a = None;
            state.aux_b = None;
        }
        PF_CONTROL => {
            let reply = apply_control(&mut state, data);
            state.pending_replies.push((pf, reply));
        }
        PF_FIRMWARE_VERSION => {
            let version = FirmwareVersion {
                software: (2, 14),
                hardware: (1, 3),
                protocol: 0x0102,
            };
            state.pending_replies.push((pf, version.encode()));
        }
        PF_PROTECTION_PARAMS => {
            let limits = ProtectionParams {
                max_dc_voltage: 1000.0,
                min_dc_voltage: 150.0,
                max_dc_current: 300.0,
                max_power: 120.0,
            };
            if let Ok(payload) = limits.encode() {
                state.pending_replies.push((pf, payload));
            }
        }
        other => {
            log::debug!("[SIM] ignoring PF={other:#04X}");
        }
    }
}

fn copy_payload(data: &[u8]) -> Option<[u8; 8]> {
    (data.len() >= 8).then(|| {
        let mut out = [0u8; 8];
        out.copy_from_slice(&data[..8]);
        out
    })
}

fn apply_set_mode(state: &mut SimState, data: &[u8]) -> [u8; 8] {
    if state.running != RunningState::Stopped {
        log::debug!("[SIM] NACK mode change while {:?}", state.running);
        return NACK;
    }
    let aux_a = state.aux_a;
    let aux_b = state.aux_b;
    match decode_set_mode(data, aux_a.as_ref().map(|a| &a[..]), aux_b.as_ref().map(|b| &b[..])) {
        Ok(mode) => {
            log::debug!("[SIM] mode set to {mode:?}");
            state.mode = mode;
            ACK
        }
        Err(err) => {
            log::debug!("[SIM] NACK undecodable mode request: {err}");
            NACK
        }
    }
}

fn apply_control(state: &mut SimState, data: &[u8]) -> [u8; 8] {
    let Some(vector) = copy_payload(data) else {
        return NACK;
    };
    let start_requested = vector[0] & 0x01 != 0;
    let clear_requested = vector[0] & 0x02 != 0;
    let was_started = state.control[0] & 0x01 != 0;

    if clear_requested {
        // Fault clears only while the power stage is off.
        if state.running == RunningState::Running || state.running == RunningState::Starting {
            return NACK;
        }
        if state.fault.is_fault() {
            log::info!("[SIM] clearing fault {:#06X}", state.fault.0);
            state.fault = FaultCode::NONE;
            state.running = RunningState::Stopped;
            state.last_heartbeat = Instant::now();
        }
    }

    if start_requested && !was_started {
        if state.fault.is_fault() {
            return NACK;
        }
        state.running = RunningState::Starting;
    } else if !start_requested && was_started {
        if state.running == RunningState::Running || state.running == RunningState::Starting {
            state.running = RunningState::Stopping;
        }
    }

    // The clear bit is write-1 self-clearing; everything else persists.
    state.control = vector;
    state.control[0] &= !0x02;
    ACK
}
