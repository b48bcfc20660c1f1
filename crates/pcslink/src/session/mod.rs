// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session controller: owns the bus adapter, the receive pump, the 200 ms
//! heartbeat and the shared device-state snapshot.
//!
//! The snapshot, `last_rx` and the reply registry are one record behind one
//! mutex; the session state is atomic-readable without it. Callers never
//! hold the lock across a bus send.

/// Device snapshot and per-field readings.
pub mod snapshot;

pub use snapshot::{DeviceSnapshot, Reading};

use crate::config::{
    SessionConfig, BUS_OFF_LIMIT, BUS_OFF_WINDOW, CONTROLLER_ADDR, PF_CONTROL,
    PF_FIRMWARE_VERSION, PF_HEARTBEAT, PF_PROTECTION_PARAMS, PF_SET_MODE, RECV_DEADLINE,
};
use crate::protocol::command::{
    encode_control, encode_heartbeat, encode_query, encode_set_mode, ControlAction, ExternalData,
    FirmwareVersion, ProtectionParams, WorkingMode,
};
use crate::protocol::id::CanId;
use crate::protocol::telemetry::{
    CapacityEnergy, ControlVector, DcElectrical, DcPrecise, DeviceStatus, FaultCode, GridCurrents,
    GridVoltages, RunningState, SystemPower,
};
use crate::protocol::{decode, id, Decoded, ProtocolError, DECODERS};
use crate::transport::{self, BusAdapter, BusConfig, BusError, BusFrame};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Grace period for joining the background threads on close.
const CLOSE_JOIN_DEADLINE: Duration = Duration::from_secs(2);

/// Upper bound of one heartbeat-scheduler sleep, so the stop flag is
/// observed promptly.
const SCHED_SLEEP_SLICE: Duration = Duration::from_millis(50);

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by session operations.
#[derive(Debug)]
pub enum SessionError {
    /// No PCS traffic seen yet, or the session is closed.
    NotConnected,
    /// Another request is already in flight on this PF.
    Busy(u8),
    /// No reply within the command timeout.
    CommandTimeout(u8),
    /// The PCS replied with a NACK or an unexpected record.
    CommandRejected(String),
    /// Mode changes require the PCS to be stopped.
    ModeChangeWhileRunning,
    /// Rejected session configuration.
    InvalidConfig(String),
    /// Encode-side protocol failure.
    Protocol(ProtocolError),
    /// Bus-level failure after the adapter's internal retry.
    Bus(BusError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotConnected => write!(f, "session is not connected"),
            SessionError::Busy(pf) => write!(f, "request already in flight on PF={pf:#04X}"),
            SessionError::CommandTimeout(pf) => {
                write!(f, "no reply on PF={pf:#04X} within the command timeout")
            }
            SessionError::CommandRejected(reason) => write!(f, "command rejected: {reason}"),
            SessionError::ModeChangeWhileRunning => {
                write!(f, "mode change requires the PCS to be stopped")
            }
            SessionError::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
            SessionError::Protocol(err) => write!(f, "protocol error: {err}"),
            SessionError::Bus(err) => write!(f, "bus error: {err}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Protocol(err) => Some(err),
            SessionError::Bus(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        SessionError::Protocol(err)
    }
}

impl From<BusError> for SessionError {
    fn from(err: BusError) -> Self {
        SessionError::Bus(err)
    }
}

// ============================================================================
// Session state
// ============================================================================

/// Connection state of a session, readable without the session lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// No PCS traffic observed yet.
    Disconnected = 0,
    /// Inbound traffic within `rx_timeout`.
    Connected = 1,
    /// RX silence beyond `rx_timeout`, or repeated heartbeat send failures.
    Degraded = 2,
    /// Repeated bus-off, or the PCS latched the CAN1 fault.
    Faulted = 3,
    /// Closed; terminal.
    Closed = 4,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::Connected,
            2 => SessionState::Degraded,
            3 => SessionState::Faulted,
            4 => SessionState::Closed,
            _ => SessionState::Disconnected,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connected => "Connected",
            SessionState::Degraded => "Degraded",
            SessionState::Faulted => "Faulted",
            SessionState::Closed => "Closed",
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

type Subscriber = Arc<dyn Fn(&Decoded) + Send + Sync>;

enum ReplySlot {
    Pending,
    Ready(Decoded),
}

/// Everything the three session threads share. The mutex-guarded part is
/// one record by design: snapshot, last-rx and the reply registry move
/// together.
struct Shared {
    inner: Mutex<Inner>,
    reply_cv: Condvar,
    state: AtomicU8,
    stopping: AtomicBool,
    heartbeat_paused: AtomicBool,
}

struct Inner {
    snapshot: DeviceSnapshot,
    last_rx: Option<Instant>,
    replies: HashMap<u8, ReplySlot>,
    subscribers: Vec<Subscriber>,
    external: Option<ExternalData>,
    bus_off_times: VecDeque<Instant>,
    heartbeat_failures: u32,
    last_heartbeat_tx: Option<Instant>,
}

impl Shared {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                snapshot: DeviceSnapshot::default(),
                last_rx: None,
                replies: HashMap::new(),
                subscribers: Vec::new(),
                external: None,
                bus_off_times: VecDeque::new(),
                heartbeat_failures: 0,
                last_heartbeat_tx: None,
            }),
            reply_cv: Condvar::new(),
            state: AtomicU8::new(SessionState::Disconnected as u8),
            stopping: AtomicBool::new(false),
            heartbeat_paused: AtomicBool::new(false),
        }
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition the state machine; Closed is terminal and transitions to
    /// the current state are silent.
    fn set_state(&self, new: SessionState) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = SessionState::from_u8(current);
            if state == SessionState::Closed || state == new {
                return;
            }
            match self.state.compare_exchange(
                current,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    log::info!("[SESSION] state {} -> {}", state.name(), new.name());
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A live control session with one PCS module.
///
/// Owns the bus adapter and two background threads (receive pump,
/// heartbeat). Dropping the session closes it.
pub struct Session {
    shared: Arc<Shared>,
    adapter: Arc<dyn BusAdapter>,
    config: SessionConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Validate the configuration, open the bus adapter and start the
    /// background threads.
    pub fn open(config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;

        // Accept only frames addressed to the controller.
        let filters: Vec<(u8, u8)> = DECODERS
            .iter()
            .map(|&(pf, _)| (pf, CONTROLLER_ADDR))
            .collect();
        let adapter: Arc<dyn BusAdapter> = Arc::from(transport::open(&BusConfig {
            channel: config.channel.clone(),
            bitrate: config.bitrate,
            interface: config.interface,
            filters,
            reconnect_backoff_cap: config.reconnect_backoff_cap,
        })?);

        let shared = Arc::new(Shared::new());
        let mut workers = Vec::with_capacity(2);

        {
            let shared = Arc::clone(&shared);
            let adapter = Arc::clone(&adapter);
            let cfg = config.clone();
            workers.push(
                thread::Builder::new()
                    .name("pcs-rx-pump".into())
                    .spawn(move || receive_pump(&shared, adapter.as_ref(), &cfg))
                    .map_err(|err| SessionError::Bus(BusError::Transient(err)))?,
            );
        }
        {
            let shared = Arc::clone(&shared);
            let adapter = Arc::clone(&adapter);
            let cfg = config.clone();
            workers.push(
                thread::Builder::new()
                    .name("pcs-heartbeat".into())
                    .spawn(move || heartbeat_loop(&shared, adapter.as_ref(), &cfg))
                    .map_err(|err| SessionError::Bus(BusError::Transient(err)))?,
            );
        }

        log::info!(
            "[SESSION] open: channel={:?} pcs_addr={:#04X} heartbeat={:?}",
            config.channel,
            config.pcs_addr,
            config.heartbeat_period
        );
        Ok(Self {
            shared,
            adapter,
            config,
            workers: Mutex::new(workers),
        })
    }

    /// Current state, without taking the session lock.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Time since the last inbound PCS frame.
    #[must_use]
    pub fn time_since_last_rx(&self) -> Option<Duration> {
        self.shared.inner.lock().last_rx.map(|at| at.elapsed())
    }

    /// Time since the last successful heartbeat transmission. Above 1 s the
    /// link should be treated as degraded, above 5 s the PCS has latched
    /// the CAN1 fault.
    #[must_use]
    pub fn time_since_last_heartbeat_tx(&self) -> Option<Duration> {
        self.shared
            .inner
            .lock()
            .last_heartbeat_tx
            .map(|at| at.elapsed())
    }

    /// Register a consumer called on the receive-pump thread for every
    /// decoded frame. Callbacks must not block; panics are contained and
    /// logged at WARNING.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&Decoded) + Send + Sync + 'static,
    {
        self.shared.inner.lock().subscribers.push(Arc::new(callback));
    }

    /// Set (or clear) the battery-side mirror data carried in heartbeats.
    pub fn set_external_data(&self, data: Option<ExternalData>) {
        self.shared.inner.lock().external = data;
    }

    /// Suspend heartbeat transmissions (maintenance aid). The schedule
    /// keeps ticking; resumed beats re-align to it.
    pub fn pause_heartbeat(&self) {
        self.shared.heartbeat_paused.store(true, Ordering::Release);
        log::warn!("[SESSION] heartbeat paused");
    }

    /// Resume heartbeat transmissions.
    pub fn resume_heartbeat(&self) {
        self.shared.heartbeat_paused.store(false, Ordering::Release);
        log::info!("[SESSION] heartbeat resumed");
    }

    // ------------------------------------------------------------------
    // Snapshot accessors
    // ------------------------------------------------------------------

    fn read_snapshot<T>(
        &self,
        read: impl FnOnce(&DeviceSnapshot, Duration, Instant) -> Option<Reading<T>>,
    ) -> Option<Reading<T>> {
        let inner = self.shared.inner.lock();
        read(&inner.snapshot, self.config.freshness_window, Instant::now())
    }

    #[must_use]
    pub fn dc_electrical(&self) -> Option<Reading<DcElectrical>> {
        self.read_snapshot(DeviceSnapshot::dc_electrical)
    }

    #[must_use]
    pub fn capacity_energy(&self) -> Option<Reading<CapacityEnergy>> {
        self.read_snapshot(DeviceSnapshot::capacity_energy)
    }

    #[must_use]
    pub fn device_status(&self) -> Option<Reading<DeviceStatus>> {
        self.read_snapshot(DeviceSnapshot::device_status)
    }

    #[must_use]
    pub fn grid_voltages(&self) -> Option<Reading<GridVoltages>> {
        self.read_snapshot(DeviceSnapshot::grid_voltages)
    }

    #[must_use]
    pub fn grid_currents(&self) -> Option<Reading<GridCurrents>> {
        self.read_snapshot(DeviceSnapshot::grid_currents)
    }

    #[must_use]
    pub fn system_power(&self) -> Option<Reading<SystemPower>> {
        self.read_snapshot(DeviceSnapshot::system_power)
    }

    #[must_use]
    pub fn control_state(&self) -> Option<Reading<ControlVector>> {
        self.read_snapshot(DeviceSnapshot::control_state)
    }

    #[must_use]
    pub fn dc_precise(&self) -> Option<Reading<DcPrecise>> {
        self.read_snapshot(DeviceSnapshot::dc_precise)
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Start the power stage.
    pub fn enable(&self) -> Result<(), SessionError> {
        self.control_write(ControlAction::Start)
    }

    /// Stop the power stage.
    pub fn disable(&self) -> Result<(), SessionError> {
        self.control_write(ControlAction::Stop)
    }

    /// Clear latched faults. On acknowledgement a Faulted session returns
    /// to Connected.
    pub fn reset_faults(&self) -> Result<(), SessionError> {
        self.control_write(ControlAction::ClearFaults)?;
        if self.shared.state() == SessionState::Faulted {
            self.shared.set_state(SessionState::Connected);
        }
        Ok(())
    }

    /// Command a working mode. The PCS must be observed `Stopped`;
    /// otherwise nothing is sent.
    pub fn set_mode(&self, mode: &WorkingMode) -> Result<(), SessionError> {
        self.ensure_commandable()?;
        {
            let inner = self.shared.inner.lock();
            match inner
                .snapshot
                .device_status(self.config.freshness_window, Instant::now())
            {
                None => return Err(SessionError::NotConnected),
                Some(reading) if reading.value.state != RunningState::Stopped => {
                    return Err(SessionError::ModeChangeWhileRunning);
                }
                Some(_) => {}
            }
        }

        let frames = encode_set_mode(mode)?;
        // Parameter registers first; the 0x0B commit frame carries the ACK.
        for (pf, payload) in &frames {
            if *pf != PF_SET_MODE {
                self.adapter.send(self.tx_id(*pf), payload)?;
            }
        }
        let (_, commit) = frames
            .last()
            .copied()
            .ok_or_else(|| SessionError::CommandRejected("empty mode encoding".into()))?;
        let reply = self.request(PF_SET_MODE, commit)?;
        expect_ack(PF_SET_MODE, &reply)
    }

    /// Query the firmware/hardware/protocol versions.
    pub fn read_firmware_version(&self) -> Result<FirmwareVersion, SessionError> {
        match self.request(PF_FIRMWARE_VERSION, encode_query())? {
            Decoded::FirmwareVersion(version) => Ok(version),
            other => Err(SessionError::CommandRejected(format!(
                "unexpected reply {other:?}"
            ))),
        }
    }

    /// Query the device protection limits.
    pub fn read_protection_params(&self) -> Result<ProtectionParams, SessionError> {
        match self.request(PF_PROTECTION_PARAMS, encode_query())? {
            Decoded::ProtectionParams(params) => Ok(params),
            other => Err(SessionError::CommandRejected(format!(
                "unexpected reply {other:?}"
            ))),
        }
    }

    /// Close the session: stop both threads, close the adapter, join with
    /// a deadline. Idempotent.
    pub fn close(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.set_state(SessionState::Closed);
        // Closing the adapter unblocks the pump's recv.
        self.adapter.close();
        // Wake command waiters so they observe the shutdown.
        self.shared.reply_cv.notify_all();

        let deadline = Instant::now() + CLOSE_JOIN_DEADLINE;
        for handle in self.workers.lock().drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_owned();
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::warn!("[SESSION] {name} did not stop within {CLOSE_JOIN_DEADLINE:?}");
            }
        }
        log::info!("[SESSION] closed");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn tx_id(&self, pf: u8) -> u32 {
        CanId {
            priority: self.config.priority,
            pf,
            ps: self.config.pcs_addr,
            sa: CONTROLLER_ADDR,
        }
        .pack()
    }

    fn ensure_commandable(&self) -> Result<(), SessionError> {
        match self.shared.state() {
            SessionState::Closed | SessionState::Disconnected => Err(SessionError::NotConnected),
            _ => Ok(()),
        }
    }

    fn control_write(&self, action: ControlAction) -> Result<(), SessionError> {
        self.ensure_commandable()?;
        let payload = {
            let inner = self.shared.inner.lock();
            encode_control(inner.snapshot.control_vector(), action)?
        };
        let reply = self.request(PF_CONTROL, payload)?;
        expect_ack(PF_CONTROL, &reply)
    }

    /// Send a request frame and wait for the matching reply. One request
    /// per PF may be in flight.
    fn request(&self, pf: u8, payload: [u8; 8]) -> Result<Decoded, SessionError> {
        self.ensure_commandable()?;
        {
            let mut inner = self.shared.inner.lock();
            if inner.replies.contains_key(&pf) {
                return Err(SessionError::Busy(pf));
            }
            inner.replies.insert(pf, ReplySlot::Pending);
        }

        // Send without the lock; the adapter retries one transient failure.
        if let Err(err) = self.adapter.send(self.tx_id(pf), &payload) {
            self.shared.inner.lock().replies.remove(&pf);
            return Err(SessionError::Bus(err));
        }

        let deadline = Instant::now() + self.config.command_timeout;
        let mut inner = self.shared.inner.lock();
        loop {
            if matches!(inner.replies.get(&pf), Some(ReplySlot::Ready(_))) {
                if let Some(ReplySlot::Ready(decoded)) = inner.replies.remove(&pf) {
                    return Ok(decoded);
                }
            }
            if self.shared.stopping.load(Ordering::Acquire) {
                inner.replies.remove(&pf);
                return Err(SessionError::NotConnected);
            }
            if Instant::now() >= deadline {
                inner.replies.remove(&pf);
                return Err(SessionError::CommandTimeout(pf));
            }
            let _ = self.shared.reply_cv.wait_until(&mut inner, deadline);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn expect_ack(pf: u8, reply: &Decoded) -> Result<(), SessionError> {
    match reply {
        Decoded::SetReply {
            acknowledged: true, ..
        } => Ok(()),
        Decoded::SetReply {
            acknowledged: false,
            ..
        } => Err(SessionError::CommandRejected(format!(
            "PCS did not acknowledge PF={pf:#04X}"
        ))),
        other => Err(SessionError::CommandRejected(format!(
            "unexpected reply {other:?}"
        ))),
    }
}

// ============================================================================
// Receive pump
// ============================================================================

fn receive_pump(shared: &Shared, adapter: &dyn BusAdapter, cfg: &SessionConfig) {
    log::debug!("[SESSION] receive pump started");
    while !shared.stopping.load(Ordering::Acquire) {
        match adapter.recv(RECV_DEADLINE) {
            Ok(Some(frame)) => handle_frame(shared, cfg, &frame),
            Ok(None) => {}
            Err(BusError::Closed) => break,
            Err(BusError::BusOff) => {
                if record_bus_off(shared) {
                    shared.set_state(SessionState::Faulted);
                }
                log::warn!("[SESSION] bus off; reconnecting");
                if matches!(adapter.reconnect(), Err(BusError::Closed)) {
                    break;
                }
            }
            Err(err) => {
                log::debug!("[SESSION] receive error: {err}");
            }
        }
        check_rx_silence(shared, cfg);
    }
    log::debug!("[SESSION] receive pump stopped");
}

/// Track a bus-off occurrence; true once the limit is hit inside the window.
fn record_bus_off(shared: &Shared) -> bool {
    let mut inner = shared.inner.lock();
    let now = Instant::now();
    inner.bus_off_times.push_back(now);
    while inner
        .bus_off_times
        .front()
        .is_some_and(|&at| now.duration_since(at) > BUS_OFF_WINDOW)
    {
        inner.bus_off_times.pop_front();
    }
    inner.bus_off_times.len() >= BUS_OFF_LIMIT
}

fn check_rx_silence(shared: &Shared, cfg: &SessionConfig) {
    if shared.state() != SessionState::Connected {
        return;
    }
    let silent = {
        let inner = shared.inner.lock();
        inner
            .last_rx
            .is_some_and(|at| at.elapsed() > cfg.rx_timeout)
    };
    if silent {
        log::warn!("[SESSION] no PCS traffic for {:?}", cfg.rx_timeout);
        shared.set_state(SessionState::Degraded);
    }
}

fn handle_frame(shared: &Shared, cfg: &SessionConfig, frame: &BusFrame) {
    let fields = match id::unpack(frame.id) {
        Ok(fields) => fields,
        Err(err) => {
            log::debug!("[SESSION] dropping frame {:#010X}: {err}", frame.id);
            return;
        }
    };
    if !fields.is_from_pcs(cfg.pcs_addr) {
        log::debug!(
            "[SESSION] dropping frame {:#010X}: not PCS -> controller",
            frame.id
        );
        return;
    }
    let decoded = match decode(fields.pf, &frame.data) {
        Ok(decoded) => decoded,
        Err(err) => {
            log::debug!("[SESSION] dropping PF={:#04X} frame: {err}", fields.pf);
            return;
        }
    };

    let subscribers = {
        let mut inner = shared.inner.lock();
        inner.snapshot.apply(&decoded, frame.ts);
        inner.last_rx = Some(frame.ts);

        match shared.state() {
            SessionState::Disconnected | SessionState::Degraded => {
                shared.set_state(SessionState::Connected);
            }
            _ => {}
        }
        if let Decoded::DeviceStatus(status) = &decoded {
            if status.fault == FaultCode::CAN1_COMM_FAULT {
                shared.set_state(SessionState::Faulted);
            }
        }

        if let Some(slot) = inner.replies.get_mut(&fields.pf) {
            if matches!(slot, ReplySlot::Pending) {
                *slot = ReplySlot::Ready(decoded.clone());
                shared.reply_cv.notify_all();
            }
        }
        inner.subscribers.clone()
    };

    // Callbacks run on the pump thread, outside the lock. A misbehaving
    // subscriber must not kill the pump.
    for subscriber in subscribers {
        if catch_unwind(AssertUnwindSafe(|| subscriber(&decoded))).is_err() {
            log::warn!(
                "[SESSION] subscriber panicked on PF={:#04X} frame",
                fields.pf
            );
        }
    }
}

// ============================================================================
// Heartbeat loop
// ============================================================================

fn heartbeat_loop(shared: &Shared, adapter: &dyn BusAdapter, cfg: &SessionConfig) {
    log::debug!("[SESSION] heartbeat loop started");
    let tx_id = CanId {
        priority: cfg.priority,
        pf: PF_HEARTBEAT,
        ps: cfg.pcs_addr,
        sa: CONTROLLER_ADDR,
    }
    .pack();

    // Drift-free schedule: each tick is the previous target plus the
    // period, never "now plus the period".
    let mut next = Instant::now() + cfg.heartbeat_period;
    loop {
        loop {
            if shared.stopping.load(Ordering::Acquire) {
                log::debug!("[SESSION] heartbeat loop stopped");
                return;
            }
            let now = Instant::now();
            if now >= next {
                break;
            }
            thread::sleep((next - now).min(SCHED_SLEEP_SLICE));
        }
        next += cfg.heartbeat_period;
        // Skip ticks missed during a stall instead of bursting.
        let now = Instant::now();
        while next <= now {
            next += cfg.heartbeat_period;
        }

        if shared.heartbeat_paused.load(Ordering::Acquire) {
            continue;
        }

        let payload = {
            let inner = shared.inner.lock();
            match encode_heartbeat(inner.external.as_ref()) {
                Ok(payload) => payload,
                Err(err) => {
                    // Unrepresentable operator data; beat with the
                    // zero-fill pattern rather than starving the PCS.
                    log::warn!("[SESSION] heartbeat mirror data invalid ({err}); sending zero-fill");
                    [0u8; 8]
                }
            }
        };

        match adapter.send(tx_id, &payload) {
            Ok(()) => {
                let mut inner = shared.inner.lock();
                inner.heartbeat_failures = 0;
                inner.last_heartbeat_tx = Some(Instant::now());
            }
            Err(BusError::Closed) => {
                log::debug!("[SESSION] heartbeat loop stopped (adapter closed)");
                return;
            }
            Err(err) => {
                log::warn!("[SESSION] heartbeat send failed: {err}");
                let (failures, starved) = {
                    let mut inner = shared.inner.lock();
                    inner.heartbeat_failures += 1;
                    let starved = inner
                        .last_heartbeat_tx
                        .is_some_and(|at| at.elapsed() > crate::config::HEARTBEAT_STARVATION);
                    (inner.heartbeat_failures, starved)
                };
                if starved {
                    // The PCS has latched 0x800D on its side by now.
                    shared.set_state(SessionState::Faulted);
                } else if failures >= 2 && shared.state() == SessionState::Connected {
                    shared.set_state(SessionState::Degraded);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceKind;

    fn virtual_config(channel: &str) -> SessionConfig {
        SessionConfig {
            channel: channel.into(),
            interface: InterfaceKind::Virtual,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn open_rejects_invalid_config() {
        let cfg = SessionConfig {
            pcs_addr: CONTROLLER_ADDR,
            ..virtual_config("session-invalid")
        };
        assert!(matches!(
            Session::open(cfg),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn starts_disconnected_and_commands_refuse() {
        let session = Session::open(virtual_config("session-idle")).unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(session.enable(), Err(SessionError::NotConnected)));
        assert!(session.dc_electrical().is_none());
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        session.close(); // idempotent
    }

    #[test]
    fn close_is_prompt() {
        let session = Session::open(virtual_config("session-close")).unwrap();
        let start = Instant::now();
        session.close();
        assert!(start.elapsed() < CLOSE_JOIN_DEADLINE);
    }

    #[test]
    fn state_machine_never_leaves_closed() {
        let shared = Shared::new();
        shared.set_state(SessionState::Closed);
        shared.set_state(SessionState::Connected);
        assert_eq!(shared.state(), SessionState::Closed);
    }

    #[test]
    fn bus_off_window_prunes_old_entries() {
        let shared = Shared::new();
        assert!(!record_bus_off(&shared));
        assert!(!record_bus_off(&shared));
        assert!(record_bus_off(&shared));
    }
}
