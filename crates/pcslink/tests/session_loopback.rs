// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::cast_precision_loss)] // Stats/metrics need this
#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::float_cmp)] // Test assertions with constants
#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::items_after_statements)] // Test helpers

//! End-to-end scenarios against the loopback PCS simulator.
//!
//! Every test runs its own named virtual bus, so the scenarios are
//! independent and can run in parallel.

use pcslink::sim::{PcsSimulator, SimulatorConfig};
use pcslink::transport::vbus::VirtualBus;
use pcslink::transport::BusAdapter;
use pcslink::{
    FaultCode, InterfaceKind, RunningState, Session, SessionConfig, SessionError, SessionState,
    WorkingMode,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

fn session_config(channel: &str) -> SessionConfig {
    SessionConfig {
        channel: channel.into(),
        interface: InterfaceKind::Virtual,
        ..SessionConfig::default()
    }
}

/// Poll until `predicate` holds, panicking after `timeout`.
fn wait_until(what: &str, timeout: Duration, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

fn wait_connected(session: &Session) {
    wait_until("session to connect", Duration::from_secs(3), || {
        session.state() == SessionState::Connected
            && session.device_status().is_some()
            && session.control_state().is_some()
    });
}

#[test]
fn enable_path_acknowledges_then_runs() {
    let bus = VirtualBus::named("it-enable");
    let _sim = PcsSimulator::start(&bus, SimulatorConfig::default()).unwrap();
    let session = Session::open(session_config("it-enable")).unwrap();
    wait_connected(&session);

    let start = Instant::now();
    session.enable().expect("enable should be acknowledged");
    assert!(start.elapsed() < Duration::from_secs(3));

    // Running within a tick or two of the acknowledgement.
    wait_until("running state", Duration::from_millis(600), || {
        session
            .device_status()
            .is_some_and(|status| status.value.state == RunningState::Running)
    });

    session.disable().expect("disable should be acknowledged");
    wait_until("stopped state", Duration::from_millis(600), || {
        session
            .device_status()
            .is_some_and(|status| status.value.state == RunningState::Stopped)
    });
}

#[test]
fn heartbeat_cadence_is_drift_free() {
    let bus = VirtualBus::named("it-cadence");
    let spy = bus.attach(vec![(0x1A, 0xFA)]);
    let session = Session::open(session_config("it-cadence")).unwrap();

    let mut arrivals = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if let Ok(Some(frame)) = spy.recv(Duration::from_millis(300)) {
            arrivals.push(frame.ts);
        }
    }
    session.close();

    assert!(arrivals.len() >= 12, "only {} heartbeats seen", arrivals.len());
    let gaps: Vec<Duration> = arrivals.windows(2).map(|w| w[1] - w[0]).collect();
    let max_gap = gaps.iter().max().unwrap();
    assert!(
        *max_gap <= Duration::from_millis(300),
        "max heartbeat gap {max_gap:?} exceeds budget"
    );
    let mean_ms =
        gaps.iter().map(|g| g.as_secs_f64() * 1000.0).sum::<f64>() / gaps.len() as f64;
    assert!(
        (mean_ms - 200.0).abs() < 15.0,
        "mean heartbeat period {mean_ms:.1} ms drifted from 200 ms"
    );
}

#[test]
fn no_can1_fault_during_normal_operation() {
    let bus = VirtualBus::named("it-soak");
    let sim = PcsSimulator::start(
        &bus,
        SimulatorConfig {
            heartbeat_timeout: Duration::from_millis(800),
            ..SimulatorConfig::default()
        },
    )
    .unwrap();
    let session = Session::open(session_config("it-soak")).unwrap();
    wait_connected(&session);

    // Several starvation windows long: the heartbeat must keep the sim happy.
    std::thread::sleep(Duration::from_millis(2500));
    assert_eq!(sim.fault(), FaultCode::NONE);
    let status = session.device_status().expect("status present");
    assert_eq!(status.value.fault, FaultCode::NONE);
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn heartbeat_starvation_latches_can1_fault() {
    let bus = VirtualBus::named("it-starve");
    let _sim = PcsSimulator::start(
        &bus,
        SimulatorConfig {
            tick_period: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(600),
            ..SimulatorConfig::default()
        },
    )
    .unwrap();
    let session = Session::open(session_config("it-starve")).unwrap();
    wait_connected(&session);

    session.pause_heartbeat();
    wait_until("CAN1 fault to latch", Duration::from_secs(3), || {
        session
            .device_status()
            .is_some_and(|status| status.value.fault == FaultCode::CAN1_COMM_FAULT)
    });
    assert_eq!(session.state(), SessionState::Faulted);

    // Recovery: feed heartbeats again, then clear the fault.
    session.resume_heartbeat();
    session.reset_faults().expect("fault clear acknowledged");
    wait_until("fault to clear", Duration::from_secs(2), || {
        session
            .device_status()
            .is_some_and(|status| status.value.fault == FaultCode::NONE)
    });
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn mode_change_while_running_is_refused_without_traffic() {
    let bus = VirtualBus::named("it-mode-guard");
    let spy = bus.attach(vec![(0x0B, 0xFA)]);
    let _sim = PcsSimulator::start(&bus, SimulatorConfig::default()).unwrap();
    let session = Session::open(session_config("it-mode-guard")).unwrap();
    wait_connected(&session);

    session.enable().unwrap();
    wait_until("running state", Duration::from_secs(1), || {
        session
            .device_status()
            .is_some_and(|status| status.value.state == RunningState::Running)
    });

    let result = session.set_mode(&WorkingMode::DcConstantVoltage { voltage: 400.0 });
    assert!(matches!(result, Err(SessionError::ModeChangeWhileRunning)));

    // No 0x0B frame may have left the controller.
    assert!(
        spy.recv(Duration::from_millis(200)).unwrap().is_none(),
        "a set-mode frame was emitted despite the running guard"
    );
}

#[test]
fn set_mode_while_stopped_reaches_the_simulator() {
    let bus = VirtualBus::named("it-mode-apply");
    let sim = PcsSimulator::start(&bus, SimulatorConfig::default()).unwrap();
    let session = Session::open(session_config("it-mode-apply")).unwrap();
    wait_connected(&session);

    let mode = WorkingMode::DcCcCv {
        voltage: 436.0,
        current: -100.0,
        end_current: 5.0,
    };
    session.set_mode(&mode).expect("mode change while stopped");
    assert_eq!(sim.mode(), mode);
}

#[test]
fn one_request_in_flight_per_pf() {
    let bus = VirtualBus::named("it-busy");
    let _sim = PcsSimulator::start(&bus, SimulatorConfig::default()).unwrap();
    let session = Arc::new(Session::open(session_config("it-busy")).unwrap());
    wait_connected(&session);

    let barrier = Arc::new(Barrier::new(2));
    let ok = Arc::new(AtomicUsize::new(0));
    let busy = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let session = Arc::clone(&session);
        let barrier = Arc::clone(&barrier);
        let ok = Arc::clone(&ok);
        let busy = Arc::clone(&busy);
        handles.push(std::thread::spawn(move || {
            barrier.wait();
            match session.enable() {
                Ok(()) => ok.fetch_add(1, Ordering::Relaxed),
                Err(SessionError::Busy(0x0F)) => busy.fetch_add(1, Ordering::Relaxed),
                Err(err) => panic!("unexpected enable error: {err}"),
            };
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(ok.load(Ordering::Relaxed), 1, "exactly one enable succeeds");
    assert_eq!(busy.load(Ordering::Relaxed), 1, "the other observes Busy");
}

#[test]
fn snapshot_freshness_expires_when_telemetry_pauses() {
    let bus = VirtualBus::named("it-fresh");
    let sim = PcsSimulator::start(&bus, SimulatorConfig::default()).unwrap();
    let session = Session::open(session_config("it-fresh")).unwrap();
    wait_connected(&session);
    wait_until("dc telemetry", Duration::from_secs(1), || {
        session.dc_electrical().is_some()
    });

    sim.pause_telemetry(0x11);
    std::thread::sleep(Duration::from_millis(1500));

    let reading = session.dc_electrical().expect("last value stays readable");
    assert!(!reading.fresh, "1.5 s old reading still marked fresh");
    // Other families keep flowing and stay fresh.
    assert!(session.device_status().expect("status").fresh);

    sim.resume_telemetry(0x11);
    wait_until("freshness to recover", Duration::from_secs(1), || {
        session.dc_electrical().is_some_and(|r| r.fresh)
    });
}

#[test]
fn queries_decode_simulator_replies() {
    let bus = VirtualBus::named("it-query");
    let _sim = PcsSimulator::start(&bus, SimulatorConfig::default()).unwrap();
    let session = Session::open(session_config("it-query")).unwrap();
    wait_connected(&session);

    let version = session.read_firmware_version().unwrap();
    assert_eq!(version.software, (2, 14));
    assert_eq!(version.protocol, 0x0102);

    let limits = session.read_protection_params().unwrap();
    assert_eq!(limits.max_dc_voltage, 1000.0);
    assert_eq!(limits.max_power, 120.0);
}

#[test]
fn subscriber_panic_does_not_kill_the_pump() {
    let bus = VirtualBus::named("it-subscriber");
    let _sim = PcsSimulator::start(&bus, SimulatorConfig::default()).unwrap();
    let session = Session::open(session_config("it-subscriber")).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    {
        let seen = Arc::clone(&seen);
        session.subscribe(move |decoded| {
            seen.fetch_add(1, Ordering::Relaxed);
            if decoded.pf() == 0x13 {
                panic!("deliberately misbehaving subscriber");
            }
        });
    }
    wait_connected(&session);

    let before = seen.load(Ordering::Relaxed);
    wait_until("pump to keep delivering", Duration::from_secs(2), || {
        seen.load(Ordering::Relaxed) > before + 8
    });
    // The panicking subscriber never took the session down.
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn sign_convention_survives_the_loopback() {
    let bus = VirtualBus::named("it-sign");
    let sim = PcsSimulator::start(&bus, SimulatorConfig::default()).unwrap();
    let session = Session::open(session_config("it-sign")).unwrap();
    wait_connected(&session);

    // Command a charging setpoint and enable; the simulator's telemetry
    // must come back negative (charging).
    session
        .set_mode(&WorkingMode::DcConstantCurrent { current: -50.0 })
        .unwrap();
    assert_eq!(
        sim.mode(),
        WorkingMode::DcConstantCurrent { current: -50.0 }
    );
    session.enable().unwrap();
    wait_until("charging current", Duration::from_secs(2), || {
        session
            .dc_precise()
            .is_some_and(|dc| dc.fresh && dc.value.current < -49.0 && dc.value.current < 0.0)
    });
}
