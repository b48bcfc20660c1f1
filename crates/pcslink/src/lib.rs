// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # pcslink - host-side control client for YSTECH PCS modules
//!
//! Drives bidirectional AC/DC Power Conversion System modules (30-120 kW)
//! over a CAN 2.0B bus carrying a J1939-derived application protocol at
//! 250 kbit/s: discover the module, read its continuous telemetry, command
//! working modes, start/stop, clear faults.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pcslink::{Session, SessionConfig, InterfaceKind, WorkingMode};
//!
//! fn main() -> Result<(), pcslink::SessionError> {
//!     let session = Session::open(SessionConfig {
//!         channel: "can0".into(),
//!         interface: InterfaceKind::Hardware,
//!         ..SessionConfig::default()
//!     })?;
//!
//!     session.set_mode(&WorkingMode::DcConstantVoltage { voltage: 400.0 })?;
//!     session.enable()?;
//!
//!     if let Some(dc) = session.dc_precise() {
//!         println!("DC bus: {:.3} V / {:.3} A", dc.value.voltage, dc.value.current);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     Operator / front-ends                    |
//! |        commands | snapshot readings | subscriptions          |
//! +--------------------------------------------------------------+
//! |                        Session layer                         |
//! |   state machine | receive pump | 200 ms heartbeat | replies  |
//! +--------------------------------------------------------------+
//! |                       Protocol layer                         |
//! |   29-bit identifier codec | frame codecs | decoder table     |
//! +--------------------------------------------------------------+
//! |                       Transport layer                        |
//! |        SocketCAN (hardware) | virtual bus (in-process)       |
//! +--------------------------------------------------------------+
//! ```
//!
//! The heartbeat (PF=0x1A) must keep flowing at 200 ms: the PCS latches
//! fault 0x800D (CAN1 communication fault) and shuts down after 5 s of
//! silence. The session runs it on a dedicated thread with a drift-free
//! monotonic schedule, independent of operator calls.
//!
//! ## Modules Overview
//!
//! - [`session`] - session controller and device snapshot (start here)
//! - [`protocol`] - identifier and frame codecs
//! - [`transport`] - bus adapters (SocketCAN, virtual)
//! - [`sim`] - loopback PCS simulator
//! - [`config`] - protocol constants and session configuration

/// Protocol constants and session configuration.
pub mod config;
/// Identifier and frame codecs.
pub mod protocol;
/// Session controller, snapshot, command surface.
pub mod session;
/// Loopback PCS simulator.
pub mod sim;
/// Bus adapters and the adapter contract.
pub mod transport;

pub use config::{InterfaceKind, SessionConfig};
pub use protocol::command::{ExternalData, FirmwareVersion, ProtectionParams, WorkingMode};
pub use protocol::telemetry::{FaultCode, RunningState};
pub use protocol::{Decoded, ProtocolError};
pub use session::{DeviceSnapshot, Reading, Session, SessionError, SessionState};
pub use sim::{PcsSimulator, SimulatorConfig};
pub use transport::{BusAdapter, BusConfig, BusError, BusFrame};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
