// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process virtual CAN bus.
//!
//! A named hub fans every sent frame out to all other attached endpoints,
//! applying each endpoint's (PF, PS) filters in software. Hubs live in a
//! process-global registry keyed by channel name so a session and a
//! simulator attach to the same bus by configuration alone.

use crate::transport::{passes_filters, BusAdapter, BusConfig, BusError, BusFrame};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Hub>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<Hub>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Names of all virtual buses created in this process.
#[must_use]
pub fn list_buses() -> Vec<String> {
    let mut names: Vec<String> = registry().lock().keys().cloned().collect();
    names.sort();
    names
}

struct Peer {
    id: usize,
    tx: Sender<BusFrame>,
    filters: Vec<(u8, u8)>,
}

struct Hub {
    peers: Mutex<Vec<Peer>>,
    next_id: AtomicUsize,
}

impl Hub {
    fn broadcast(&self, from: usize, id: u32, payload: &[u8]) {
        let pf = ((id >> 16) & 0xFF) as u8;
        let ps = ((id >> 8) & 0xFF) as u8;
        let frame = BusFrame {
            id,
            data: payload.to_vec(),
            ts: Instant::now(),
        };
        for peer in self.peers.lock().iter() {
            if peer.id != from && passes_filters(&peer.filters, pf, ps) {
                // Receiver disappearing mid-send is a peer closing; fine.
                let _ = peer.tx.send(frame.clone());
            }
        }
    }

    fn detach(&self, id: usize) {
        self.peers.lock().retain(|peer| peer.id != id);
    }
}

/// Handle to a named in-process bus.
#[derive(Clone)]
pub struct VirtualBus {
    hub: Arc<Hub>,
}

impl VirtualBus {
    /// Get or create the bus with this name.
    #[must_use]
    pub fn named(name: &str) -> Self {
        let hub = registry()
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(Hub {
                    peers: Mutex::new(Vec::new()),
                    next_id: AtomicUsize::new(0),
                })
            })
            .clone();
        Self { hub }
    }

    /// Attach an endpoint with the config's initial filters.
    pub fn open(&self, config: &BusConfig) -> Result<Box<dyn BusAdapter>, BusError> {
        Ok(Box::new(self.attach(config.filters.clone())))
    }

    /// Attach an endpoint directly (simulator side).
    #[must_use]
    pub fn attach(&self, filters: Vec<(u8, u8)>) -> VirtualBusAdapter {
        let (tx, rx) = unbounded();
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        self.hub.peers.lock().push(Peer { id, tx, filters });
        log::debug!("[BUS] virtual endpoint {id} attached");
        VirtualBusAdapter {
            hub: Arc::clone(&self.hub),
            id,
            rx,
            closed: AtomicBool::new(false),
        }
    }
}

/// One endpoint of a virtual bus.
pub struct VirtualBusAdapter {
    hub: Arc<Hub>,
    id: usize,
    rx: Receiver<BusFrame>,
    closed: AtomicBool,
}

impl BusAdapter for VirtualBusAdapter {
    fn send(&self, id: u32, payload: &[u8]) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        self.hub.broadcast(self.id, id, payload);
        Ok(())
    }

    fn recv(&self, deadline: Duration) -> Result<Option<BusFrame>, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        match self.rx.recv_timeout(deadline) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BusError::Closed),
        }
    }

    fn reconnect(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        // The in-process hub never drops; nothing to re-establish.
        Ok(())
    }

    fn install_filters(&self, filters: &[(u8, u8)]) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let mut peers = self.hub.peers.lock();
        if let Some(peer) = peers.iter_mut().find(|peer| peer.id == self.id) {
            peer.filters = filters.to_vec();
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Dropping our hub entry drops the sender; a blocked recv then
            // observes Disconnected and surfaces Closed.
            self.hub.detach(self.id);
            log::debug!("[BUS] virtual endpoint {} closed", self.id);
        }
    }
}

impl Drop for VirtualBusAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceKind;

    fn config(name: &str, filters: Vec<(u8, u8)>) -> BusConfig {
        BusConfig {
            channel: name.into(),
            bitrate: 250_000,
            interface: InterfaceKind::Virtual,
            filters,
            reconnect_backoff_cap: Duration::from_secs(5),
        }
    }

    #[test]
    fn frames_reach_other_endpoints_not_sender() {
        let bus = VirtualBus::named("vbus-basic");
        let a = bus.attach(Vec::new());
        let b = bus.attach(Vec::new());

        a.send(0x1811_B4FA, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let frame = b.recv(Duration::from_millis(200)).unwrap().expect("frame");
        assert_eq!(frame.id, 0x1811_B4FA);
        assert_eq!(frame.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        // no loopback to the sender
        assert!(a.recv(Duration::from_millis(50)).unwrap().is_none());
    }

    #[test]
    fn software_filters_drop_unmatched_frames() {
        let bus = VirtualBus::named("vbus-filters");
        let a = bus.attach(Vec::new());
        let b = bus.attach(vec![(0x13, 0xB4)]);

        a.send(0x1811_B4FA, &[0; 8]).unwrap(); // PF=0x11 filtered out
        a.send(0x1813_B4FA, &[0; 8]).unwrap(); // PF=0x13 passes
        let frame = b.recv(Duration::from_millis(200)).unwrap().expect("frame");
        assert_eq!((frame.id >> 16) & 0xFF, 0x13);
        assert!(b.recv(Duration::from_millis(50)).unwrap().is_none());

        // replacing filters applies to subsequent traffic
        b.install_filters(&[(0x11, 0xB4)]).unwrap();
        a.send(0x1811_B4FA, &[0; 8]).unwrap();
        assert!(b.recv(Duration::from_millis(200)).unwrap().is_some());
    }

    #[test]
    fn recv_deadline_returns_none_without_raising() {
        let bus = VirtualBus::named("vbus-deadline");
        let a = bus.attach(Vec::new());
        let start = Instant::now();
        assert!(a.recv(Duration::from_millis(80)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn close_unblocks_pending_recv_with_closed() {
        let bus = VirtualBus::named("vbus-close");
        let a = Arc::new(bus.attach(Vec::new()));
        let a2 = Arc::clone(&a);
        let waiter = std::thread::spawn(move || a2.recv(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(50));
        a.close();
        assert!(matches!(waiter.join().unwrap(), Err(BusError::Closed)));
        // and stays closed
        assert!(matches!(a.send(0, &[]), Err(BusError::Closed)));
        a.close(); // idempotent
    }

    #[test]
    fn open_via_factory_registers_bus() {
        let adapter = crate::transport::open(&config("vbus-factory", Vec::new())).unwrap();
        assert!(list_buses().contains(&"vbus-factory".to_owned()));
        adapter.close();
    }
}
