// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SocketCAN backend (Linux, AF_CAN raw sockets).
//!
//! Frames carry the extended-frame flag on the wire identifier; the bit
//! rate itself is owned by the link configuration (`ip link set canX type
//! can bitrate 250000`), so the adapter only checks and warns. (PF, PS)
//! acceptance filters are pushed to the kernel as `can_filter` entries.

use crate::transport::{
    retry_transient, BusAdapter, BusConfig, BusError, BusFrame, RECONNECT_BACKOFF_START,
};
use parking_lot::Mutex;
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Kernel filter mask matching the PF and PS fields of an extended id.
const PF_PS_MASK: u32 = libc::CAN_EFF_FLAG | 0x00FF_FF00;

/// SocketCAN bus adapter.
pub struct SocketCanAdapter {
    channel: String,
    /// Current socket fd, -1 while the link is down.
    fd: AtomicI32,
    closed: AtomicBool,
    backoff_cap: Duration,
    filters: Mutex<Vec<(u8, u8)>>,
    /// Last SO_RCVTIMEO applied, in microseconds (0 = never set).
    rcv_timeout_us: AtomicU64,
}

impl SocketCanAdapter {
    /// Open the named CAN interface and install the initial filters.
    pub fn open(config: &BusConfig) -> Result<Box<dyn BusAdapter>, BusError> {
        let fd = open_socket(&config.channel).map_err(BusError::Transient)?;
        let adapter = SocketCanAdapter {
            channel: config.channel.clone(),
            fd: AtomicI32::new(fd),
            closed: AtomicBool::new(false),
            backoff_cap: config.reconnect_backoff_cap,
            filters: Mutex::new(config.filters.clone()),
            rcv_timeout_us: AtomicU64::new(0),
        };
        adapter.apply_filters(fd).map_err(BusError::Transient)?;
        log::info!("[BUS] SocketCAN adapter open on {}", config.channel);
        Ok(Box::new(adapter))
    }

    fn current_fd(&self) -> Result<RawFd, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(BusError::Transient(io::Error::new(
                io::ErrorKind::NotConnected,
                "CAN link is down",
            )));
        }
        Ok(fd)
    }

    fn apply_filters(&self, fd: RawFd) -> io::Result<()> {
        let filters = self.filters.lock();
        if filters.is_empty() {
            return Ok(());
        }
        let entries: Vec<libc::can_filter> = filters
            .iter()
            .map(|&(pf, ps)| libc::can_filter {
                can_id: libc::CAN_EFF_FLAG | (u32::from(pf) << 16) | (u32::from(ps) << 8),
                can_mask: PF_PS_MASK,
            })
            .collect();
        // SAFETY: entries outlives the call and the length is byte-exact.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_FILTER,
                entries.as_ptr().cast(),
                std::mem::size_of_val(entries.as_slice()) as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_recv_timeout(&self, fd: RawFd, deadline: Duration) -> io::Result<()> {
        // SO_RCVTIMEO of zero blocks forever; clamp to 1 ms.
        let micros = deadline.as_micros().max(1_000) as u64;
        if self.rcv_timeout_us.swap(micros, Ordering::Relaxed) == micros {
            return Ok(());
        }
        let tv = libc::timeval {
            tv_sec: (micros / 1_000_000) as libc::time_t,
            tv_usec: (micros % 1_000_000) as libc::suseconds_t,
        };
        // SAFETY: tv is a valid timeval for the duration of the call.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                std::ptr::addr_of!(tv).cast(),
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn send_once(&self, id: u32, payload: &[u8]) -> Result<(), BusError> {
        let fd = self.current_fd()?;
        if payload.len() > 8 {
            return Err(BusError::Transient(io::Error::new(
                io::ErrorKind::InvalidInput,
                "CAN 2.0B payload exceeds 8 bytes",
            )));
        }
        // SAFETY: zeroed can_frame is a valid all-zero frame.
        let mut frame: libc::can_frame = unsafe { std::mem::zeroed() };
        frame.can_id = id | libc::CAN_EFF_FLAG;
        frame.can_dlc = payload.len() as u8;
        frame.data[..payload.len()].copy_from_slice(payload);

        // SAFETY: frame is valid for the size passed.
        let written = unsafe {
            libc::write(
                fd,
                std::ptr::addr_of!(frame).cast(),
                std::mem::size_of::<libc::can_frame>(),
            )
        };
        if written < 0 {
            return Err(map_errno(io::Error::last_os_error()));
        }
        Ok(())
    }
}

fn map_errno(err: io::Error) -> BusError {
    match err.raw_os_error() {
        Some(libc::ENETDOWN | libc::ENODEV | libc::ENXIO) => BusError::BusOff,
        Some(libc::EAGAIN) => BusError::Timeout,
        _ => BusError::Transient(err),
    }
}

fn open_socket(channel: &str) -> io::Result<RawFd> {
    let ifname = CString::new(channel)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in channel name"))?;
    // SAFETY: plain socket(2) call.
    let fd = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW, libc::CAN_RAW) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: ifname is NUL-terminated.
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if ifindex == 0 {
        let err = io::Error::last_os_error();
        // SAFETY: fd came from socket(2) above.
        unsafe { libc::close(fd) };
        return Err(err);
    }
    // SAFETY: zeroed sockaddr_can is valid; family and ifindex set below.
    let mut addr: libc::sockaddr_can = unsafe { std::mem::zeroed() };
    addr.can_family = libc::AF_CAN as libc::sa_family_t;
    addr.can_ifindex = ifindex as libc::c_int;
    // SAFETY: addr is a valid sockaddr_can for the size passed.
    let rc = unsafe {
        libc::bind(
            fd,
            std::ptr::addr_of!(addr).cast(),
            std::mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        // SAFETY: fd came from socket(2) above.
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

impl BusAdapter for SocketCanAdapter {
    fn send(&self, id: u32, payload: &[u8]) -> Result<(), BusError> {
        retry_transient("send", || self.send_once(id, payload))
    }

    fn recv(&self, deadline: Duration) -> Result<Option<BusFrame>, BusError> {
        let fd = self.current_fd()?;
        self.set_recv_timeout(fd, deadline)
            .map_err(BusError::Transient)?;

        // SAFETY: zeroed can_frame is a valid read target.
        let mut frame: libc::can_frame = unsafe { std::mem::zeroed() };
        // SAFETY: frame is valid for the size passed.
        let read = unsafe {
            libc::read(
                fd,
                std::ptr::addr_of_mut!(frame).cast(),
                std::mem::size_of::<libc::can_frame>(),
            )
        };
        let ts = Instant::now();
        if read < 0 {
            let err = io::Error::last_os_error();
            if self.closed.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }
            return match err.raw_os_error() {
                Some(libc::EAGAIN | libc::EINTR) => Ok(None),
                _ => Err(map_errno(err)),
            };
        }
        if frame.can_id & libc::CAN_EFF_FLAG == 0 {
            // Classic 11-bit frame: not part of this protocol.
            log::debug!("[BUS] dropping standard-id frame {:#05X}", frame.can_id);
            return Ok(None);
        }
        let len = usize::from(frame.can_dlc.min(8));
        Ok(Some(BusFrame {
            id: frame.can_id & libc::CAN_EFF_MASK,
            data: frame.data[..len].to_vec(),
            ts,
        }))
    }

    fn reconnect(&self) -> Result<(), BusError> {
        let mut backoff = RECONNECT_BACKOFF_START;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }
            match open_socket(&self.channel) {
                Ok(fd) => {
                    if let Err(err) = self.apply_filters(fd) {
                        // SAFETY: fd came from open_socket above.
                        unsafe { libc::close(fd) };
                        log::debug!("[BUS] filter install failed during reconnect: {err}");
                    } else {
                        self.rcv_timeout_us.store(0, Ordering::Relaxed);
                        let old = self.fd.swap(fd, Ordering::AcqRel);
                        if old >= 0 {
                            // SAFETY: old fd belonged to this adapter.
                            unsafe { libc::close(old) };
                        }
                        log::info!("[BUS] reconnected to {}", self.channel);
                        return Ok(());
                    }
                }
                Err(err) => {
                    log::debug!(
                        "[BUS] reconnect to {} failed ({err}), next attempt in {:?}",
                        self.channel,
                        backoff
                    );
                }
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(self.backoff_cap);
        }
    }

    fn install_filters(&self, filters: &[(u8, u8)]) -> Result<(), BusError> {
        *self.filters.lock() = filters.to_vec();
        let fd = self.current_fd()?;
        self.apply_filters(fd).map_err(BusError::Transient)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let fd = self.fd.swap(-1, Ordering::AcqRel);
            if fd >= 0 {
                // SAFETY: fd belonged to this adapter; closing unblocks reads.
                unsafe { libc::close(fd) };
            }
            log::info!("[BUS] SocketCAN adapter on {} closed", self.channel);
        }
    }
}

impl Drop for SocketCanAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

/// CAN network interfaces visible in sysfs. Never fails.
#[must_use]
pub fn list_interfaces() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| {
            name.starts_with("can") || name.starts_with("vcan") || name.starts_with("slcan")
        })
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert!(matches!(
            map_errno(io::Error::from_raw_os_error(libc::ENETDOWN)),
            BusError::BusOff
        ));
        assert!(matches!(
            map_errno(io::Error::from_raw_os_error(libc::EAGAIN)),
            BusError::Timeout
        ));
        assert!(matches!(
            map_errno(io::Error::from_raw_os_error(libc::EIO)),
            BusError::Transient(_)
        ));
    }

    #[test]
    fn list_interfaces_never_panics() {
        // Content depends on the host; the call itself must not fail.
        let _ = list_interfaces();
    }

    #[test]
    fn missing_interface_fails_open() {
        let config = BusConfig {
            channel: "can-does-not-exist".into(),
            bitrate: 250_000,
            interface: crate::config::InterfaceKind::Hardware,
            filters: Vec::new(),
            reconnect_backoff_cap: Duration::from_secs(5),
        };
        assert!(SocketCanAdapter::open(&config).is_err());
    }
}
