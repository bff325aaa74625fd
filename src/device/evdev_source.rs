//! evdev-backed key source
//!
//! Devices are switched to non-blocking mode right after opening so a read
//! on one keyboard can never stall the poll loop.

use super::{DeviceOpener, KeySource};
use crate::event::RawReport;
use evdev::{Device, InputEventKind, Key};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

/// Upper bound on reads per wakeup, keeps one chatty device from starving
/// the others
const MAX_READS_PER_WAKEUP: usize = 64;

/// A keyboard opened through evdev
pub struct EvdevSource {
    device: Device,
    name: String,
}

impl EvdevSource {
    /// Open a device node in non-blocking mode
    pub fn open(path: &Path) -> io::Result<Self> {
        let device = Device::open(path)?;
        set_nonblocking(device.as_raw_fd())?;
        let name = device.name().unwrap_or("unknown").to_string();
        tracing::trace!("Opened device (non-blocking): {:?} ({})", path, name);
        Ok(Self { device, name })
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd is owned by a live evdev::Device for the whole call
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl AsRawFd for EvdevSource {
    fn as_raw_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }
}

impl KeySource for EvdevSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_keys(&self) -> bool {
        // A keyboard should have at least some letter keys; this keeps out
        // power buttons, lid switches and mice with a few BTN_* codes
        self.device
            .supported_keys()
            .map(|keys| {
                keys.contains(Key::KEY_A) && keys.contains(Key::KEY_Z) && keys.contains(Key::KEY_ENTER)
            })
            .unwrap_or(false)
    }

    fn grab(&mut self) -> io::Result<()> {
        self.device.grab()
    }

    fn ungrab(&mut self) -> io::Result<()> {
        self.device.ungrab()
    }

    fn read_reports(&mut self, out: &mut Vec<RawReport>) -> io::Result<()> {
        for _ in 0..MAX_READS_PER_WAKEUP {
            match self.device.fetch_events() {
                Ok(events) => {
                    for event in events {
                        if let InputEventKind::Key(key) = event.kind() {
                            out.push(RawReport {
                                code: key.code(),
                                value: event.value(),
                            });
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Opens `/dev/input/event*` nodes through evdev
#[derive(Debug, Default, Clone, Copy)]
pub struct EvdevOpener;

impl DeviceOpener for EvdevOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn KeySource>> {
        Ok(Box::new(EvdevSource::open(path)?))
    }
}

/// Symbolic name for a key code, e.g. `KEY_A` for 30
pub fn key_name(code: u16) -> String {
    format!("{:?}", Key::new(code))
}
