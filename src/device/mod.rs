//! Input device layer
//!
//! Uses the Linux evdev interface to read key events at the kernel level,
//! below the display server, so it works the same under any compositor or
//! on a bare console.
//!
//! The user must be in the 'input' group to access /dev/input/* devices.
//!
//! [`KeySource`] is the seam between the registry/poll loop and the kernel:
//! the daemon uses [`evdev_source::EvdevSource`], tests plug in sources
//! backed by socket pairs.

pub mod evdev_source;
pub mod hotplug;
pub mod registry;

use crate::event::RawReport;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

pub use evdev_source::EvdevOpener;
pub use hotplug::{HotplugEvent, HotplugWatch};
pub use registry::{Device, DeviceRegistry};

/// Default input device namespace
pub const INPUT_DIR: &str = "/dev/input";

/// An open, pollable source of raw key reports
pub trait KeySource: AsRawFd + Send {
    /// Human-readable device name
    fn name(&self) -> &str;

    /// Whether the capability bitmap advertises keyboard keys
    fn has_keys(&self) -> bool;

    /// Request exclusive access
    fn grab(&mut self) -> io::Result<()>;

    /// Release exclusive access
    fn ungrab(&mut self) -> io::Result<()>;

    /// Append every pending key report to `out` without blocking.
    ///
    /// An error means the device can no longer be read (usually unplugged).
    fn read_reports(&mut self, out: &mut Vec<RawReport>) -> io::Result<()>;
}

/// Opens device nodes into [`KeySource`]s
///
/// Shared between successive registries when the capture loop restarts.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn KeySource>>;
}

/// Whether a path names an evdev event node (`event*`)
pub fn is_event_node(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("event"))
        .unwrap_or(false)
}
