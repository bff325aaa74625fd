//! Device hotplug watch on /dev/input via inotify
//!
//! The inotify descriptor is non-blocking and is polled alongside the
//! device descriptors, so hotplug never needs its own thread.

use crate::error::DeviceError;
use inotify::{EventMask, Inotify, WatchMask};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// A change in the input namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A node appeared
    Added(PathBuf),
    /// A node disappeared
    Removed(PathBuf),
    /// Node attributes changed (udev fixing up permissions after creation)
    Changed(PathBuf),
    /// The kernel queue overflowed, the namespace must be rescanned
    Rescan,
}

/// inotify watch on the input directory
pub struct HotplugWatch {
    inotify: Inotify,
    dir: PathBuf,
    buffer: Vec<u8>,
}

impl HotplugWatch {
    pub fn new(dir: &Path) -> Result<Self, DeviceError> {
        let inotify = Inotify::init().map_err(DeviceError::Hotplug)?;
        inotify
            .watches()
            .add(dir, WatchMask::CREATE | WatchMask::DELETE | WatchMask::ATTRIB)
            .map_err(DeviceError::Hotplug)?;

        tracing::debug!("Watching {:?} for device hotplug", dir);
        Ok(Self {
            inotify,
            dir: dir.to_path_buf(),
            buffer: vec![0; 4096],
        })
    }

    /// Read every queued notification without blocking
    pub fn drain(&mut self) -> io::Result<Vec<HotplugEvent>> {
        let mut out = Vec::new();
        loop {
            let events = match self.inotify.read_events(&mut self.buffer) {
                Ok(events) => events,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };

            let before = out.len();
            for event in events {
                if event.mask.contains(EventMask::Q_OVERFLOW) {
                    out.push(HotplugEvent::Rescan);
                    continue;
                }
                let Some(name) = event.name else { continue };
                let path = self.dir.join(name);
                if event.mask.contains(EventMask::CREATE) {
                    out.push(HotplugEvent::Added(path));
                } else if event.mask.contains(EventMask::DELETE) {
                    out.push(HotplugEvent::Removed(path));
                } else if event.mask.contains(EventMask::ATTRIB) {
                    out.push(HotplugEvent::Changed(path));
                }
            }
            if out.len() == before {
                break;
            }
        }
        Ok(out)
    }
}

impl AsRawFd for HotplugWatch {
    fn as_raw_fd(&self) -> RawFd {
        self.inotify.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_create_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut watch = HotplugWatch::new(dir.path()).unwrap();
        assert!(watch.drain().unwrap().is_empty());

        let node = dir.path().join("event7");
        std::fs::write(&node, b"").unwrap();
        std::fs::remove_file(&node).unwrap();

        let events = watch.drain().unwrap();
        assert!(events.contains(&HotplugEvent::Added(node.clone())));
        assert!(events.contains(&HotplugEvent::Removed(node)));
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        assert!(matches!(
            HotplugWatch::new(Path::new("/nonexistent/keytally/input")),
            Err(DeviceError::Hotplug(_))
        ));
    }
}
