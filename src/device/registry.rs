//! Device registry
//!
//! Owns every open keyboard. The registry is the only place devices are
//! opened, grabbed, and closed; the poll loop borrows it to get the set of
//! descriptors to wait on and to read from the ones that became ready.

use super::{is_event_node, DeviceOpener, HotplugEvent, KeySource};
use crate::config::DeviceConfig;
use crate::error::DeviceError;
use crate::event::{DeviceId, KeyEvent, RawReport, RepeatFilter};
use crate::status::DaemonStatus;
use std::collections::HashSet;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// A registered keyboard
pub struct Device {
    id: DeviceId,
    path: PathBuf,
    source: Box<dyn KeySource>,
    grabbed: bool,
    filter: RepeatFilter,
    scratch: Vec<RawReport>,
}

impl Device {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn is_grabbed(&self) -> bool {
        self.grabbed
    }

    /// Read pending reports and append normalized events to `out`
    fn read_events(&mut self, out: &mut Vec<KeyEvent>) -> io::Result<()> {
        self.scratch.clear();
        let result = self.source.read_reports(&mut self.scratch);

        // Reports read before an error are still delivered
        let now = Instant::now();
        for report in self.scratch.drain(..) {
            if let Some(event) = self.filter.normalize(self.id, report, now) {
                out.push(event);
            }
        }
        result
    }

    fn release(&mut self) {
        if self.grabbed {
            if let Err(e) = self.source.ungrab() {
                tracing::trace!("Ungrab of {:?} failed: {}", self.path, e);
            }
            self.grabbed = false;
        }
    }
}

/// The authoritative set of open keyboards
pub struct DeviceRegistry {
    input_dir: PathBuf,
    config: DeviceConfig,
    opener: Arc<dyn DeviceOpener>,
    devices: Vec<Device>,
    next_id: DeviceId,
    /// Nodes that refused us on open; retried when their attributes change
    denied: HashSet<PathBuf>,
    status: Arc<DaemonStatus>,
}

impl DeviceRegistry {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        config: DeviceConfig,
        opener: Arc<dyn DeviceOpener>,
        status: Arc<DaemonStatus>,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            config,
            opener,
            devices: Vec::new(),
            next_id: 1,
            denied: HashSet::new(),
            status,
        }
    }

    /// Scan the input directory and register every matching keyboard.
    ///
    /// Returns the number of newly registered devices. Individual device
    /// failures are logged and skipped; only an unreadable directory is an
    /// error.
    pub fn discover(&mut self) -> Result<usize, DeviceError> {
        let entries = std::fs::read_dir(&self.input_dir)
            .map_err(|e| DeviceError::Namespace(self.input_dir.clone(), e))?;

        let mut nodes: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_event_node(path))
            .collect();
        nodes.sort();

        let mut added = 0;
        let mut denied = 0;
        for path in nodes {
            if self.contains(&path) {
                continue;
            }
            match self.on_added(&path) {
                Ok(_) => added += 1,
                Err(DeviceError::PermissionDenied(path)) => {
                    denied += 1;
                    tracing::warn!("Permission denied opening {:?}, skipping", path);
                }
                Err(e) => tracing::trace!("Skipping {:?}: {}", path, e),
            }
        }

        if self.devices.is_empty() {
            if denied > 0 {
                tracing::warn!("{}", DeviceError::PermissionDenied(self.input_dir.clone()));
            } else {
                tracing::warn!(
                    "No keyboard found in {:?}, waiting for hotplug",
                    self.input_dir
                );
            }
        } else {
            tracing::debug!(
                "Found {} keyboard device(s): {:?}",
                self.devices.len(),
                self.paths()
            );
        }

        Ok(added)
    }

    /// Open and register one device node.
    ///
    /// Registering a path that is already registered returns its id.
    pub fn on_added(&mut self, path: &Path) -> Result<DeviceId, DeviceError> {
        if let Some(device) = self.devices.iter().find(|d| d.path == path) {
            return Ok(device.id);
        }
        if !self.config.allows_path(path) {
            return Err(DeviceError::Filtered(path.to_path_buf()));
        }

        let mut source = match self.opener.open(path) {
            Ok(source) => source,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                self.denied.insert(path.to_path_buf());
                return Err(DeviceError::PermissionDenied(path.to_path_buf()));
            }
            Err(e) => return Err(DeviceError::Open(path.to_path_buf(), e)),
        };
        self.denied.remove(path);

        if !source.has_keys() {
            return Err(DeviceError::NotAKeyboard(path.to_path_buf()));
        }
        if !self.config.allows_name(source.name()) {
            return Err(DeviceError::Filtered(path.to_path_buf()));
        }

        let grabbed = if self.config.grab {
            match source.grab() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        "Could not grab {:?} ({}), reading without exclusive access",
                        path,
                        e
                    );
                    false
                }
            }
        } else {
            false
        };

        let id = self.next_id;
        self.next_id += 1;

        tracing::info!(
            "Keyboard added: {:?} ({}){}",
            path,
            source.name(),
            if grabbed { " [grabbed]" } else { "" }
        );

        self.devices.push(Device {
            id,
            path: path.to_path_buf(),
            source,
            grabbed,
            filter: RepeatFilter::new(),
            scratch: Vec::new(),
        });
        self.publish();
        Ok(id)
    }

    /// Close and deregister the device at `path`
    pub fn on_removed(&mut self, path: &Path) -> bool {
        self.denied.remove(path);
        match self.devices.iter().position(|d| d.path == path) {
            Some(index) => {
                self.close_at(index);
                true
            }
            None => false,
        }
    }

    /// Close and deregister a device by id
    pub fn remove(&mut self, id: DeviceId) -> bool {
        match self.devices.iter().position(|d| d.id == id) {
            Some(index) => {
                self.close_at(index);
                true
            }
            None => false,
        }
    }

    fn close_at(&mut self, index: usize) {
        let mut device = self.devices.remove(index);
        device.release();
        tracing::info!("Keyboard removed: {:?} ({})", device.path, device.name());
        drop(device);
        self.publish();
    }

    /// Apply a hotplug notification
    pub fn apply(&mut self, event: &HotplugEvent) {
        match event {
            HotplugEvent::Added(path) if is_event_node(path) => self.try_add(path),
            HotplugEvent::Changed(path) if self.denied.contains(path) => self.try_add(path),
            HotplugEvent::Removed(path) => {
                self.on_removed(path);
            }
            HotplugEvent::Rescan => self.rescan(),
            _ => {}
        }
    }

    fn try_add(&mut self, path: &Path) {
        match self.on_added(path) {
            Ok(_) => {}
            // udev usually fixes permissions right after creation; the
            // ATTRIB notification retries
            Err(DeviceError::PermissionDenied(path)) => {
                tracing::debug!("{:?} not readable yet, waiting for permission change", path)
            }
            Err(e) => tracing::trace!("Ignoring {:?}: {}", path, e),
        }
    }

    /// Drop devices whose node vanished and pick up new ones
    pub fn rescan(&mut self) {
        let gone: Vec<PathBuf> = self
            .devices
            .iter()
            .filter(|d| !d.path.exists())
            .map(|d| d.path.clone())
            .collect();
        for path in gone {
            self.on_removed(&path);
        }
        if let Err(e) = self.discover() {
            tracing::warn!("Rescan failed: {}", e);
        }
    }

    /// Read from a ready device. On error the device is removed and `false`
    /// returned; events read before the error are still appended.
    pub fn read(&mut self, id: DeviceId, out: &mut Vec<KeyEvent>) -> bool {
        let Some(device) = self.devices.iter_mut().find(|d| d.id == id) else {
            return false;
        };
        match device.read_events(out) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Read error on {:?}: {}, removing device", device.path, e);
                self.remove(id);
                false
            }
        }
    }

    /// Descriptors to poll, paired with their device ids
    pub fn poll_targets(&self) -> Vec<(DeviceId, RawFd)> {
        self.devices
            .iter()
            .map(|d| (d.id, d.source.as_raw_fd()))
            .collect()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.devices.iter().any(|d| d.path == path)
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.devices.iter().map(|d| d.path.as_path()).collect()
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn grabbed_count(&self) -> usize {
        self.devices.iter().filter(|d| d.grabbed).count()
    }

    /// Release grabs and close every device
    pub fn close_all(&mut self) {
        for device in &mut self.devices {
            device.release();
        }
        let count = self.devices.len();
        self.devices.clear();
        self.publish();
        tracing::debug!("Closed {} device(s)", count);
    }

    fn publish(&self) {
        self.status.set_devices(self.devices.len(), self.grabbed_count());
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        if !self.devices.is_empty() {
            self.close_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;

    /// Fake keyboard whose descriptor is one end of a socket pair
    struct FakeSource {
        sock: UnixStream,
        name: String,
        keys: bool,
        grab_ok: bool,
        grabs: Arc<Mutex<Vec<String>>>,
    }

    impl AsRawFd for FakeSource {
        fn as_raw_fd(&self) -> RawFd {
            self.sock.as_raw_fd()
        }
    }

    impl KeySource for FakeSource {
        fn name(&self) -> &str {
            &self.name
        }
        fn has_keys(&self) -> bool {
            self.keys
        }
        fn grab(&mut self) -> io::Result<()> {
            if self.grab_ok {
                self.grabs.lock().unwrap().push(format!("grab {}", self.name));
                Ok(())
            } else {
                Err(io::Error::from_raw_os_error(libc::EBUSY))
            }
        }
        fn ungrab(&mut self) -> io::Result<()> {
            self.grabs.lock().unwrap().push(format!("ungrab {}", self.name));
            Ok(())
        }
        fn read_reports(&mut self, _out: &mut Vec<RawReport>) -> io::Result<()> {
            Err(io::Error::from_raw_os_error(libc::ENODEV))
        }
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Keyboard,
        Mouse,
        Denied,
        BusyGrab,
    }

    struct FakeOpener {
        nodes: HashMap<PathBuf, Behavior>,
        grabs: Arc<Mutex<Vec<String>>>,
    }

    impl DeviceOpener for FakeOpener {
        fn open(&self, path: &Path) -> io::Result<Box<dyn KeySource>> {
            let behavior = self
                .nodes
                .get(path)
                .copied()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
            if let Behavior::Denied = behavior {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            let (sock, _peer) = UnixStream::pair()?;
            Ok(Box::new(FakeSource {
                sock,
                name: format!("fake {}", path.display()),
                keys: !matches!(behavior, Behavior::Mouse),
                grab_ok: !matches!(behavior, Behavior::BusyGrab),
                grabs: self.grabs.clone(),
            }))
        }
    }

    fn registry(
        dir: &Path,
        nodes: &[(&str, Behavior)],
        config: DeviceConfig,
    ) -> (DeviceRegistry, Arc<DaemonStatus>, Arc<Mutex<Vec<String>>>) {
        let grabs = Arc::new(Mutex::new(Vec::new()));
        let mut map = HashMap::new();
        for (name, behavior) in nodes {
            let path = dir.join(name);
            std::fs::write(&path, b"").unwrap();
            map.insert(path, *behavior);
        }
        let status = Arc::new(DaemonStatus::new());
        let opener = FakeOpener {
            nodes: map,
            grabs: grabs.clone(),
        };
        (
            DeviceRegistry::new(dir, config, Arc::new(opener), status.clone()),
            status,
            grabs,
        )
    }

    #[test]
    fn test_discover_keeps_only_keyboards() {
        let dir = tempfile::tempdir().unwrap();
        let (mut reg, status, _) = registry(
            dir.path(),
            &[
                ("event0", Behavior::Keyboard),
                ("event1", Behavior::Mouse),
                ("event2", Behavior::Denied),
                ("event3", Behavior::Keyboard),
                ("mice", Behavior::Keyboard),
            ],
            DeviceConfig::default(),
        );

        assert_eq!(reg.discover().unwrap(), 2);
        assert_eq!(reg.len(), 2);
        assert!(reg.contains(&dir.path().join("event0")));
        assert!(reg.contains(&dir.path().join("event3")));
        assert_eq!(status.report().devices_open, 2);
        assert_eq!(status.report().devices_grabbed, 0);
    }

    #[test]
    fn test_discover_missing_directory() {
        let status = Arc::new(DaemonStatus::new());
        let opener = FakeOpener {
            nodes: HashMap::new(),
            grabs: Arc::default(),
        };
        let mut reg = DeviceRegistry::new(
            "/nonexistent/keytally",
            DeviceConfig::default(),
            Arc::new(opener),
            status,
        );
        assert!(matches!(reg.discover(), Err(DeviceError::Namespace(..))));
    }

    #[test]
    fn test_allowlist_and_name_hints() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeviceConfig {
            allow: vec![dir.path().join("event1"), dir.path().join("event2")],
            name_hints: vec!["event2".to_string()],
            grab: false,
        };
        let (mut reg, _, _) = registry(
            dir.path(),
            &[
                ("event0", Behavior::Keyboard),
                ("event1", Behavior::Keyboard),
                ("event2", Behavior::Keyboard),
            ],
            config,
        );

        reg.discover().unwrap();
        assert_eq!(reg.paths(), vec![dir.path().join("event2").as_path()]);
        assert!(matches!(
            reg.on_added(&dir.path().join("event0")),
            Err(DeviceError::Filtered(_))
        ));
    }

    #[test]
    fn test_grab_failure_degrades_to_shared() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeviceConfig {
            grab: true,
            ..DeviceConfig::default()
        };
        let (mut reg, status, grabs) = registry(
            dir.path(),
            &[("event0", Behavior::Keyboard), ("event1", Behavior::BusyGrab)],
            config,
        );

        reg.discover().unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.grabbed_count(), 1);
        assert_eq!(status.report().devices_grabbed, 1);

        reg.close_all();
        assert!(reg.is_empty());
        let log = grabs.lock().unwrap().clone();
        assert_eq!(log.len(), 2);
        assert!(log[1].starts_with("ungrab"));
    }

    #[test]
    fn test_add_remove_leaves_others() {
        let dir = tempfile::tempdir().unwrap();
        let (mut reg, status, _) = registry(
            dir.path(),
            &[("event0", Behavior::Keyboard), ("event1", Behavior::Keyboard)],
            DeviceConfig::default(),
        );

        let a = reg.on_added(&dir.path().join("event0")).unwrap();
        let b = reg.on_added(&dir.path().join("event1")).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.on_added(&dir.path().join("event0")).unwrap(), a);

        assert!(reg.on_removed(&dir.path().join("event0")));
        assert!(!reg.on_removed(&dir.path().join("event0")));
        assert_eq!(reg.poll_targets().len(), 1);
        assert_eq!(reg.poll_targets()[0].0, b);
        assert_eq!(status.report().devices_open, 1);
    }

    #[test]
    fn test_read_error_removes_only_that_device() {
        let dir = tempfile::tempdir().unwrap();
        let (mut reg, _, _) = registry(
            dir.path(),
            &[("event0", Behavior::Keyboard), ("event1", Behavior::Keyboard)],
            DeviceConfig::default(),
        );
        let a = reg.on_added(&dir.path().join("event0")).unwrap();

        let mut out = Vec::new();
        assert!(!reg.read(a, &mut out));
        assert!(out.is_empty());
        assert!(!reg.contains(&dir.path().join("event0")));

        // Reading a removed id is a no-op
        assert!(!reg.read(a, &mut out));
    }

    #[test]
    fn test_hotplug_events() {
        let dir = tempfile::tempdir().unwrap();
        let (mut reg, _, _) = registry(
            dir.path(),
            &[("event0", Behavior::Keyboard), ("event5", Behavior::Denied)],
            DeviceConfig::default(),
        );

        let event0 = dir.path().join("event0");
        let event5 = dir.path().join("event5");

        reg.apply(&HotplugEvent::Added(event0.clone()));
        assert!(reg.contains(&event0));

        reg.apply(&HotplugEvent::Added(event5.clone()));
        assert!(!reg.contains(&event5));

        reg.apply(&HotplugEvent::Removed(event0.clone()));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_rescan_drops_vanished_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut reg, _, _) = registry(
            dir.path(),
            &[("event0", Behavior::Keyboard), ("event1", Behavior::Keyboard)],
            DeviceConfig::default(),
        );
        reg.discover().unwrap();
        assert_eq!(reg.len(), 2);

        std::fs::remove_file(dir.path().join("event1")).unwrap();
        reg.apply(&HotplugEvent::Rescan);
        assert_eq!(reg.paths(), vec![dir.path().join("event0").as_path()]);
    }
}
