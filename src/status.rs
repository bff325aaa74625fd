//! Daemon status shared between the capture loop, the playback thread and
//! the controller
//!
//! Every field has a single writer: the device registry owns the device
//! counters, the audio engine owns the audio fields. Readers never block.

use crate::counter::write_atomic;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Live status counters
#[derive(Debug, Default)]
pub struct DaemonStatus {
    devices_open: AtomicUsize,
    devices_grabbed: AtomicUsize,
    audio_enabled: AtomicBool,
    clicks_played: AtomicU64,
    clicks_dropped: AtomicU64,
}

/// Point-in-time copy of [`DaemonStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusReport {
    pub devices_open: usize,
    pub devices_grabbed: usize,
    pub audio_enabled: bool,
    pub clicks_played: u64,
    pub clicks_dropped: u64,
}

impl DaemonStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            devices_open: self.devices_open.load(Ordering::Relaxed),
            devices_grabbed: self.devices_grabbed.load(Ordering::Relaxed),
            audio_enabled: self.audio_enabled.load(Ordering::Relaxed),
            clicks_played: self.clicks_played.load(Ordering::Relaxed),
            clicks_dropped: self.clicks_dropped.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_devices(&self, open: usize, grabbed: usize) {
        self.devices_open.store(open, Ordering::Relaxed);
        self.devices_grabbed.store(grabbed, Ordering::Relaxed);
    }

    pub(crate) fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn click_played(&self) {
        self.clicks_played.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn click_dropped(&self) {
        self.clicks_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Plain-text total for bar integrations (Waybar `exec` / `cat`)
pub struct StatusFile {
    path: PathBuf,
    last_written: Option<u64>,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_written: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the total if it changed since the last write
    pub fn update(&mut self, total: u64) {
        if self.last_written == Some(total) {
            return;
        }

        match write_atomic(&self.path, total.to_string().as_bytes()) {
            Ok(()) => {
                tracing::trace!("Status file updated: {}", total);
                self.last_written = Some(total);
            }
            Err(e) => tracing::warn!("Failed to write status file: {}", e),
        }
    }

    /// Remove status file on shutdown
    pub fn cleanup(&self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("Failed to remove status file: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_reflects_updates() {
        let status = DaemonStatus::new();
        status.set_devices(3, 1);
        status.set_audio_enabled(true);
        status.click_played();
        status.click_dropped();
        status.click_dropped();

        let report = status.report();
        assert_eq!(report.devices_open, 3);
        assert_eq!(report.devices_grabbed, 1);
        assert!(report.audio_enabled);
        assert_eq!(report.clicks_played, 1);
        assert_eq!(report.clicks_dropped, 2);
    }

    #[test]
    fn test_status_file_roundtrip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = StatusFile::new(dir.path().join("run/count"));

        file.update(42);
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "42");
        file.update(43);
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "43");

        file.cleanup();
        assert!(!file.path().exists());
    }
}
