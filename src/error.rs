//! Error types for keytally
//!
//! Uses thiserror for ergonomic error definitions. Most of these errors are
//! recovered locally by the component that raises them; only
//! `CaptureError::Exhausted` ends the daemon.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the keytally application
#[derive(Error, Debug)]
pub enum KeytallyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Another keytally daemon is already running (lock: {0})")]
    AlreadyRunning(PathBuf),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to input devices
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Cannot open input device '{0}'. Is the user in the 'input' group?\n  Run: sudo usermod -aG input $USER\n  Then log out and back in.")]
    PermissionDenied(PathBuf),

    #[error("Cannot read input directory {0}: {1}")]
    Namespace(PathBuf, std::io::Error),

    #[error("Failed to open {0}: {1}")]
    Open(PathBuf, std::io::Error),

    #[error("{0} does not report key events")]
    NotAKeyboard(PathBuf),

    #[error("{0} is excluded by the device filter")]
    Filtered(PathBuf),

    #[error("Hotplug watch failed: {0}")]
    Hotplug(std::io::Error),
}

/// Errors related to the persisted counter file
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Failed to write checkpoint to {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("Failed to read checkpoint {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Checkpoint {0} is corrupt: {1}")]
    Corrupt(PathBuf, String),

    #[error("Failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors related to click playback
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio output unavailable: {0}")]
    Unavailable(String),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Failed to load click sample {0}: {1}")]
    Sample(PathBuf, String),
}

/// Errors from the capture (poll) loop
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("poll failed: {0}")]
    Poll(std::io::Error),

    #[error("Counter queue closed")]
    CounterClosed,

    #[error("Capture loop panicked: {0}")]
    Panicked(String),

    #[error("Capture loop failed {0} times, giving up")]
    Exhausted(u32),
}

/// Result type alias using KeytallyError
pub type Result<T> = std::result::Result<T, KeytallyError>;
