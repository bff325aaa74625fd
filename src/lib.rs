//! Keytally: crash-safe keystroke counter for Linux
//!
//! This library provides the core functionality for:
//! - Reading key events from every keyboard via evdev (kernel-level, works on all compositors)
//! - Following keyboards as they are plugged and unplugged (inotify on /dev/input)
//! - Counting key presses per key and persisting them with atomic checkpoints
//! - Playing a click per key press without ever slowing down counting (rodio)
//!
//! # Architecture
//!
//! ```text
//!                            ┌─────────────────────────────────────┐
//!                            │              Daemon                 │
//!                            │  (startup, signals, checkpoints)    │
//!                            └─────────────────────────────────────┘
//!                                            │
//!                   ┌────────────────────────┼────────────────────────┐
//!                   │                        │                        │
//!                   ▼                        ▼                        ▼
//!          ┌──────────────┐         ┌──────────────┐         ┌──────────────┐
//!          │   Device     │         │   Counter    │         │    Audio     │
//!          │  Registry    │         │    Store     │         │   Engine     │
//!          │(evdev+inotify)│        │ (JSON file)  │         │   (rodio)    │
//!          └──────────────┘         └──────────────┘         └──────────────┘
//!                   │                        ▲                        ▲
//!                   │ ready fds              │ unbounded queue        │ SPSC ring
//!                   ▼                        │ (never drops)          │ (drops when full)
//!          ┌─────────────────────────────────────────────────────────────────┐
//!          │                 Multiplexer (poll loop thread)                  │
//!          │   poll ──▶ read reports ──▶ repeat filter ──▶ dispatch          │
//!          └─────────────────────────────────────────────────────────────────┘
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("keytally reads evdev devices and only builds on Linux");

pub mod audio;
pub mod cli;
pub mod config;
pub mod counter;
pub mod daemon;
pub mod device;
pub mod error;
pub mod event;
pub mod multiplexer;
pub mod status;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use counter::{CounterSnapshot, CounterStore, PersistedState};
pub use daemon::{Backends, Daemon, DaemonHandle};
pub use error::{KeytallyError, Result};
pub use event::{KeyEvent, Transition};
pub use status::StatusReport;
