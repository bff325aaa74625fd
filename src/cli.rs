// Command-line interface definitions for keytally
//
// This module is separate so it can be used by both the binary (main.rs)
// and build.rs for generating man pages.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "keytally")]
#[command(author, version, about = "Crash-safe keystroke counter for Linux")]
#[command(long_about = "
Keytally counts every key press on every keyboard attached to the machine.
It reads evdev devices directly, so it works under any Wayland compositor,
X11, or a bare console. Counts survive crashes and reboots; at most one
checkpoint interval of presses can be lost.

SETUP:
  1. Add yourself to the input group: sudo usermod -aG input $USER
  2. Log out and back in
  3. Run: keytally (to start the daemon)

USAGE:
  keytally show            Print the per-key counts
  keytally show --follow   Print the total whenever it changes
  keytally checkpoint      Ask the daemon to write its counts now
  keytally stop            Stop the daemon cleanly
")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Override the counter file location
    #[arg(long, value_name = "FILE")]
    pub counter_file: Option<std::path::PathBuf>,

    /// Play a click on every key press
    #[arg(long, conflicts_with = "no_audio")]
    pub audio: bool,

    /// Disable click feedback
    #[arg(long)]
    pub no_audio: bool,

    /// Click sound: "click" or a path to a WAV or MP3 file
    #[arg(long, value_name = "SAMPLE")]
    pub sample: Option<String>,

    /// Take exclusive access to keyboards (keys stop reaching the desktop)
    #[arg(long)]
    pub grab: bool,

    /// Start counting from zero, ignoring the persisted counts
    #[arg(long)]
    pub reset: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as daemon (default if no command specified)
    Daemon,

    /// Show the counts from the last checkpoint
    Show {
        /// Output format: "text" (default) or "json" (for Waybar)
        #[arg(long, default_value = "text")]
        format: String,

        /// Print the total every time the daemon updates its status file
        #[arg(long)]
        follow: bool,

        /// Number of keys to list in text output (0 = all)
        #[arg(long, default_value_t = 0)]
        top: usize,
    },

    /// Show current configuration
    Config {
        /// Print a commented default config.toml instead
        #[arg(long)]
        template: bool,
    },

    /// Stop the running daemon (sends SIGTERM)
    Stop,

    /// Make the running daemon write a checkpoint now (sends SIGUSR1)
    Checkpoint,
}
