//! Configuration loading and types for keytally
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/keytally/config.toml)
//! 3. Environment variables (KEYTALLY_*)
//! 4. CLI arguments (highest priority)

use crate::error::KeytallyError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# Keytally Configuration
#
# Location: ~/.config/keytally/config.toml
# All settings can be overridden via CLI flags

# Status file for bar integrations (Waybar, polybar, etc.)
# Use "auto" for the default location ($XDG_RUNTIME_DIR/keytally/count),
# a custom path, or "disabled" to turn off. The daemon writes the running
# total to this file after every checkpoint.
status_file = "auto"

[devices]
# Only open these device nodes (empty = every keyboard under /dev/input)
# allow = ["/dev/input/event3"]
allow = []

# Only open devices whose name contains one of these strings (empty = all)
# name_hints = ["GMMK Pro Keyboard", "Translated"]
name_hints = []

# Take exclusive access to keyboards (EVIOCGRAB). Grabbed keys are not
# delivered to the desktop, so this is off unless you really want it.
grab = false

[counter]
# Counter file ("auto" = ~/.local/share/keytally/counts.json)
path = "auto"

# Seconds between checkpoints of the counter file
checkpoint_interval_secs = 5

# Start from zero instead of the persisted counts
reset_on_start = false

[audio]
# Play a click for every key press
enabled = false

# Click sound: "click" for the built-in sound, or a path to a WAV or MP3 file
sample = "click"

# Volume level (0.0 to 1.0)
volume = 0.7

# Pending clicks kept when presses outrun the audio device
# queue_capacity = 32

# Reopen attempts after an audio device error before giving up
# reopen_attempts = 3
# reopen_backoff_ms = 250

# [supervisor]
# Restarts of the capture loop before the daemon exits with an error
# capture_restarts = 3
# Restarts of the playback thread before audio is disabled
# audio_restarts = 3
# Upper bound on a single poll wait, also the shutdown latency
# poll_timeout_ms = 250
"#;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub devices: DeviceConfig,

    #[serde(default)]
    pub counter: CounterConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Optional path to the status file read by bars
    /// "auto" resolves to the runtime directory, "disabled" turns it off
    #[serde(default)]
    pub status_file: Option<String>,
}

/// Input device selection
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Device node allowlist, empty means every keyboard
    #[serde(default)]
    pub allow: Vec<PathBuf>,

    /// Device name substrings, empty means every keyboard
    #[serde(default)]
    pub name_hints: Vec<String>,

    /// Request exclusive access (best-effort)
    #[serde(default)]
    pub grab: bool,
}

impl DeviceConfig {
    /// Whether a device node path passes the allowlist
    pub fn allows_path(&self, path: &Path) -> bool {
        self.allow.is_empty() || self.allow.iter().any(|p| p == path)
    }

    /// Whether a device name matches one of the configured hints
    pub fn allows_name(&self, name: &str) -> bool {
        self.name_hints.is_empty() || self.name_hints.iter().any(|hint| name.contains(hint.as_str()))
    }
}

/// Counter persistence configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CounterConfig {
    /// Counter file path, or "auto"
    #[serde(default = "default_auto")]
    pub path: String,

    /// Seconds between periodic checkpoints
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,

    /// Ignore persisted counts at startup
    #[serde(default)]
    pub reset_on_start: bool,
}

/// Click feedback configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub enabled: bool,

    /// "click" for the generated sound, or a WAV/MP3 file path
    #[serde(default = "default_sample")]
    pub sample: String,

    /// Volume level (0.0 to 1.0)
    #[serde(default = "default_volume")]
    pub volume: f32,

    /// Capacity of the click trigger ring
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Reopen attempts after a device error
    #[serde(default = "default_reopen_attempts")]
    pub reopen_attempts: u32,

    /// Initial reopen backoff, doubled on every attempt
    #[serde(default = "default_reopen_backoff")]
    pub reopen_backoff_ms: u64,
}

/// Restart budgets and loop timing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_restarts")]
    pub capture_restarts: u32,

    #[serde(default = "default_restarts")]
    pub audio_restarts: u32,

    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
}

fn default_auto() -> String {
    "auto".to_string()
}

fn default_checkpoint_interval() -> u64 {
    5
}

fn default_sample() -> String {
    "click".to_string()
}

fn default_volume() -> f32 {
    0.7
}

fn default_queue_capacity() -> usize {
    32
}

fn default_reopen_attempts() -> u32 {
    3
}

fn default_reopen_backoff() -> u64 {
    250
}

fn default_restarts() -> u32 {
    3
}

fn default_poll_timeout() -> u64 {
    250
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            path: default_auto(),
            checkpoint_interval_secs: default_checkpoint_interval(),
            reset_on_start: false,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample: default_sample(),
            volume: default_volume(),
            queue_capacity: default_queue_capacity(),
            reopen_attempts: default_reopen_attempts(),
            reopen_backoff_ms: default_reopen_backoff(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            capture_restarts: default_restarts(),
            audio_restarts: default_restarts(),
            poll_timeout_ms: default_poll_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: DeviceConfig::default(),
            counter: CounterConfig::default(),
            audio: AudioConfig::default(),
            supervisor: SupervisorConfig::default(),
            status_file: Some("auto".to_string()),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "keytally")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the runtime directory for ephemeral files (status, pid, lock)
    pub fn runtime_dir() -> PathBuf {
        // Use XDG_RUNTIME_DIR if available, otherwise fall back to /tmp
        std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join("keytally")
    }

    /// Get the data directory path (for the counter file)
    pub fn data_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "keytally")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Path of the PID file used by `keytally stop` and `keytally checkpoint`
    pub fn pid_file() -> PathBuf {
        Self::runtime_dir().join("pid")
    }

    /// Resolve the counter file path
    pub fn resolve_counter_file(&self) -> PathBuf {
        match self.counter.path.as_str() {
            "auto" | "" => Self::data_dir().join("counts.json"),
            path => PathBuf::from(path),
        }
    }

    /// Resolve the status file path from config
    /// Returns None if status_file is not configured or explicitly disabled
    pub fn resolve_status_file(&self) -> Option<PathBuf> {
        self.status_file.as_ref().and_then(|path| {
            match path.to_lowercase().as_str() {
                "disabled" | "none" | "off" | "false" => None,
                "auto" => Some(Self::runtime_dir().join("count")),
                _ => Some(PathBuf::from(path)),
            }
        })
    }

    /// Ensure the runtime directory and the counter file's directory exist
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        let runtime_dir = Self::runtime_dir();
        std::fs::create_dir_all(&runtime_dir)?;
        tracing::debug!("Ensured runtime directory exists: {:?}", runtime_dir);

        if let Some(parent) = self.resolve_counter_file().parent() {
            std::fs::create_dir_all(parent)?;
            tracing::debug!("Ensured data directory exists: {:?}", parent);
        }

        Ok(())
    }
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(path: Option<&Path>) -> Result<Config, KeytallyError> {
    // Start with defaults
    let mut config = Config::default();

    // Determine config file path
    let config_path = path.map(PathBuf::from).or_else(Config::default_path);

    // Load from file if it exists
    if let Some(ref path) = config_path {
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .map_err(|e| KeytallyError::Config(format!("Failed to read config: {}", e)))?;

            config = toml::from_str(&contents)
                .map_err(|e| KeytallyError::Config(format!("Invalid config: {}", e)))?;
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    if config.counter.checkpoint_interval_secs == 0 {
        return Err(KeytallyError::Config(
            "counter.checkpoint_interval_secs must be at least 1".to_string(),
        ));
    }
    if config.audio.queue_capacity == 0 {
        return Err(KeytallyError::Config(
            "audio.queue_capacity must be at least 1".to_string(),
        ));
    }

    Ok(config)
}

/// Override from environment variables
fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(path) = var("KEYTALLY_COUNTER_FILE") {
        config.counter.path = path;
    }
    if let Some(secs) = var("KEYTALLY_CHECKPOINT_SECS").and_then(|s| s.parse().ok()) {
        config.counter.checkpoint_interval_secs = secs;
    }
    if let Some(enabled) = var("KEYTALLY_AUDIO") {
        config.audio.enabled = matches!(enabled.to_lowercase().as_str(), "1" | "true" | "on" | "yes");
    }
    if let Some(sample) = var("KEYTALLY_SAMPLE") {
        config.audio.sample = sample;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.devices.allow.is_empty());
        assert!(!config.devices.grab);
        assert_eq!(config.counter.checkpoint_interval_secs, 5);
        assert!(!config.counter.reset_on_start);
        assert!(!config.audio.enabled);
        assert_eq!(config.audio.sample, "click");
        assert_eq!(config.supervisor.capture_restarts, 3);
    }

    #[test]
    fn test_default_config_template_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.counter.path, "auto");
        assert_eq!(config.audio.volume, 0.7);
        assert_eq!(config.status_file.as_deref(), Some("auto"));
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
            status_file = "disabled"

            [devices]
            allow = ["/dev/input/event3"]
            name_hints = ["GMMK"]
            grab = true

            [counter]
            path = "/var/lib/keytally/counts.json"
            checkpoint_interval_secs = 30

            [audio]
            enabled = true
            sample = "/usr/share/sounds/click.wav"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.devices.allow, vec![PathBuf::from("/dev/input/event3")]);
        assert!(config.devices.grab);
        assert_eq!(config.counter.checkpoint_interval_secs, 30);
        assert_eq!(
            config.resolve_counter_file(),
            PathBuf::from("/var/lib/keytally/counts.json")
        );
        assert!(config.audio.enabled);
        assert_eq!(config.audio.queue_capacity, 32); // default
        assert!(config.resolve_status_file().is_none());
    }

    #[test]
    fn test_device_filters() {
        let devices = DeviceConfig {
            allow: vec![PathBuf::from("/dev/input/event4")],
            name_hints: vec!["Keychron".to_string()],
            grab: false,
        };
        assert!(devices.allows_path(Path::new("/dev/input/event4")));
        assert!(!devices.allows_path(Path::new("/dev/input/event5")));
        assert!(devices.allows_name("Keychron K2"));
        assert!(!devices.allows_name("Logitech USB Receiver"));

        let open = DeviceConfig::default();
        assert!(open.allows_path(Path::new("/dev/input/event9")));
        assert!(open.allows_name("anything"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("KEYTALLY_COUNTER_FILE", "/tmp/counts.json"),
            ("KEYTALLY_CHECKPOINT_SECS", "12"),
            ("KEYTALLY_AUDIO", "on"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.counter.path, "/tmp/counts.json");
        assert_eq!(config.counter.checkpoint_interval_secs, 12);
        assert!(config.audio.enabled);
    }

    #[test]
    fn test_status_file_resolution() {
        let mut config = Config::default();
        config.status_file = Some("/tmp/waybar_counter.txt".to_string());
        assert_eq!(
            config.resolve_status_file(),
            Some(PathBuf::from("/tmp/waybar_counter.txt"))
        );
        config.status_file = None;
        assert!(config.resolve_status_file().is_none());
    }
}
