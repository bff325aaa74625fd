//! Keytally - crash-safe keystroke counter for Linux
//!
//! Run with `keytally` or `keytally daemon` to start the daemon.
//! Use `keytally show` to print the counts from the last checkpoint.
//! Use `keytally stop` / `keytally checkpoint` to signal a running daemon.

use anyhow::{bail, Context};
use clap::Parser;
use keytally::cli::{Cli, Commands};
use keytally::config::{self, Config};
use keytally::counter::{self, PersistedState};
use keytally::daemon::Daemon;
use keytally::device::evdev_source::key_name;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("keytally={},warn", log_level))),
        )
        .with_target(false)
        .init();

    // Load configuration
    let mut config = config::load_config(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(path) = cli.counter_file {
        config.counter.path = path.to_string_lossy().to_string();
    }
    if cli.audio {
        config.audio.enabled = true;
    }
    if cli.no_audio {
        config.audio.enabled = false;
    }
    if let Some(sample) = cli.sample {
        config.audio.sample = sample;
    }
    if cli.grab {
        config.devices.grab = true;
    }
    if cli.reset {
        config.counter.reset_on_start = true;
    }

    // Run the appropriate command
    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => {
            let mut daemon = Daemon::new(config);
            daemon.run().await?;
        }

        Commands::Show { format, follow, top } => {
            run_show(&config, &format, follow, top)?;
        }

        Commands::Config { template } => {
            if template {
                print!("{}", config::DEFAULT_CONFIG);
            } else {
                show_config(&config);
            }
        }

        Commands::Stop => {
            signal_daemon(Signal::SIGTERM)?;
            println!("Sent stop request to keytally daemon");
        }

        Commands::Checkpoint => {
            signal_daemon(Signal::SIGUSR1)?;
            println!("Requested checkpoint from keytally daemon");
        }
    }

    Ok(())
}

/// Send a signal to the daemon named in the PID file
fn signal_daemon(signal: Signal) -> anyhow::Result<()> {
    let pid_path = Config::pid_file();
    let contents = match std::fs::read_to_string(&pid_path) {
        Ok(contents) => contents,
        Err(_) => bail!("keytally daemon is not running (no PID file at {:?})", pid_path),
    };
    let pid: i32 = contents
        .trim()
        .parse()
        .with_context(|| format!("Invalid PID file {:?}", pid_path))?;

    kill(Pid::from_raw(pid), signal)
        .with_context(|| format!("Failed to signal keytally daemon (pid {})", pid))?;
    Ok(())
}

/// Run the show command - print the last checkpoint
fn run_show(config: &Config, format: &str, follow: bool, top: usize) -> anyhow::Result<()> {
    if follow {
        return follow_total(config, format);
    }

    let path = config.resolve_counter_file();
    let state = match counter::read_state(&path) {
        Ok(state) => state,
        Err(keytally::error::PersistError::Read(_, e)) if e.kind() == std::io::ErrorKind::NotFound => {
            if format == "json" {
                println!("{}", format_total_json(Some(0), "empty"));
            } else {
                println!("No keystrokes recorded yet ({:?} does not exist)", path);
            }
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&state_json(&state))?);
    } else {
        print_state(&state, top);
    }
    Ok(())
}

fn print_state(state: &PersistedState, top: usize) {
    println!("Total keystrokes: {}", state.total);
    println!(
        "Last checkpoint: #{} at {}",
        state.sequence,
        state.checkpointed_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
    );

    if state.counts.is_empty() {
        return;
    }

    let mut keys: Vec<(u16, u64)> = state.counts.iter().map(|(&code, &count)| (code, count)).collect();
    keys.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let shown = if top == 0 { keys.len() } else { top.min(keys.len()) };

    println!();
    for (code, count) in &keys[..shown] {
        let share = *count as f64 * 100.0 / state.total.max(1) as f64;
        println!("  {:<20} {:>10}  {:5.1}%", key_name(*code), count, share);
    }
    if shown < keys.len() {
        println!("  ... {} more keys", keys.len() - shown);
    }
}

fn state_json(state: &PersistedState) -> serde_json::Value {
    let keys: serde_json::Map<String, serde_json::Value> = state
        .counts
        .iter()
        .map(|(&code, &count)| (key_name(code), serde_json::Value::from(count)))
        .collect();

    serde_json::json!({
        "total": state.total,
        "sequence": state.sequence,
        "checkpointed_at": state.checkpointed_at,
        "keys": keys,
    })
}

/// Format the running total for Waybar's custom module
fn format_total_json(total: Option<u64>, class: &str) -> String {
    let (text, tooltip) = match total {
        Some(total) => (total.to_string(), format!("{} keystrokes", total)),
        None => (String::new(), "Keytally not running".to_string()),
    };
    serde_json::json!({
        "text": text,
        "class": class,
        "tooltip": tooltip,
    })
    .to_string()
}

fn read_total(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn print_total(total: Option<u64>, format: &str) {
    if format == "json" {
        let class = if total.is_some() { "counting" } else { "stopped" };
        println!("{}", format_total_json(total, class));
    } else {
        match total {
            Some(total) => println!("{}", total),
            None => println!("stopped"),
        }
    }
}

/// Print the total from the status file every time the daemon updates it
fn follow_total(config: &Config, format: &str) -> anyhow::Result<()> {
    use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    let Some(status_path) = config.resolve_status_file() else {
        eprintln!("Error: status_file is disabled.");
        eprintln!();
        eprintln!("To follow the running total, add to your config.toml:");
        eprintln!();
        eprintln!("  status_file = \"auto\"");
        std::process::exit(1);
    };

    let mut last = read_total(&status_path);
    print_total(last, format);

    // Set up file watcher
    let (tx, rx) = channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        NotifyConfig::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    // Watch the parent directory: the file is replaced by rename on every update
    if let Some(parent) = status_path.parent() {
        std::fs::create_dir_all(parent)?;
        watcher.watch(parent, RecursiveMode::NonRecursive)?;
    }

    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(_event)) => {
                let current = read_total(&status_path);
                if current.is_some() && current != last {
                    print_total(current, format);
                    last = current;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Watch error: {:?}", e);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                // File removed on clean daemon shutdown
                if !status_path.exists() && last.is_some() {
                    print_total(None, format);
                    last = None;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                break;
            }
        }
    }

    Ok(())
}

/// Show current configuration
fn show_config(config: &Config) {
    println!("Current Configuration\n");
    println!("=====================\n");

    println!("[devices]");
    println!("  allow = {:?}", config.devices.allow);
    println!("  name_hints = {:?}", config.devices.name_hints);
    println!("  grab = {}", config.devices.grab);

    println!("\n[counter]");
    println!("  path = {:?}", config.counter.path);
    println!("  (resolves to: {:?})", config.resolve_counter_file());
    println!("  checkpoint_interval_secs = {}", config.counter.checkpoint_interval_secs);
    println!("  reset_on_start = {}", config.counter.reset_on_start);

    println!("\n[audio]");
    println!("  enabled = {}", config.audio.enabled);
    println!("  sample = {:?}", config.audio.sample);
    println!("  volume = {}", config.audio.volume);
    println!("  queue_capacity = {}", config.audio.queue_capacity);
    println!("  reopen_attempts = {}", config.audio.reopen_attempts);
    println!("  reopen_backoff_ms = {}", config.audio.reopen_backoff_ms);

    println!("\n[supervisor]");
    println!("  capture_restarts = {}", config.supervisor.capture_restarts);
    println!("  audio_restarts = {}", config.supervisor.audio_restarts);
    println!("  poll_timeout_ms = {}", config.supervisor.poll_timeout_ms);

    if let Some(ref status_file) = config.status_file {
        println!("\n[integration]");
        println!("  status_file = {:?}", status_file);
        if let Some(resolved) = config.resolve_status_file() {
            println!("  (resolves to: {:?})", resolved);
        }
    }

    println!("\n---");
    match Config::default_path() {
        Some(path) if path.exists() => println!("Config file: {:?}", path),
        Some(path) => {
            println!("Config file: {:?} (not found, using defaults)", path);
            println!("A commented template is printed by: keytally config --template");
        }
        None => println!("Config file: (not found)"),
    }
    println!("Runtime dir: {:?}", Config::runtime_dir());
}
