//! Development tasks for keytally
//!
//! Usage:
//!   cargo xtask install [--service]  Install release binary to /usr/local/bin (requires sudo)
//!   cargo xtask uninstall            Remove binary and user service
//!   cargo xtask dist                 Build release binary and man pages for distribution

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

const INSTALL_PATH: &str = "/usr/local/bin/keytally";

/// systemd user unit; SIGTERM on stop triggers the final checkpoint
const SERVICE_UNIT: &str = "[Unit]
Description=Keytally keystroke counter
Documentation=man:keytally(1)
After=graphical-session.target

[Service]
Type=simple
ExecStart=/usr/local/bin/keytally daemon
ExecReload=/usr/local/bin/keytally checkpoint
Restart=on-failure
RestartSec=2
KillSignal=SIGTERM
TimeoutStopSec=10

[Install]
WantedBy=default.target
";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() {
        print_help();
        return ExitCode::SUCCESS;
    }

    let service = args.iter().any(|a| a == "--service");

    let result = match args[0].as_str() {
        "install" => install(service),
        "uninstall" => uninstall(),
        "dist" => dist(),
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        cmd => {
            eprintln!("Unknown command: {}", cmd);
            print_help();
            Err(anyhow::anyhow!("Unknown command"))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    eprintln!(
        r#"
keytally development tasks

Usage: cargo xtask <COMMAND> [OPTIONS]

Commands:
  install    Build release binary and install to /usr/local/bin (requires sudo)
  uninstall  Remove keytally from /usr/local/bin and disable the user service
  dist       Build optimized release binary and man pages for distribution

Options:
  --service  Also install and enable a systemd user service (install only)

Examples:
  cargo xtask install             # Build and install the binary
  cargo xtask install --service   # ...and run it as a user service
  cargo xtask uninstall           # Remove installed binary and service
"#
    );
}

/// Get the project root directory
fn project_root() -> anyhow::Result<PathBuf> {
    let dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => env::current_dir()?,
    };

    // xtask is in a subdirectory, go up one level
    Ok(dir.parent().unwrap_or(&dir).to_path_buf())
}

fn user_unit_path() -> anyhow::Result<PathBuf> {
    let config_home = match env::var("XDG_CONFIG_HOME") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => PathBuf::from(env::var("HOME")?).join(".config"),
    };
    Ok(config_home.join("systemd/user/keytally.service"))
}

fn cargo_build(root: &Path, generate_man: bool) -> anyhow::Result<PathBuf> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--release"]).current_dir(root);
    if generate_man {
        cmd.env("KEYTALLY_GEN_MANPAGES", "1")
            .env("KEYTALLY_MAN_DIR", root.join("target/man"));
    }

    if !cmd.status()?.success() {
        anyhow::bail!("Build failed");
    }

    let binary = root.join("target/release/keytally");
    if !binary.exists() {
        anyhow::bail!("Binary not found at {:?}", binary);
    }
    Ok(binary)
}

fn systemctl_user(args: &[&str]) -> anyhow::Result<bool> {
    Ok(Command::new("systemctl").arg("--user").args(args).status()?.success())
}

/// Build release binary and install to /usr/local/bin
fn install(service: bool) -> anyhow::Result<()> {
    let root = project_root()?;

    println!("==> Building release binary...");
    let binary = cargo_build(&root, false)?;

    println!("==> Installing to {}...", INSTALL_PATH);
    let status = Command::new("sudo")
        .arg("install")
        .arg("-Dm755")
        .arg(&binary)
        .arg(INSTALL_PATH)
        .status()?;

    if !status.success() {
        anyhow::bail!("Install failed (sudo required)");
    }

    if service {
        let unit = user_unit_path()?;
        println!("==> Writing user service {:?}...", unit);
        if let Some(parent) = unit.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&unit, SERVICE_UNIT)?;

        if !systemctl_user(&["daemon-reload"])? || !systemctl_user(&["enable", "--now", "keytally"])? {
            anyhow::bail!("Failed to enable keytally.service");
        }
        println!("==> keytally.service enabled");
    }

    println!("==> Installed successfully!");
    println!();
    println!("Installed: {}", INSTALL_PATH);

    // Show version
    let _ = Command::new(INSTALL_PATH).arg("--version").status();

    Ok(())
}

/// Remove keytally from /usr/local/bin
fn uninstall() -> anyhow::Result<()> {
    let unit = user_unit_path()?;
    if unit.exists() {
        println!("==> Disabling keytally.service...");
        // Stopping sends SIGTERM, which writes a final checkpoint
        let _ = systemctl_user(&["disable", "--now", "keytally"]);
        std::fs::remove_file(&unit)?;
        let _ = systemctl_user(&["daemon-reload"]);
    }

    println!("==> Removing {}...", INSTALL_PATH);
    let status = Command::new("sudo").args(["rm", "-f", INSTALL_PATH]).status()?;

    if !status.success() {
        anyhow::bail!("Uninstall failed (sudo required)");
    }

    println!("==> Uninstalled successfully!");
    println!("    Counts are kept in ~/.local/share/keytally/counts.json");
    Ok(())
}

/// Build optimized release binary for distribution
fn dist() -> anyhow::Result<()> {
    let root = project_root()?;

    println!("==> Building distribution binary...");
    let binary = cargo_build(&root, true)?;
    println!("==> Built: {:?}", binary);
    println!("==> Man pages: {:?}", root.join("target/man"));

    // Show binary info
    let _ = Command::new("ls").arg("-lh").arg(&binary).status();
    let _ = Command::new(&binary).arg("--version").status();

    Ok(())
}
