//! Build script for keytally
//!
//! Renders man pages from the clap definitions in src/cli.rs. Pages go to
//! `$KEYTALLY_MAN_DIR` when set (used by `cargo xtask dist`), otherwise to
//! `$OUT_DIR/man`.

use clap::{Command, CommandFactory};
use clap_mangen::Man;
use std::env;
use std::fs::{self, File};
use std::io::Error;
use std::path::{Path, PathBuf};

include!("src/cli.rs");

/// Render one page to `<dir>/<stem>.1`
fn render_page(cmd: Command, stem: &str, dir: &Path) -> Result<PathBuf, Error> {
    let path = dir.join(format!("{}.1", stem));
    let mut file = File::create(&path)?;
    Man::new(cmd).render(&mut file)?;
    Ok(path)
}

fn man_dir() -> PathBuf {
    if let Some(dir) = env::var_os("KEYTALLY_MAN_DIR") {
        return PathBuf::from(dir);
    }
    let out_dir = env::var_os("OUT_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("target"));
    out_dir.join("man")
}

fn main() -> Result<(), Error> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    println!("cargo:rerun-if-env-changed=KEYTALLY_GEN_MANPAGES");
    println!("cargo:rerun-if-env-changed=KEYTALLY_MAN_DIR");

    let requested = env::var_os("KEYTALLY_GEN_MANPAGES").is_some();
    let release = env::var("PROFILE").map(|p| p == "release").unwrap_or(false);
    if !requested && !release {
        return Ok(());
    }

    let dir = man_dir();
    fs::create_dir_all(&dir)?;

    // Building gives subcommands display names like "keytally-show", which
    // the pages use as their title
    let mut cli = Cli::command();
    cli.build();
    let mut pages = vec![render_page(cli.clone(), "keytally", &dir)?];

    // keytally-show.1, keytally-checkpoint.1, ... (no page for clap's help)
    for sub in cli.get_subcommands().filter(|s| s.get_name() != "help") {
        let stem = format!("keytally-{}", sub.get_name());
        pages.push(render_page(sub.clone(), &stem, &dir)?);
    }

    println!(
        "cargo:warning={} man pages written to {}",
        pages.len(),
        dir.display()
    );

    Ok(())
}
