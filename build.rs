//! Generates the man page and shell completions from the CLI definition.

use clap::CommandFactory;
use clap_complete::Shell;
use std::io::{Error, ErrorKind};
use std::path::PathBuf;

#[path = "src/cli.rs"]
#[allow(dead_code)]
mod cli;

fn main() -> std::io::Result<()> {
    println!("cargo:rerun-if-changed=src/cli.rs");

    let out_dir = std::env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "OUT_DIR is not set"))?;

    let mut cmd = cli::Cli::command();

    let mut manpage = Vec::new();
    clap_mangen::Man::new(cmd.clone()).render(&mut manpage)?;
    std::fs::write(out_dir.join("ddloader.1"), manpage)?;

    for shell in [Shell::Bash, Shell::Zsh, Shell::Fish] {
        clap_complete::generate_to(shell, &mut cmd, "ddloader", &out_dir)?;
    }

    Ok(())
}
