//! Command-line interface for the main process.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "cadenced")]
pub struct Args {
    /// Path to the control socket. Defaults to `$XDG_RUNTIME_DIR/cadence.sock`.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Path to the TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the `cadence-playerd` binary. Defaults to a sibling of the
    /// current executable.
    #[arg(long)]
    pub player_bin: Option<PathBuf>,

    /// Output device identifier, overriding the config file.
    #[arg(long)]
    pub device: Option<String>,

    /// Disable loading/saving the playlist snapshot across restarts.
    #[arg(long)]
    pub no_persist: bool,
}
