//! Command-line interface for the player worker.
//!
//! The worker is never invoked directly by a user — `cadenced` spawns it
//! with `--link-fd` pointing at the inherited end of the privileged
//! socketpair (§4.5) — but the surface is still a plain `clap` parser so
//! it behaves like any other binary in the workspace.

use clap::Parser;

#[derive(Parser, Debug)]
pub struct Args {
    /// Output device, matched by substring (case-insensitive). Defaults to
    /// the host's default output device.
    #[arg(long)]
    pub device: Option<String>,

    /// Fd number of the privileged link to main, inherited across exec.
    #[arg(long = "link-fd")]
    pub link_fd: i32,
}
