//! Daemon configuration. Loading and validating the on-disk file in depth
//! is out of scope for this crate; this is the
//! thin surface the daemon actually consults: where the control socket
//! lives, which output device to use, and whether to persist the
//! playlist across restarts.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio_device: Option<String>,
    pub persist_playlist: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { audio_device: None, persist_playlist: true }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Control socket path: `$XDG_RUNTIME_DIR/cadence.sock`, falling back to
/// `$HOME/.cadence/cadence.sock`.
pub fn socket_path() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("cadence.sock");
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".cadence").join("cadence.sock")
}

/// Where an optional playlist snapshot is written on clean shutdown.
pub fn snapshot_path() -> PathBuf {
    socket_path().with_file_name("cadence.playlist")
}
