//! Error taxonomy. Protocol and transactional errors are connection-
//! scoped and never fatal; only startup and audio-device errors terminate
//! a process.

use thiserror::Error;

/// Errors surfaced to a client as an `Error` frame. Never propagated past
/// the connection that triggered them.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("locked")]
    Locked,
    #[error("wrong size")]
    WrongSize,
    #[error("not found")]
    NotFound,
    #[error("protocol error: {0}")]
    Protocol(#[from] cadence_proto::ProtocolError),
}

/// Non-fatal conditions that change global state and are broadcast to
/// monitors as well as (optionally) reported to the originating client.
#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    #[error("could not open track {path:?}: {reason}")]
    TrackOpen { path: String, reason: String },
    #[error("codec error decoding {path:?}: {reason}")]
    Codec { path: String, reason: String },
}

/// Fatal startup failures (exit code 1).
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind control socket at {path:?}: {source}")]
    Bind { path: String, #[source] source: std::io::Error },
    #[error("failed to drop privileges: {0}")]
    PrivilegeDrop(String),
    #[error("failed to spawn player worker: {0}")]
    SpawnWorker(std::io::Error),
}
