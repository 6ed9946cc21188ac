//! The privileged link to the player worker: a
//! socketpair over which main sends `Play`/`Resume`/`Pause`/`Stop`/`Seek`
//! and the worker reports `TrackStarted`/`PositionUpdate`/`TrackEnded`.

use std::os::fd::RawFd;

use cadence_proto::message::SeekPayload;
use cadence_proto::{Connection, MessageType};

/// Abstracts over the player socket so [`crate::orchestrator::Orchestrator`]
/// stays unit-testable without a real subprocess.
pub trait PlayerLink {
    fn send_play(&mut self, fd: RawFd);
    fn send_resume(&mut self);
    fn send_pause(&mut self);
    fn send_stop(&mut self);
    fn send_seek(&mut self, seek: SeekPayload);
}

pub struct SocketPlayerLink {
    conn: Connection,
}

impl SocketPlayerLink {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Drain buffered output toward the worker; call from the event loop
    /// once the link fd reports writable.
    pub fn flush(&mut self) -> cadence_proto::Progress {
        self.conn.flush()
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn has_pending_output(&self) -> bool {
        self.conn.has_pending_output()
    }
}

impl PlayerLink for SocketPlayerLink {
    fn send_play(&mut self, fd: RawFd) {
        self.conn.compose(MessageType::Play, 0, Some(fd), &[]);
    }

    fn send_resume(&mut self) {
        self.conn.compose(MessageType::Resume, 0, None, &[]);
    }

    fn send_pause(&mut self) {
        self.conn.compose(MessageType::Pause, 0, None, &[]);
    }

    fn send_stop(&mut self) {
        self.conn.compose(MessageType::Stop, 0, None, &[]);
    }

    fn send_seek(&mut self, seek: SeekPayload) {
        self.conn.compose(MessageType::Seek, 0, None, &seek.encode());
    }
}
