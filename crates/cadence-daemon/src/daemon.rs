//! Dispatch table: the single context value handlers operate on,
//! per the "Global mutable state" design note.

use cadence_core::connection::{ConnKey, Slab, TokenIndex};
use cadence_proto::message::{self, MonitorEvent, Outcome};
use cadence_proto::{Frame, MessageType, ProtocolError};

use crate::control::ConnectionRecord;
use crate::orchestrator::Orchestrator;
use crate::player_link::PlayerLink;

pub struct Daemon {
    pub connections: Slab<ConnectionRecord>,
    pub tokens: TokenIndex,
    pub orchestrator: Orchestrator,
}

/// What the event loop should do with the connection after dispatch.
pub enum DispatchOutcome {
    Continue,
    Close,
}

impl Daemon {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { connections: Slab::new(), tokens: TokenIndex::new(), orchestrator }
    }

    /// Compose one `MonitorEvent` frame per connection with the monitor
    /// flag set. Iterates the connection table rather than materializing
    /// a shared buffer.
    pub fn broadcast(&mut self, events: &[MonitorEvent]) {
        for event in events {
            let payload = event.encode();
            for (_, record) in self.connections.iter_mut() {
                if record.monitor {
                    record.conn.compose(MessageType::MonitorEvent, 0, None, &payload);
                }
            }
        }
    }

    fn reply_error(&mut self, key: ConnKey, message: &str) {
        if let Some(record) = self.connections.get_mut(key) {
            record.conn.compose(MessageType::Error, 0, None, &message::encode_cstring(message));
        }
    }

    /// Dispatch one already-parsed frame from connection `key`. A single
    /// call handles exactly one frame — the event loop drains all
    /// currently buffered frames for a connection in its own loop,
    /// keeping one command handler a single atomic turn.
    pub fn dispatch(
        &mut self,
        key: ConnKey,
        frame: Frame,
        player: &mut impl PlayerLink,
    ) -> Result<DispatchOutcome, ProtocolError> {
        match frame.kind {
            MessageType::Play => {
                let events = self.orchestrator.play(player);
                self.broadcast(&events);
            }
            MessageType::TogglePlay => {
                let events = self.orchestrator.toggle_play(player);
                self.broadcast(&events);
            }
            MessageType::Pause => {
                let events = self.orchestrator.pause(player);
                self.broadcast(&events);
            }
            MessageType::Stop => {
                let events = self.orchestrator.stop(player);
                self.broadcast(&events);
            }
            MessageType::Next => {
                let events = self.orchestrator.next(player);
                self.broadcast(&events);
            }
            MessageType::Prev => {
                let events = self.orchestrator.prev(player);
                self.broadcast(&events);
            }
            MessageType::Jump => {
                let target = message::decode_cstring(&frame.payload)?;
                match self.orchestrator.jump(&target, player) {
                    Ok(events) => self.broadcast(&events),
                    Err(_) => self.reply_error(key, "not found"),
                }
            }
            MessageType::Seek => {
                let req = message::SeekPayload::decode(&frame.payload)?;
                self.orchestrator.seek(req, player);
            }
            MessageType::Mode => {
                let req = message::ModePayload::decode(&frame.payload)?;
                let events = self.orchestrator.mode(req);
                self.broadcast(&events);
            }
            MessageType::Flush => {
                let events = self.orchestrator.flush(player);
                self.broadcast(&events);
            }
            MessageType::Show => {
                let entries: Vec<String> = self.orchestrator.show().map(str::to_string).collect();
                if let Some(record) = self.connections.get_mut(key) {
                    for entry in entries {
                        record.conn.compose(MessageType::PlaylistEntry, 0, None, &message::encode_cstring(&entry));
                    }
                    record.conn.compose(MessageType::PlaylistEntry, 0, None, &[]);
                }
            }
            MessageType::Status => {
                let status = self.orchestrator.status();
                if let Some(record) = self.connections.get_mut(key) {
                    record.conn.compose(MessageType::StatusReply, 0, None, &status.encode());
                }
            }
            MessageType::Monitor => {
                if let Some(record) = self.connections.get_mut(key) {
                    record.monitor = true;
                }
            }
            MessageType::Begin => match self.orchestrator.begin(key) {
                Ok(()) => {
                    if let Some(record) = self.connections.get_mut(key) {
                        record.conn.compose(MessageType::Begin, 0, None, &[]);
                    }
                }
                Err(_) => self.reply_error(key, "locked"),
            },
            MessageType::Add => {
                let path = message::decode_cstring(&frame.payload)?;
                if self.orchestrator.is_transaction_open() {
                    match self.orchestrator.add_transactional(key, path) {
                        Ok(()) => {}
                        Err(_) => self.reply_error(key, "locked"),
                    }
                } else {
                    let events = self.orchestrator.add_direct(path);
                    self.broadcast(&events);
                }
            }
            MessageType::Commit => {
                let offset = message::decode_commit(&frame.payload)?;
                match self.orchestrator.commit(key, offset) {
                    Ok(events) => self.broadcast(&events),
                    Err(_) => self.reply_error(key, "locked"),
                }
            }
            MessageType::TrackStarted => {
                let duration = message::decode_position(&frame.payload)?;
                self.orchestrator.on_track_started(duration);
            }
            MessageType::PositionUpdate => {
                let position = message::decode_position(&frame.payload)?;
                self.orchestrator.on_position_update(position);
            }
            MessageType::TrackEnded => {
                if frame.payload.len() != 1 {
                    return Err(ProtocolError::BadPayload("TrackEnded payload must be 1 byte"));
                }
                let outcome = Outcome::from_u8(frame.payload[0])?;
                if !matches!(outcome, Outcome::Stopped) {
                    // Stopped is always a direct echo of a Stop/Next/Prev/Flush
                    // main already handled synchronously; re-running on_track_end
                    // for it would advance the cursor a second time.
                    let events = self.orchestrator.on_track_end(outcome, player);
                    self.broadcast(&events);
                }
            }
            // Response/internal-only variants never arrive as inbound
            // commands; receiving one is a protocol violation.
            MessageType::Error
            | MessageType::PlaylistEntry
            | MessageType::StatusReply
            | MessageType::MonitorEvent
            | MessageType::Resume => {
                return Err(ProtocolError::BadPayload("unexpected frame type from client"));
            }
        }

        Ok(DispatchOutcome::Continue)
    }

    /// Connection close: roll back any transaction this
    /// connection owned, then drop its record.
    pub fn close_connection(&mut self, key: ConnKey) {
        self.orchestrator.on_connection_close(key);
        if let Some(record) = self.connections.remove(key) {
            self.tokens.remove(record.io_token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::Playlist;
    use cadence_proto::message::SeekPayload;
    use cadence_proto::Connection;
    use std::os::fd::RawFd;
    use std::os::unix::net::UnixStream;

    #[derive(Default)]
    struct FakeLink {
        plays: u32,
        stops: u32,
    }

    impl PlayerLink for FakeLink {
        fn send_play(&mut self, _fd: RawFd) {
            self.plays += 1;
        }
        fn send_resume(&mut self) {}
        fn send_pause(&mut self) {}
        fn send_stop(&mut self) {
            self.stops += 1;
        }
        fn send_seek(&mut self, _seek: SeekPayload) {}
    }

    fn new_daemon(paths: &[&str]) -> Daemon {
        let mut playlist = Playlist::new();
        for p in paths {
            playlist.append(p.to_string());
        }
        Daemon::new(Orchestrator::from_playlist(playlist))
    }

    fn insert_connection(daemon: &mut Daemon) -> ConnKey {
        let (a, _b) = UnixStream::pair().unwrap();
        let conn = Connection::new(a).unwrap();
        let token = cadence_core::event_loop::IoToken(daemon.connections.iter().count());
        let key = daemon.connections.insert(ConnectionRecord { conn, monitor: false, io_token: token });
        daemon.tokens.insert(token, key);
        key
    }

    fn frame(kind: MessageType, payload: Vec<u8>) -> Frame {
        Frame { kind, pid: 0, uid: 0, fd: None, payload }
    }

    #[test]
    fn basic_lifecycle_add_play_next_ends_stopped() {
        let mut daemon = new_daemon(&["/dev/null", "/dev/null"]);
        let mut link = FakeLink::default();
        let key = insert_connection(&mut daemon);

        daemon.dispatch(key, frame(MessageType::Play, vec![]), &mut link).unwrap();
        assert_eq!(daemon.orchestrator.playlist().cursor(), 0);
        assert_eq!(link.plays, 1);

        daemon.dispatch(key, frame(MessageType::Next, vec![]), &mut link).unwrap();
        assert_eq!(daemon.orchestrator.playlist().cursor(), 1);
        assert_eq!(link.plays, 2);

        daemon.dispatch(key, frame(MessageType::Next, vec![]), &mut link).unwrap();
        // past the last track without repeat-all: stopped, no wraparound.
        assert_eq!(link.stops, 1);
    }

    #[test]
    fn track_ended_stopped_outcome_does_not_advance_cursor() {
        let mut daemon = new_daemon(&["/dev/null", "/dev/null"]);
        let mut link = FakeLink::default();
        let key = insert_connection(&mut daemon);

        daemon.dispatch(key, frame(MessageType::Play, vec![]), &mut link).unwrap();
        daemon.dispatch(key, frame(MessageType::Stop, vec![]), &mut link).unwrap();
        let cursor_after_stop = daemon.orchestrator.playlist().cursor();

        // The worker's asynchronous echo of that Stop must be a no-op.
        daemon.dispatch(key, frame(MessageType::TrackEnded, vec![Outcome::Stopped as u8]), &mut link).unwrap();
        assert_eq!(daemon.orchestrator.playlist().cursor(), cursor_after_stop);
    }

    #[test]
    fn close_connection_aborts_open_transaction() {
        let mut daemon = new_daemon(&[]);
        let mut link = FakeLink::default();
        let a = insert_connection(&mut daemon);
        let b = insert_connection(&mut daemon);

        daemon.dispatch(a, frame(MessageType::Begin, vec![]), &mut link).unwrap();
        daemon.dispatch(a, frame(MessageType::Add, message::encode_cstring("/x")), &mut link).unwrap();
        assert!(daemon.orchestrator.is_transaction_open());

        daemon.close_connection(a);
        assert!(!daemon.orchestrator.is_transaction_open());

        // The playlist never saw the uncommitted add.
        assert!(daemon.orchestrator.show().next().is_none());

        // A different connection can now begin its own transaction.
        assert!(daemon.dispatch(b, frame(MessageType::Begin, vec![]), &mut link).is_ok());
    }
}
