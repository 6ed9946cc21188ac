//! Main orchestrator: owns the playlist, play state, modes, and
//! transaction, and implements the playlist advancement/previous rules.

use std::os::fd::AsRawFd;

use cadence_core::error::ClientError;
use cadence_core::transaction::TransactionError;
use cadence_core::{ConnKey, PlayState, PlaybackModes, Playlist, Transaction};
use cadence_proto::message::{MonitorEvent, MonitorEventKind, ModePayload, Outcome, SeekPayload, StatusReply, WireState};

use crate::player_link::PlayerLink;
use crate::track_open::open_track;

pub struct Orchestrator {
    playlist: Playlist,
    state: PlayState,
    modes: PlaybackModes,
    transaction: Transaction,
    position_secs: i64,
    duration_secs: i64,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            playlist: Playlist::new(),
            state: PlayState::Stopped,
            modes: PlaybackModes::default(),
            transaction: Transaction::new(),
            position_secs: 0,
            duration_secs: 0,
        }
    }

    pub fn from_playlist(playlist: Playlist) -> Self {
        Self { playlist, ..Self::new() }
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    fn event(&self, kind: MonitorEventKind) -> MonitorEvent {
        MonitorEvent {
            event: kind,
            position_secs: self.position_secs,
            duration_secs: self.duration_secs,
            modes: self.modes.to_wire(),
        }
    }

    /// Cursor advance with `repeat_all` wraparound; returns `false` and
    /// transitions to `Stopped` when the end is reached without wrap.
    fn advance_wrap(&mut self) -> bool {
        self.playlist.advance_cursor();
        if self.playlist.cursor_past_end() {
            if self.modes.repeat_all && !self.playlist.is_empty() {
                self.playlist.set_cursor(0);
                true
            } else {
                self.state = PlayState::Stopped;
                false
            }
        } else {
            true
        }
    }

    /// Open and hand off the track at the cursor, skipping (and
    /// broadcasting an error for) any track that fails to open, per the
    /// "not fatal" rule for track-open failures.
    fn play_track_at_cursor(&mut self, player: &mut impl PlayerLink) -> Vec<MonitorEvent> {
        let mut events = Vec::new();

        loop {
            if self.playlist.is_empty() || self.playlist.cursor_past_end() || self.playlist.cursor() < 0 {
                self.state = PlayState::Stopped;
                break;
            }

            let path = self.playlist.current().unwrap().to_string();
            match open_track(&path) {
                Ok(fd) => {
                    player.send_play(fd.as_raw_fd());
                    // `fd` drops here; `compose` already duplicated its own copy.
                    self.state = PlayState::Playing;
                    self.position_secs = 0;
                    self.duration_secs = 0;
                    break;
                }
                Err(e) => {
                    tracing::warn!(path, error = %e, "track open failed, skipping");
                    events.push(self.event(MonitorEventKind::Error));
                    if !self.advance_wrap() {
                        break;
                    }
                }
            }
        }

        events
    }

    pub fn play(&mut self, player: &mut impl PlayerLink) -> Vec<MonitorEvent> {
        match self.state {
            PlayState::Stopped => {
                if self.playlist.cursor() < 0 && !self.playlist.is_empty() {
                    self.playlist.set_cursor(0);
                }
                let mut events = self.play_track_at_cursor(player);
                if self.state == PlayState::Playing {
                    events.insert(0, self.event(MonitorEventKind::Play));
                }
                events
            }
            PlayState::Paused => {
                player.send_resume();
                self.state = PlayState::Playing;
                vec![self.event(MonitorEventKind::Play)]
            }
            PlayState::Playing => Vec::new(),
        }
    }

    pub fn toggle_play(&mut self, player: &mut impl PlayerLink) -> Vec<MonitorEvent> {
        match self.state {
            PlayState::Playing => self.pause(player),
            PlayState::Paused | PlayState::Stopped => self.play(player),
        }
    }

    pub fn pause(&mut self, player: &mut impl PlayerLink) -> Vec<MonitorEvent> {
        if self.state != PlayState::Playing {
            return Vec::new();
        }
        player.send_pause();
        self.state = PlayState::Paused;
        vec![self.event(MonitorEventKind::Pause)]
    }

    pub fn stop(&mut self, player: &mut impl PlayerLink) -> Vec<MonitorEvent> {
        if self.state == PlayState::Stopped {
            return Vec::new();
        }
        player.send_stop();
        self.state = PlayState::Stopped;
        vec![self.event(MonitorEventKind::Stop)]
    }

    pub fn next(&mut self, player: &mut impl PlayerLink) -> Vec<MonitorEvent> {
        player.send_stop();
        let mut events = vec![self.event(MonitorEventKind::Next)];
        if self.advance_wrap() {
            events.extend(self.play_track_at_cursor(player));
        } else {
            events.push(self.event(MonitorEventKind::Stop));
        }
        events
    }

    pub fn prev(&mut self, player: &mut impl PlayerLink) -> Vec<MonitorEvent> {
        player.send_stop();
        if self.playlist.is_empty() {
            self.state = PlayState::Stopped;
            return vec![self.event(MonitorEventKind::Prev)];
        }
        if self.state == PlayState::Stopped {
            self.playlist.set_cursor(0);
        } else {
            self.playlist.retreat_cursor();
        }
        let mut events = vec![self.event(MonitorEventKind::Prev)];
        events.extend(self.play_track_at_cursor(player));
        events
    }

    pub fn jump(&mut self, target: &str, player: &mut impl PlayerLink) -> Result<Vec<MonitorEvent>, ClientError> {
        let idx = self.playlist.find(target).ok_or(ClientError::NotFound)?;
        player.send_stop();
        self.playlist.set_cursor(idx as i64);
        let mut events = self.play_track_at_cursor(player);
        if self.state == PlayState::Playing {
            events.insert(0, self.event(MonitorEventKind::Play));
        }
        Ok(events)
    }

    pub fn seek(&mut self, req: SeekPayload, player: &mut impl PlayerLink) {
        player.send_seek(req);
    }

    pub fn mode(&mut self, req: ModePayload) -> Vec<MonitorEvent> {
        self.modes.merge(req);
        vec![self.event(MonitorEventKind::ModeChanged)]
    }

    pub fn flush(&mut self, player: &mut impl PlayerLink) -> Vec<MonitorEvent> {
        if self.state != PlayState::Stopped {
            player.send_stop();
        }
        self.playlist.truncate_past_cursor();
        self.state = PlayState::Stopped;
        vec![self.event(MonitorEventKind::Commit)]
    }

    pub fn show(&self) -> impl Iterator<Item = &str> {
        self.playlist.entries().iter().map(String::as_str)
    }

    pub fn status(&self) -> StatusReply {
        StatusReply {
            state: match self.state {
                PlayState::Stopped => WireState::Stopped,
                PlayState::Playing => WireState::Playing,
                PlayState::Paused => WireState::Paused,
            },
            position_secs: self.position_secs,
            duration_secs: self.duration_secs,
            cursor: self.playlist.cursor(),
            modes: self.modes.to_wire(),
            current_track: self.playlist.current().map(str::to_string),
        }
    }

    pub fn begin(&mut self, owner: ConnKey) -> Result<(), TransactionError> {
        self.transaction.begin(owner)
    }

    pub fn add_transactional(&mut self, owner: ConnKey, path: String) -> Result<(), TransactionError> {
        self.transaction.add(owner, path)
    }

    pub fn is_transaction_open(&self) -> bool {
        self.transaction.is_open()
    }

    pub fn transaction_owner(&self) -> Option<ConnKey> {
        self.transaction.owner()
    }

    pub fn add_direct(&mut self, path: String) -> Vec<MonitorEvent> {
        self.playlist.append(path);
        vec![self.event(MonitorEventKind::Add)]
    }

    pub fn commit(&mut self, owner: ConnKey, offset: i64) -> Result<Vec<MonitorEvent>, TransactionError> {
        let additions = self.transaction.commit(owner)?;
        self.playlist.splice(offset, additions);
        Ok(vec![self.event(MonitorEventKind::Commit)])
    }

    pub fn on_connection_close(&mut self, owner: ConnKey) {
        self.transaction.abort_if_owned_by(owner);
    }

    /// Playlist advancement rule: dispatched when the player reports
    /// `TrackEnded`.
    pub fn on_track_end(&mut self, outcome: Outcome, player: &mut impl PlayerLink) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        if matches!(outcome, Outcome::Error) {
            events.push(self.event(MonitorEventKind::Error));
        }

        let landed = if self.modes.consume {
            self.playlist.remove_current();
            !self.playlist.is_empty() && !self.playlist.cursor_past_end()
        } else if self.modes.repeat_one {
            true
        } else {
            self.advance_wrap()
        };

        if !landed || self.playlist.is_empty() {
            self.state = PlayState::Stopped;
            events.push(self.event(MonitorEventKind::Stop));
            return events;
        }

        events.extend(self.play_track_at_cursor(player));
        events
    }

    pub fn on_track_started(&mut self, duration_secs: i64) {
        self.duration_secs = duration_secs;
        self.position_secs = 0;
    }

    pub fn on_position_update(&mut self, position_secs: i64) {
        self.position_secs = position_secs;
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeLink {
        plays: Vec<i32>,
        stops: u32,
        resumes: u32,
        pauses: u32,
        seeks: Vec<SeekPayload>,
    }

    impl PlayerLink for FakeLink {
        fn send_play(&mut self, fd: i32) {
            self.plays.push(fd);
        }
        fn send_resume(&mut self) {
            self.resumes += 1;
        }
        fn send_pause(&mut self) {
            self.pauses += 1;
        }
        fn send_stop(&mut self) {
            self.stops += 1;
        }
        fn send_seek(&mut self, seek: SeekPayload) {
            self.seeks.push(seek);
        }
    }

    fn make_playlist_with(paths: &[&str]) -> Playlist {
        let mut pl = Playlist::new();
        for p in paths {
            pl.append(p.to_string());
        }
        pl
    }

    #[test]
    fn play_from_stopped_advances_cursor_to_zero() {
        // /dev/null always opens successfully, standing in for a real track.
        let mut orch = Orchestrator::from_playlist(make_playlist_with(&["/dev/null", "/dev/null"]));
        let mut link = FakeLink::default();
        let events = orch.play(&mut link);
        assert_eq!(orch.state(), PlayState::Playing);
        assert_eq!(orch.playlist().cursor(), 0);
        assert_eq!(link.plays.len(), 1);
        assert!(events.iter().any(|e| e.event == MonitorEventKind::Play));
    }

    #[test]
    fn next_advances_and_stops_at_end_without_repeat_all() {
        let mut orch = Orchestrator::from_playlist(make_playlist_with(&["/dev/null"]));
        let mut link = FakeLink::default();
        orch.play(&mut link);
        let events = orch.next(&mut link);
        assert_eq!(orch.state(), PlayState::Stopped);
        assert!(events.iter().any(|e| e.event == MonitorEventKind::Stop));
    }

    #[test]
    fn prev_clamps_at_zero_without_wrap() {
        let mut orch = Orchestrator::from_playlist(make_playlist_with(&["/dev/null", "/dev/null"]));
        let mut link = FakeLink::default();
        orch.play(&mut link);
        orch.prev(&mut link);
        assert_eq!(orch.playlist().cursor(), 0);
    }

    #[test]
    fn flush_truncates_and_forces_stopped() {
        let mut orch = Orchestrator::from_playlist(make_playlist_with(&["/dev/null", "/dev/null", "/dev/null"]));
        let mut link = FakeLink::default();
        orch.play(&mut link);
        orch.flush(&mut link);
        assert_eq!(orch.state(), PlayState::Stopped);
        assert!(orch.playlist().len() <= orch.playlist().cursor() as usize + 1 || orch.playlist().cursor() == -1);
    }

    #[test]
    fn consume_mode_shrinks_playlist_on_track_end() {
        let mut orch = Orchestrator::from_playlist(make_playlist_with(&["/dev/null", "/dev/null"]));
        orch.modes.consume = true;
        let mut link = FakeLink::default();
        orch.play(&mut link);
        let before = orch.playlist().len();
        orch.on_track_end(Outcome::Finished, &mut link);
        assert_eq!(orch.playlist().len(), before - 1);
    }

    #[test]
    fn repeat_one_replays_same_track() {
        let mut orch = Orchestrator::from_playlist(make_playlist_with(&["/dev/null"]));
        orch.modes.repeat_one = true;
        let mut link = FakeLink::default();
        orch.play(&mut link);
        let cursor_before = orch.playlist().cursor();
        orch.on_track_end(Outcome::Finished, &mut link);
        assert_eq!(orch.playlist().cursor(), cursor_before);
        assert_eq!(orch.state(), PlayState::Playing);
    }

    #[test]
    fn transaction_isolation_via_begin_add_commit() {
        let mut orch = Orchestrator::from_playlist(Playlist::new());
        let a = ConnKey { index: 0, generation: 0 };
        let b = ConnKey { index: 1, generation: 0 };
        orch.begin(a).unwrap();
        assert!(orch.begin(b).is_err());
        orch.add_transactional(a, "/x".into()).unwrap();
        assert!(orch.show().collect::<Vec<_>>().is_empty());
        orch.commit(a, -1).unwrap();
        assert_eq!(orch.show().collect::<Vec<_>>(), vec!["/x"]);
    }
}
