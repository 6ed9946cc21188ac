//! Payload encode/decode for each [`crate::MessageType`]'s packed,
//! native-endian layout. Strings are NUL-terminated within the payload
//! bytes rather than length-prefixed, matching the fixed native layout
//! the control protocol promises.

use crate::ProtocolError;

/// Tri-state request carried by `Mode` for each of the three playback
/// toggles in `PlaybackModes`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRequest {
    Leave = 0,
    Set = 1,
    Unset = 2,
    Toggle = 3,
}

impl ModeRequest {
    fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        Ok(match b {
            0 => ModeRequest::Leave,
            1 => ModeRequest::Set,
            2 => ModeRequest::Unset,
            3 => ModeRequest::Toggle,
            _ => return Err(ProtocolError::BadPayload("bad ModeRequest tag")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModePayload {
    pub repeat_one: ModeRequest,
    pub repeat_all: ModeRequest,
    pub consume: ModeRequest,
}

impl ModePayload {
    pub fn encode(self) -> Vec<u8> {
        vec![self.repeat_one as u8, self.repeat_all as u8, self.consume as u8]
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 3 {
            return Err(ProtocolError::BadPayload("Mode payload must be 3 bytes"));
        }
        Ok(Self {
            repeat_one: ModeRequest::from_u8(payload[0])?,
            repeat_all: ModeRequest::from_u8(payload[1])?,
            consume: ModeRequest::from_u8(payload[2])?,
        })
    }
}

/// `Seek(position, relative?, percent?)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekPayload {
    pub value: i64,
    pub relative: bool,
    pub percent: bool,
}

impl SeekPayload {
    pub fn encode(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.extend(self.value.to_ne_bytes());
        let flags = (self.relative as u8) | ((self.percent as u8) << 1);
        out.push(flags);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 9 {
            return Err(ProtocolError::BadPayload("Seek payload must be 9 bytes"));
        }
        let value = i64::from_ne_bytes(payload[0..8].try_into().unwrap());
        let flags = payload[8];
        Ok(Self {
            value,
            relative: flags & 0b01 != 0,
            percent: flags & 0b10 != 0,
        })
    }
}

/// Encode a NUL-terminated string payload (used by `Jump`, `Add`, `Error`,
/// and `PlaylistEntry`).
pub fn encode_cstring(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 1);
    out.extend(s.as_bytes());
    out.push(0);
    out
}

pub fn decode_cstring(payload: &[u8]) -> Result<String, ProtocolError> {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::BadPayload("missing NUL terminator"))?;
    std::str::from_utf8(&payload[..end])
        .map(str::to_owned)
        .map_err(|_| ProtocolError::BadPayload("payload is not valid utf-8"))
}

/// `Commit(offset)`: negative means append, non-negative means
/// replace-from-index.
pub fn encode_commit(offset: i64) -> Vec<u8> {
    offset.to_ne_bytes().to_vec()
}

pub fn decode_commit(payload: &[u8]) -> Result<i64, ProtocolError> {
    if payload.len() != 8 {
        return Err(ProtocolError::BadPayload("Commit payload must be 8 bytes"));
    }
    Ok(i64::from_ne_bytes(payload.try_into().unwrap()))
}

/// Playback state as it appears on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireState {
    Stopped = 0,
    Playing = 1,
    Paused = 2,
}

impl WireState {
    pub fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        Ok(match b {
            0 => WireState::Stopped,
            1 => WireState::Playing,
            2 => WireState::Paused,
            _ => return Err(ProtocolError::BadPayload("bad state tag")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    pub state: WireState,
    pub position_secs: i64,
    pub duration_secs: i64,
    pub cursor: i64,
    pub modes: ModePayload,
    pub current_track: Option<String>,
}

impl StatusReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(30);
        out.push(self.state as u8);
        out.extend(self.position_secs.to_ne_bytes());
        out.extend(self.duration_secs.to_ne_bytes());
        out.extend(self.cursor.to_ne_bytes());
        out.extend(self.modes.encode());
        if let Some(track) = &self.current_track {
            out.extend(track.as_bytes());
        }
        out.push(0);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        const FIXED: usize = 1 + 8 + 8 + 8 + 3;
        if payload.len() < FIXED + 1 {
            return Err(ProtocolError::BadPayload("StatusReply too short"));
        }
        let state = WireState::from_u8(payload[0])?;
        let position_secs = i64::from_ne_bytes(payload[1..9].try_into().unwrap());
        let duration_secs = i64::from_ne_bytes(payload[9..17].try_into().unwrap());
        let cursor = i64::from_ne_bytes(payload[17..25].try_into().unwrap());
        let modes = ModePayload::decode(&payload[25..28])?;
        let track_bytes = &payload[28..];
        let current_track = if track_bytes == [0] {
            None
        } else {
            Some(decode_cstring(track_bytes)?)
        };
        Ok(Self { state, position_secs, duration_secs, cursor, modes, current_track })
    }
}

/// Broadcast to every monitor-subscribed connection on a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorEvent {
    pub event: MonitorEventKind,
    pub position_secs: i64,
    pub duration_secs: i64,
    pub modes: ModePayload,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEventKind {
    Play = 0,
    Pause = 1,
    Stop = 2,
    Next = 3,
    Prev = 4,
    Commit = 5,
    Add = 6,
    ModeChanged = 7,
    Error = 8,
}

impl MonitorEventKind {
    fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        use MonitorEventKind::*;
        Ok(match b {
            0 => Play,
            1 => Pause,
            2 => Stop,
            3 => Next,
            4 => Prev,
            5 => Commit,
            6 => Add,
            7 => ModeChanged,
            8 => Error,
            _ => return Err(ProtocolError::BadPayload("bad MonitorEventKind tag")),
        })
    }
}

impl MonitorEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20);
        out.push(self.event as u8);
        out.extend(self.position_secs.to_ne_bytes());
        out.extend(self.duration_secs.to_ne_bytes());
        out.extend(self.modes.encode());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 1 + 8 + 8 + 3 {
            return Err(ProtocolError::BadPayload("MonitorEvent payload must be 20 bytes"));
        }
        Ok(Self {
            event: MonitorEventKind::from_u8(payload[0])?,
            position_secs: i64::from_ne_bytes(payload[1..9].try_into().unwrap()),
            duration_secs: i64::from_ne_bytes(payload[9..17].try_into().unwrap()),
            modes: ModePayload::decode(&payload[17..20])?,
        })
    }
}

/// `PositionUpdate` on the privileged player link: seconds elapsed.
pub fn encode_position(position_secs: i64) -> Vec<u8> {
    position_secs.to_ne_bytes().to_vec()
}

pub fn decode_position(payload: &[u8]) -> Result<i64, ProtocolError> {
    if payload.len() != 8 {
        return Err(ProtocolError::BadPayload("PositionUpdate payload must be 8 bytes"));
    }
    Ok(i64::from_ne_bytes(payload.try_into().unwrap()))
}

/// `TrackEnded` outcome, reported by the player worker.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished = 0,
    Stopped = 1,
    Error = 2,
}

impl Outcome {
    pub fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        Ok(match b {
            0 => Outcome::Finished,
            1 => Outcome::Stopped,
            2 => Outcome::Error,
            _ => return Err(ProtocolError::BadPayload("bad Outcome tag")),
        })
    }

    pub fn encode(self) -> Vec<u8> {
        vec![self as u8]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstring_roundtrip() {
        let enc = encode_cstring("/music/track.flac");
        assert_eq!(decode_cstring(&enc).unwrap(), "/music/track.flac");
    }

    #[test]
    fn cstring_missing_nul_is_rejected() {
        assert!(decode_cstring(b"no-terminator").is_err());
    }

    #[test]
    fn mode_payload_roundtrip() {
        let m = ModePayload { repeat_one: ModeRequest::Set, repeat_all: ModeRequest::Leave, consume: ModeRequest::Toggle };
        let enc = m.encode();
        assert_eq!(ModePayload::decode(&enc).unwrap(), m);
    }

    #[test]
    fn seek_payload_roundtrip() {
        let s = SeekPayload { value: -42, relative: true, percent: false };
        let enc = s.encode();
        assert_eq!(SeekPayload::decode(&enc).unwrap(), s);
    }

    #[test]
    fn status_reply_roundtrip_with_track() {
        let s = StatusReply {
            state: WireState::Playing,
            position_secs: 12,
            duration_secs: 180,
            cursor: 3,
            modes: ModePayload { repeat_one: ModeRequest::Leave, repeat_all: ModeRequest::Leave, consume: ModeRequest::Leave },
            current_track: Some("/a.ogg".to_string()),
        };
        let enc = s.encode();
        assert_eq!(StatusReply::decode(&enc).unwrap(), s);
    }

    #[test]
    fn status_reply_roundtrip_without_track() {
        let s = StatusReply {
            state: WireState::Stopped,
            position_secs: 0,
            duration_secs: 0,
            cursor: -1,
            modes: ModePayload { repeat_one: ModeRequest::Leave, repeat_all: ModeRequest::Leave, consume: ModeRequest::Leave },
            current_track: None,
        };
        let enc = s.encode();
        assert_eq!(StatusReply::decode(&enc).unwrap(), s);
    }

    #[test]
    fn monitor_event_roundtrip() {
        let e = MonitorEvent {
            event: MonitorEventKind::Next,
            position_secs: 5,
            duration_secs: 200,
            modes: ModePayload { repeat_one: ModeRequest::Leave, repeat_all: ModeRequest::Set, consume: ModeRequest::Unset },
        };
        let enc = e.encode();
        assert_eq!(MonitorEvent::decode(&enc).unwrap(), e);
    }
}
