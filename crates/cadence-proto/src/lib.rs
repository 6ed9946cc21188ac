//! Wire protocol shared by the daemon's control endpoint and the player worker.
//!
//! Every message — client command, server reply, broadcast event, or the
//! privileged commands main sends to the player — travels as one *frame*:
//! a fixed header followed by a payload of `len` bytes. A frame may also
//! carry exactly one file descriptor, passed out of band via `SCM_RIGHTS`
//! ancillary data riding alongside the header's first byte.
//!
//! ```text
//! +------+-----+-----+--------+-----+----------------+
//! | type | pid | uid | has_fd | len | payload[len]   |
//! |  u8  | u32 | u32 |   u8   | u32 |                |
//! +------+-----+-----+--------+-----+----------------+
//! ```
//!
//! All integers are native-endian; this protocol never crosses a network
//! link, only local stream sockets, so there is no wire-endianness concern.

mod creds;
mod fd;
mod frame;
pub mod message;

pub use fd::FdPassingError;
pub use frame::{Connection, Frame, Progress, HEADER_LEN};

use thiserror::Error;

/// Closed set of frame types. Command variants travel client → daemon;
/// response/event variants travel the other way (or daemon → player for
/// the privileged link).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Play = 1,
    Pause = 2,
    Stop = 3,
    Next = 4,
    Prev = 5,
    Jump = 6,
    Mode = 7,
    Flush = 8,
    Commit = 9,
    Begin = 10,
    Add = 11,
    Seek = 12,
    Monitor = 13,
    Status = 14,
    Show = 15,
    TogglePlay = 24,

    Error = 16,
    PlaylistEntry = 17,
    StatusReply = 18,
    MonitorEvent = 19,

    /// Privileged link only: main → player, "resume decoding" (as opposed
    /// to `Play`, which always hands over a fresh fd).
    Resume = 20,
    /// Privileged link only: player → main lifecycle/position reports.
    TrackStarted = 21,
    PositionUpdate = 22,
    TrackEnded = 23,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        use MessageType::*;
        Ok(match b {
            1 => Play,
            2 => Pause,
            3 => Stop,
            4 => Next,
            5 => Prev,
            6 => Jump,
            7 => Mode,
            8 => Flush,
            9 => Commit,
            10 => Begin,
            11 => Add,
            12 => Seek,
            13 => Monitor,
            14 => Status,
            15 => Show,
            16 => Error,
            17 => PlaylistEntry,
            18 => StatusReply,
            19 => MonitorEvent,
            20 => Resume,
            21 => TrackStarted,
            22 => PositionUpdate,
            23 => TrackEnded,
            24 => TogglePlay,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// A frame that failed validation is always fatal to the connection it
/// arrived on — never fatal to the daemon itself.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame type {0:#x}")]
    UnknownType(u8),
    #[error("frame payload too long ({0} bytes)")]
    PayloadTooLong(u32),
    #[error("malformed payload: {0}")]
    BadPayload(&'static str),
    #[error("fd passing error: {0}")]
    Fd(#[from] FdPassingError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frames above this size are treated as corrupt (over-long).
pub const MAX_PAYLOAD: u32 = 1 << 20;
