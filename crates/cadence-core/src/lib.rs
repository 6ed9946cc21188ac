//! Domain types and the shared event core, used by both the daemon and
//! the player worker binaries.

pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod persist;
pub mod playlist;
pub mod state;
pub mod transaction;

pub use connection::{ConnKey, Slab, TokenIndex};
pub use event_loop::{EventCore, IoToken, Readiness, TimerId};
pub use playlist::Playlist;
pub use state::{PlaybackModes, PlayState};
pub use transaction::{Transaction, TransactionError};
