//! `PlayState` and `PlaybackModes`.

use cadence_proto::message::{ModePayload, ModeRequest, WireState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Playing,
    Paused,
}

impl PlayState {
    pub fn to_wire(self) -> WireState {
        match self {
            PlayState::Stopped => WireState::Stopped,
            PlayState::Playing => WireState::Playing,
            PlayState::Paused => WireState::Paused,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackModes {
    pub repeat_one: bool,
    pub repeat_all: bool,
    pub consume: bool,
}

impl PlaybackModes {
    /// Apply a tri-state request to each of the three fields. `Leave`
    /// keeps, `Set` forces true, `Unset` forces false, `Toggle` flips.
    /// Idempotent when every field is `Leave`.
    pub fn merge(&mut self, req: ModePayload) {
        Self::apply(&mut self.repeat_one, req.repeat_one);
        Self::apply(&mut self.repeat_all, req.repeat_all);
        Self::apply(&mut self.consume, req.consume);
    }

    fn apply(field: &mut bool, req: ModeRequest) {
        *field = match req {
            ModeRequest::Leave => *field,
            ModeRequest::Set => true,
            ModeRequest::Unset => false,
            ModeRequest::Toggle => !*field,
        };
    }

    pub fn to_wire(self) -> ModePayload {
        ModePayload {
            repeat_one: if self.repeat_one { ModeRequest::Set } else { ModeRequest::Unset },
            repeat_all: if self.repeat_all { ModeRequest::Set } else { ModeRequest::Unset },
            consume: if self.consume { ModeRequest::Set } else { ModeRequest::Unset },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leave() -> ModePayload {
        ModePayload { repeat_one: ModeRequest::Leave, repeat_all: ModeRequest::Leave, consume: ModeRequest::Leave }
    }

    #[test]
    fn leave_all_is_idempotent() {
        let mut modes = PlaybackModes { repeat_one: true, repeat_all: false, consume: true };
        let before = modes;
        modes.merge(leave());
        assert_eq!(modes, before);
    }

    #[test]
    fn toggle_flips() {
        let mut modes = PlaybackModes::default();
        modes.merge(ModePayload { repeat_one: ModeRequest::Toggle, repeat_all: ModeRequest::Leave, consume: ModeRequest::Leave });
        assert!(modes.repeat_one);
        modes.merge(ModePayload { repeat_one: ModeRequest::Toggle, repeat_all: ModeRequest::Leave, consume: ModeRequest::Leave });
        assert!(!modes.repeat_one);
    }

    #[test]
    fn set_and_unset_force_value_regardless_of_prior_state() {
        let mut modes = PlaybackModes { repeat_one: true, repeat_all: true, consume: true };
        modes.merge(ModePayload { repeat_one: ModeRequest::Unset, repeat_all: ModeRequest::Set, consume: ModeRequest::Unset });
        assert!(!modes.repeat_one);
        assert!(modes.repeat_all);
        assert!(!modes.consume);
    }
}
