use crate::provider::{ASSISTANT_AUDIO_STARTED, ASSISTANT_AUDIO_STOPPED};

/// What to do with the local microphone after observing an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicGate {
    Mute,
    Unmute,
}

/// Tracks whose turn it is. Only the two assistant audio markers move it.
#[derive(Debug, Default, Clone)]
pub struct TurnArbiter {
    ai_speaking: bool,
}

impl TurnArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ai_speaking(&self) -> bool {
        self.ai_speaking
    }

    /// Feed an inbound event type; returns the mic action it implies.
    pub fn observe(&mut self, event_type: &str) -> Option<MicGate> {
        match event_type {
            ASSISTANT_AUDIO_STARTED => {
                self.ai_speaking = true;
                Some(MicGate::Mute)
            }
            ASSISTANT_AUDIO_STOPPED => {
                self.ai_speaking = false;
                Some(MicGate::Unmute)
            }
            _ => None,
        }
    }

    /// User turns are refused while the assistant holds the floor.
    pub fn allows_user_turn(&self) -> bool {
        !self.ai_speaking
    }

    pub fn reset(&mut self) {
        self.ai_speaking = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggles_on_audio_markers() {
        let mut arb = TurnArbiter::new();
        assert!(arb.allows_user_turn());

        assert_eq!(arb.observe(ASSISTANT_AUDIO_STARTED), Some(MicGate::Mute));
        assert!(arb.ai_speaking());
        assert!(!arb.allows_user_turn());

        assert_eq!(arb.observe(ASSISTANT_AUDIO_STOPPED), Some(MicGate::Unmute));
        assert!(!arb.ai_speaking());
        assert!(arb.allows_user_turn());
    }

    #[test]
    fn other_events_do_not_move_the_turn() {
        let mut arb = TurnArbiter::new();
        arb.observe(ASSISTANT_AUDIO_STARTED);
        for kind in [
            "output_audio_buffer.cleared",
            "response.done",
            "response.output_audio.done",
            "input_audio_buffer.speech_started",
        ] {
            assert_eq!(arb.observe(kind), None);
            assert!(arb.ai_speaking(), "{kind} changed the turn");
        }
    }
}
