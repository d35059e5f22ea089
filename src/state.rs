use crate::arbitration::TurnArbiter;
use crate::error::SessionError;
use crate::event_log::EventLog;
use crate::provider::RealtimeEvent;

/// The logical conversation. Mutated only by the session actor.
#[derive(Debug, Default, Clone)]
pub struct SessionState {
    /// Event channel is open.
    pub active: bool,
    pub turn: TurnArbiter,
    pub reconnect_attempts: u32,
    /// Set by a deliberate stop; suppresses automatic reconnection until
    /// the next manual or scheduled start.
    pub manual_disconnect: bool,
}

impl SessionState {
    pub fn ai_speaking(&self) -> bool {
        self.turn.ai_speaking()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    Negotiating,
    Live,
    /// Waiting out the reconnect backoff.
    Backoff,
}

/// Borrowed view handed to the UI after every mutation.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    pub log: &'a EventLog,
    pub active: bool,
    pub ai_speaking: bool,
}

/// Owned copy of the session, for callers outside the actor.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub active: bool,
    pub ai_speaking: bool,
    pub reconnect_attempts: u32,
    pub manual_disconnect: bool,
    pub phase: LinkPhase,
    /// Newest first.
    pub events: Vec<RealtimeEvent>,
}

/// Rendering layer. Called from the session task, so implementations
/// should not block.
pub trait SessionSink: Send {
    fn render(&mut self, view: SessionView<'_>);

    /// Errors the user should see (fatal start failures, rejected sends).
    fn report(&mut self, error: &SessionError) {
        let _ = error;
    }
}
