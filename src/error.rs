/// Everything that can go wrong while opening or running a realtime session.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Token endpoint unreachable, non-2xx, or returned a malformed body.
    #[error("credential fetch failed: {0}")]
    Credential(String),

    /// Microphone missing or access denied.
    #[error("microphone unavailable: {0}")]
    MediaAccess(String),

    /// Handshake HTTP failure, malformed answer, or peer setup failure.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Send attempted while the event channel was not open.
    #[error("event channel not open: {0}")]
    ChannelSend(String),

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// User turn rejected because the assistant is still speaking.
    #[error("assistant is speaking")]
    AssistantSpeaking,
}

impl SessionError {
    /// Errors that leave the session inactive until the user starts it again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::MediaAccess(_) | SessionError::ReconnectExhausted { .. }
        )
    }

    /// Whether a failed start with this error goes through the reconnection
    /// policy. Credential failures only do so when they happen during a retry.
    pub fn retries_via_policy(&self, during_reconnect: bool) -> bool {
        match self {
            SessionError::Negotiation(_) => true,
            SessionError::Credential(_) => during_reconnect,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
