pub mod rtc;

use crate::credential::Credential;
use crate::error::Result;
use crate::provider::session::SessionInput;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Peer-level connectivity, as reported by the transport stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States that hand control to the reconnection policy.
    pub fn is_failure(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// Notifications raised by a transport and its event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    Connection(ConnectionState),
    /// ICE agent state. Logged, never acted on.
    Ice(String),
    ChannelOpen,
    ChannelClosed,
    ChannelError(String),
    ChannelMessage(String),
}

/// Cloneable sink the transport callbacks push signals into. Every signal
/// is tagged with the generation of the negotiation that created it.
#[derive(Clone)]
pub struct SignalEmitter {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionInput>,
    live: Arc<AtomicBool>,
}

impl SignalEmitter {
    /// Returns false once the subscription is cancelled or the session is gone.
    pub fn emit(&self, signal: TransportSignal) -> bool {
        if !self.live.load(Ordering::SeqCst) {
            return false;
        }
        self.tx
            .send(SessionInput::Signal {
                generation: self.generation,
                signal,
            })
            .is_ok()
    }
}

/// Owner side of a [`SignalEmitter`] registration. Dropping it unsubscribes
/// every clone of the emitter, so callbacks left behind on a closed
/// transport cannot reach the session.
pub struct Subscription {
    live: Arc<AtomicBool>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub fn subscribe(
    generation: u64,
    tx: mpsc::UnboundedSender<SessionInput>,
) -> (SignalEmitter, Subscription) {
    let live = Arc::new(AtomicBool::new(true));
    (
        SignalEmitter {
            generation,
            tx,
            live: live.clone(),
        },
        Subscription { live },
    )
}

/// The peer connection plus its local media.
pub trait Transport: Send {
    /// Gates outgoing microphone audio without releasing the device.
    fn set_microphone_enabled(&self, enabled: bool);
    /// Releases the capture device for good.
    fn stop_local_tracks(&mut self);
    fn close(&mut self);
}

/// Reliable, ordered text channel bound to one transport.
pub trait Channel: Send {
    fn is_open(&self) -> bool;
    fn send_text(&self, text: String) -> Result<()>;
    fn close(&mut self);
}

pub struct Negotiated {
    pub transport: Box<dyn Transport>,
    pub channel: Box<dyn Channel>,
}

impl Negotiated {
    pub fn close(mut self) {
        self.channel.close();
        self.transport.close();
    }
}

/// Builds a transport and runs the offer/answer handshake. Listeners for
/// connectivity and channel events are wired to `signals` before the
/// handshake completes. On failure nothing created along the way may
/// outlive the call, including when the returned future is dropped.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(&self, credential: Credential, signals: SignalEmitter)
        -> Result<Negotiated>;
}
