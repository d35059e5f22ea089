use super::{local_timestamp, response_create, user_text_message, EventKind, RealtimeEvent};
use crate::arbitration::MicGate;
use crate::credential::CredentialFetcher;
use crate::error::{Result, SessionError};
use crate::event_log::EventLog;
use crate::settings::Settings;
use crate::state::{LinkPhase, SessionSink, SessionSnapshot, SessionState, SessionView};
use crate::transport::{
    subscribe, Channel, ConnectionState, Negotiated, Negotiator, Subscription, Transport,
    TransportSignal,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOrigin {
    Manual,
    Scheduled,
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOrigin {
    Manual,
    Scheduled,
}

/// Everything the session task reacts to, in arrival order.
pub enum SessionInput {
    Start(StartOrigin),
    Stop(StopOrigin),
    SendText(String),
    SendEvent(RealtimeEvent),
    Signal {
        generation: u64,
        signal: TransportSignal,
    },
    Negotiated {
        generation: u64,
        result: Result<Negotiated>,
    },
    RetryDue {
        generation: u64,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(3),
        }
    }
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_reconnect_attempts: settings.max_reconnect_attempts,
            reconnect_backoff: settings.reconnect_backoff(),
        }
    }
}

/// Cheap cloneable front door to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionInput>,
}

impl SessionHandle {
    fn post(&self, input: SessionInput) -> bool {
        if self.tx.send(input).is_err() {
            log::warn!("[session] task is gone; input dropped");
            return false;
        }
        true
    }

    pub fn start(&self) -> bool {
        self.post(SessionInput::Start(StartOrigin::Manual))
    }

    pub fn start_scheduled(&self) -> bool {
        self.post(SessionInput::Start(StartOrigin::Scheduled))
    }

    pub fn stop(&self) -> bool {
        self.post(SessionInput::Stop(StopOrigin::Manual))
    }

    pub fn stop_scheduled(&self) -> bool {
        self.post(SessionInput::Stop(StopOrigin::Scheduled))
    }

    /// Sends a user text turn followed by a response request.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.post(SessionInput::SendText(text.into()))
    }

    pub fn send_event(&self, event: RealtimeEvent) -> bool {
        self.post(SessionInput::SendEvent(event))
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.post(SessionInput::Snapshot(reply)) {
            return None;
        }
        rx.await.ok()
    }

    /// Stops the session and ends the task.
    pub fn shutdown(&self) -> bool {
        self.post(SessionInput::Shutdown)
    }
}

/// Spawns the session task. All session state lives inside it; the
/// returned handle only posts inputs.
pub fn spawn(
    config: SessionConfig,
    credentials: Arc<dyn CredentialFetcher>,
    negotiator: Arc<dyn Negotiator>,
    sink: Box<dyn SessionSink>,
) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = SessionActor {
        config,
        credentials,
        negotiator,
        sink,
        tx: tx.downgrade(),
        state: SessionState::default(),
        generation: 0,
        link: Link::Idle,
        retry: None,
        log: EventLog::new(),
    };
    let task = tokio::spawn(actor.run(rx));
    (SessionHandle { tx }, task)
}

enum Link {
    Idle,
    Negotiating {
        task: JoinHandle<()>,
        origin: StartOrigin,
        subscription: Subscription,
    },
    Live {
        transport: Box<dyn Transport>,
        channel: Box<dyn Channel>,
        subscription: Subscription,
    },
}

struct SessionActor {
    config: SessionConfig,
    credentials: Arc<dyn CredentialFetcher>,
    negotiator: Arc<dyn Negotiator>,
    sink: Box<dyn SessionSink>,
    tx: mpsc::WeakUnboundedSender<SessionInput>,
    state: SessionState,
    /// Bumped on every teardown; inputs tagged with an older value are stale.
    generation: u64,
    link: Link,
    retry: Option<JoinHandle<()>>,
    log: EventLog,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionInput>) {
        while let Some(input) = rx.recv().await {
            match input {
                SessionInput::Start(origin) => self.start(origin),
                SessionInput::Stop(origin) => self.stop(origin),
                SessionInput::SendText(text) => self.send_text(&text),
                SessionInput::SendEvent(event) => {
                    let _ = self.send_event(event);
                }
                SessionInput::Signal { generation, signal } => self.on_signal(generation, signal),
                SessionInput::Negotiated { generation, result } => {
                    self.on_negotiated(generation, result)
                }
                SessionInput::RetryDue { generation } => self.on_retry_due(generation),
                SessionInput::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                    continue;
                }
                SessionInput::Shutdown => {
                    self.stop(StopOrigin::Manual);
                    self.render();
                    break;
                }
            }
            self.render();
        }
        self.cancel_retry();
        self.teardown_link();
        log::info!("[session] task finished");
    }

    fn render(&mut self) {
        self.sink.render(SessionView {
            log: &self.log,
            active: self.state.active,
            ai_speaking: self.state.ai_speaking(),
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            active: self.state.active,
            ai_speaking: self.state.ai_speaking(),
            reconnect_attempts: self.state.reconnect_attempts,
            manual_disconnect: self.state.manual_disconnect,
            phase: self.phase(),
            events: self.log.events().cloned().collect(),
        }
    }

    fn phase(&self) -> LinkPhase {
        match self.link {
            Link::Negotiating { .. } => LinkPhase::Negotiating,
            Link::Live { .. } => LinkPhase::Live,
            Link::Idle if self.retry.is_some() => LinkPhase::Backoff,
            Link::Idle => LinkPhase::Idle,
        }
    }

    fn is_busy(&self) -> bool {
        self.phase() != LinkPhase::Idle
    }

    fn start(&mut self, origin: StartOrigin) {
        if origin == StartOrigin::Scheduled && (self.state.active || self.is_busy()) {
            log::debug!("[session] scheduled start ignored, session already running");
            return;
        }
        if origin != StartOrigin::Reconnect {
            self.state.manual_disconnect = false;
            self.state.reconnect_attempts = 0;
            self.cancel_retry();
        }
        // One transport at a time: anything live or in flight goes first.
        self.teardown_link();

        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let generation = self.generation;
        let (emitter, subscription) = subscribe(generation, tx.clone());
        let credentials = self.credentials.clone();
        let negotiator = self.negotiator.clone();
        log::info!(
            "[session] starting ({:?}, generation {})",
            origin,
            generation
        );
        let task = tokio::spawn(async move {
            let result = match credentials.fetch_credential().await {
                Ok(credential) => negotiator.negotiate(credential, emitter).await,
                Err(e) => Err(e),
            };
            let _ = tx.send(SessionInput::Negotiated { generation, result });
        });
        self.link = Link::Negotiating {
            task,
            origin,
            subscription,
        };
    }

    fn stop(&mut self, origin: StopOrigin) {
        if origin == StopOrigin::Scheduled && !self.state.active && !self.is_busy() {
            log::debug!("[session] scheduled stop ignored, session not running");
            return;
        }
        log::info!("[session] {:?} stop, reconnect suppressed", origin);
        self.state.manual_disconnect = true;
        self.cancel_retry();
        if let Link::Live { transport, .. } = &mut self.link {
            transport.stop_local_tracks();
        }
        self.teardown_link();
        self.state.reconnect_attempts = 0;
    }

    /// Closes the channel and transport (or abandons an in-flight
    /// negotiation) and invalidates everything tagged with the old generation.
    fn teardown_link(&mut self) {
        self.generation += 1;
        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Idle => {}
            Link::Negotiating {
                task, subscription, ..
            } => {
                subscription.cancel();
                task.abort();
                log::debug!("[session] abandoned in-flight negotiation");
            }
            Link::Live {
                mut transport,
                mut channel,
                subscription,
            } => {
                subscription.cancel();
                channel.close();
                transport.close();
                log::debug!("[session] transport closed");
            }
        }
        self.state.active = false;
        // Assistant audio ends with the transport that carried it.
        self.state.turn.reset();
    }

    fn cancel_retry(&mut self) {
        if let Some(task) = self.retry.take() {
            task.abort();
            log::debug!("[session] pending reconnect cancelled");
        }
    }

    fn on_negotiated(&mut self, generation: u64, result: Result<Negotiated>) {
        if generation != self.generation {
            match result {
                Ok(stale) => {
                    log::debug!("[session] discarding stale negotiation {}", generation);
                    stale.close();
                }
                Err(e) => {
                    log::debug!("[session] stale negotiation {} failed: {}", generation, e);
                }
            }
            return;
        }
        let (origin, subscription) = match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Negotiating {
                origin,
                subscription,
                ..
            } => (origin, subscription),
            other => {
                self.link = other;
                if let Ok(stray) = result {
                    stray.close();
                }
                return;
            }
        };

        match result {
            Ok(Negotiated { transport, channel }) => {
                log::info!("[session] negotiated (generation {})", generation);
                transport.set_microphone_enabled(self.state.turn.allows_user_turn());
                self.link = Link::Live {
                    transport,
                    channel,
                    subscription,
                };
            }
            Err(err) => {
                drop(subscription);
                log::error!("[session] start failed: {}", err);
                if err.retries_via_policy(origin == StartOrigin::Reconnect) {
                    self.handle_link_failure(&err.to_string());
                } else {
                    self.generation += 1;
                    self.state.active = false;
                    self.sink.report(&err);
                }
            }
        }
    }

    fn on_retry_due(&mut self, generation: u64) {
        self.retry = None;
        if self.state.manual_disconnect || generation != self.generation {
            log::debug!("[session] reconnect skipped");
            return;
        }
        self.start(StartOrigin::Reconnect);
    }

    /// Reconnection policy: bounded attempts with a fixed backoff.
    fn handle_link_failure(&mut self, reason: &str) {
        if self.state.manual_disconnect {
            log::info!("[session] {} after manual stop; not reconnecting", reason);
            return;
        }
        let max = self.config.max_reconnect_attempts;
        if self.state.reconnect_attempts < max {
            self.state.reconnect_attempts += 1;
            log::warn!(
                "[session] {}; reconnecting in {:?} (attempt {}/{})",
                reason,
                self.config.reconnect_backoff,
                self.state.reconnect_attempts,
                max
            );
            self.teardown_link();
            self.schedule_retry();
        } else {
            let err = SessionError::ReconnectExhausted { attempts: max };
            log::error!("[session] {}; {}", reason, err);
            self.teardown_link();
            self.sink.report(&err);
        }
    }

    fn schedule_retry(&mut self) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let generation = self.generation;
        let delay = self.config.reconnect_backoff;
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SessionInput::RetryDue { generation });
        }));
    }

    fn on_signal(&mut self, generation: u64, signal: TransportSignal) {
        if generation != self.generation {
            log::debug!("[session] stale signal from generation {}: {:?}", generation, signal);
            return;
        }
        match signal {
            TransportSignal::Connection(state) => {
                log::info!("[session] connection state: {:?}", state);
                if state == ConnectionState::Connected {
                    if self.state.reconnect_attempts > 0 {
                        log::info!(
                            "[session] recovered after {} attempt(s)",
                            self.state.reconnect_attempts
                        );
                    }
                    self.state.reconnect_attempts = 0;
                } else if state.is_failure() {
                    self.handle_link_failure(&format!("connection {:?}", state));
                }
            }
            TransportSignal::Ice(state) => {
                log::info!("[session] ice state: {}", state);
            }
            TransportSignal::ChannelOpen => {
                log::info!("[session] event channel open");
                self.state.active = true;
                self.log.clear();
            }
            TransportSignal::ChannelClosed => {
                log::info!("[session] event channel closed");
                self.state.active = false;
            }
            TransportSignal::ChannelError(e) => {
                log::error!("[session] event channel error: {}", e);
            }
            TransportSignal::ChannelMessage(text) => self.on_message(&text),
        }
    }

    fn on_message(&mut self, text: &str) {
        let mut event = match RealtimeEvent::from_json(text) {
            Ok(ev) => ev,
            Err(e) => {
                log::warn!("[session] dropping unparseable event: {}", e);
                return;
            }
        };
        if let Some(id) = event.event_id.as_deref() {
            if self.log.contains_id(id) {
                log::debug!("[session] duplicate event {} dropped", id);
                return;
            }
        }
        event.stamp_if_missing(local_timestamp());

        if let Some(gate) = self.state.turn.observe(&event.kind) {
            log::info!("[session] assistant audio {:?}", gate);
            if let Link::Live { transport, .. } = &self.link {
                transport.set_microphone_enabled(gate == MicGate::Unmute);
            }
        }
        if event.classify() == EventKind::Error {
            log::error!(
                "[session] server error: {}",
                event.display_text().unwrap_or_else(|| "unknown".into())
            );
        }
        self.log.push(event);
    }

    fn send_event(&mut self, mut event: RealtimeEvent) -> Result<()> {
        event.ensure_event_id();
        let sent = match (&self.link, event.to_json()) {
            (_, Err(e)) => Err(SessionError::ChannelSend(format!(
                "serializing {}: {}",
                event.kind, e
            ))),
            (Link::Live { channel, .. }, Ok(payload)) if channel.is_open() => {
                channel.send_text(payload)
            }
            _ => Err(SessionError::ChannelSend(format!(
                "no open channel for {}",
                event.kind
            ))),
        };
        if let Err(err) = sent {
            log::error!("[session] failed to send message: {}", err);
            self.sink.report(&err);
            return Err(err);
        }
        // The wire copy goes out without a timestamp; only the log copy gets one.
        event.stamp_if_missing(local_timestamp());
        self.log.push(event);
        Ok(())
    }

    fn send_text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.state.turn.allows_user_turn() {
            let err = SessionError::AssistantSpeaking;
            log::warn!("[session] text turn rejected: {}", err);
            self.sink.report(&err);
            return;
        }
        if self.send_event(user_text_message(text)).is_ok() {
            let _ = self.send_event(response_create());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;
    use crate::provider::{ASSISTANT_AUDIO_STARTED, ASSISTANT_AUDIO_STOPPED};
    use crate::transport::SignalEmitter;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Probe {
        credentials: usize,
        negotiations: usize,
        live_transports: usize,
        max_live_transports: usize,
        channel_open: bool,
        emitters: Vec<SignalEmitter>,
        mic_enabled: Option<bool>,
        tracks_stopped: usize,
        sent: Vec<String>,
        closes: Vec<&'static str>,
        credential_failures: VecDeque<SessionError>,
        negotiation_failures: VecDeque<SessionError>,
        reports: Vec<SessionError>,
        renders: usize,
    }

    type Shared = Arc<Mutex<Probe>>;

    struct FakeTransport {
        probe: Shared,
        closed: bool,
    }

    impl Transport for FakeTransport {
        fn set_microphone_enabled(&self, enabled: bool) {
            self.probe.lock().unwrap().mic_enabled = Some(enabled);
        }

        fn stop_local_tracks(&mut self) {
            self.probe.lock().unwrap().tracks_stopped += 1;
        }

        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                let mut p = self.probe.lock().unwrap();
                p.live_transports -= 1;
                p.closes.push("transport");
            }
        }
    }

    struct FakeChannel {
        probe: Shared,
    }

    impl Channel for FakeChannel {
        fn is_open(&self) -> bool {
            self.probe.lock().unwrap().channel_open
        }

        fn send_text(&self, text: String) -> Result<()> {
            self.probe.lock().unwrap().sent.push(text);
            Ok(())
        }

        fn close(&mut self) {
            let mut p = self.probe.lock().unwrap();
            p.channel_open = false;
            p.closes.push("channel");
        }
    }

    struct FakeNegotiator {
        probe: Shared,
    }

    #[async_trait]
    impl Negotiator for FakeNegotiator {
        async fn negotiate(
            &self,
            _credential: Credential,
            signals: SignalEmitter,
        ) -> Result<Negotiated> {
            let mut p = self.probe.lock().unwrap();
            p.negotiations += 1;
            p.emitters.push(signals);
            if let Some(err) = p.negotiation_failures.pop_front() {
                return Err(err);
            }
            p.live_transports += 1;
            p.max_live_transports = p.max_live_transports.max(p.live_transports);
            Ok(Negotiated {
                transport: Box::new(FakeTransport {
                    probe: self.probe.clone(),
                    closed: false,
                }),
                channel: Box::new(FakeChannel {
                    probe: self.probe.clone(),
                }),
            })
        }
    }

    struct FakeCredentials {
        probe: Shared,
    }

    #[async_trait]
    impl CredentialFetcher for FakeCredentials {
        async fn fetch_credential(&self) -> Result<Credential> {
            let mut p = self.probe.lock().unwrap();
            p.credentials += 1;
            match p.credential_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(Credential::new(format!("ek_{}", p.credentials))),
            }
        }
    }

    struct ProbeSink {
        probe: Shared,
    }

    impl SessionSink for ProbeSink {
        fn render(&mut self, _view: SessionView<'_>) {
            self.probe.lock().unwrap().renders += 1;
        }

        fn report(&mut self, error: &SessionError) {
            self.probe.lock().unwrap().reports.push(error.clone());
        }
    }

    const BACKOFF: Duration = Duration::from_secs(3);

    fn launch() -> (SessionHandle, Shared) {
        let probe: Shared = Arc::new(Mutex::new(Probe::default()));
        let (handle, _task) = spawn(
            SessionConfig::default(),
            Arc::new(FakeCredentials {
                probe: probe.clone(),
            }),
            Arc::new(FakeNegotiator {
                probe: probe.clone(),
            }),
            Box::new(ProbeSink {
                probe: probe.clone(),
            }),
        );
        (handle, probe)
    }

    async fn settle(handle: &SessionHandle) -> SessionSnapshot {
        tokio::time::sleep(Duration::from_millis(1)).await;
        handle.snapshot().await.expect("session task running")
    }

    fn emit(probe: &Shared, signal: TransportSignal) -> bool {
        let emitter = probe.lock().unwrap().emitters.last().cloned().unwrap();
        emitter.emit(signal)
    }

    fn open_channel(probe: &Shared) {
        probe.lock().unwrap().channel_open = true;
        emit(probe, TransportSignal::ChannelOpen);
    }

    fn server_event(kind: &str, id: &str) -> TransportSignal {
        TransportSignal::ChannelMessage(format!(r#"{{"type":"{}","event_id":"{}"}}"#, kind, id))
    }

    async fn live_session() -> (SessionHandle, Shared) {
        let (handle, probe) = launch();
        handle.start();
        settle(&handle).await;
        open_channel(&probe);
        emit(&probe, TransportSignal::Connection(ConnectionState::Connected));
        let snap = settle(&handle).await;
        assert!(snap.active);
        (handle, probe)
    }

    #[tokio::test(start_paused = true)]
    async fn start_open_message_fail_and_recover() {
        let (handle, probe) = launch();
        handle.start();
        let snap = settle(&handle).await;
        assert_eq!(snap.phase, LinkPhase::Live);
        assert!(!snap.active);

        open_channel(&probe);
        let snap = settle(&handle).await;
        assert!(snap.active);
        assert!(snap.events.is_empty());

        emit(
            &probe,
            TransportSignal::ChannelMessage(
                r#"{"type":"conversation.item.create","event_id":"event_1","item":{"type":"message"}}"#
                    .into(),
            ),
        );
        let snap = settle(&handle).await;
        assert_eq!(snap.events.len(), 1);
        assert_eq!(snap.events[0].kind, "conversation.item.create");
        assert!(snap.events[0].timestamp.is_some());

        emit(&probe, TransportSignal::Connection(ConnectionState::Failed));
        let snap = settle(&handle).await;
        assert_eq!(snap.reconnect_attempts, 1);
        assert_eq!(snap.phase, LinkPhase::Backoff);
        assert!(!snap.active);
        assert_eq!(probe.lock().unwrap().live_transports, 0);
        assert_eq!(probe.lock().unwrap().negotiations, 1);

        tokio::time::sleep(BACKOFF).await;
        let snap = settle(&handle).await;
        assert_eq!(snap.phase, LinkPhase::Live);
        {
            let p = probe.lock().unwrap();
            assert_eq!(p.negotiations, 2);
            assert_eq!(p.credentials, 2, "each attempt fetches a fresh credential");
        }
        assert_eq!(snap.reconnect_attempts, 1);

        emit(&probe, TransportSignal::Connection(ConnectionState::Connected));
        let snap = settle(&handle).await;
        assert_eq!(snap.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_failure_gives_up() {
        let (handle, probe) = launch();
        handle.start();
        settle(&handle).await;

        for attempt in 1..=5 {
            emit(&probe, TransportSignal::Connection(ConnectionState::Failed));
            let snap = settle(&handle).await;
            assert_eq!(snap.reconnect_attempts, attempt);
            tokio::time::sleep(BACKOFF).await;
            settle(&handle).await;
            assert_eq!(probe.lock().unwrap().negotiations, attempt as usize + 1);
        }

        emit(&probe, TransportSignal::Connection(ConnectionState::Disconnected));
        let snap = settle(&handle).await;
        assert_eq!(snap.phase, LinkPhase::Idle);
        assert!(!snap.active);
        tokio::time::sleep(BACKOFF * 2).await;
        settle(&handle).await;

        let p = probe.lock().unwrap();
        assert_eq!(p.negotiations, 6);
        assert_eq!(p.live_transports, 0);
        assert_eq!(p.reports, vec![SessionError::ReconnectExhausted { attempts: 5 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_stop_suppresses_reconnect() {
        let (handle, probe) = live_session().await;
        handle.stop();
        let snap = settle(&handle).await;
        assert!(snap.manual_disconnect);
        assert!(!snap.active);
        assert_eq!(snap.phase, LinkPhase::Idle);
        {
            let p = probe.lock().unwrap();
            assert_eq!(p.closes, ["channel", "transport"]);
            assert_eq!(p.tracks_stopped, 1);
        }

        // Callbacks of the torn-down transport are unsubscribed.
        assert!(!emit(&probe, TransportSignal::Connection(ConnectionState::Failed)));
        tokio::time::sleep(BACKOFF * 2).await;
        let snap = settle(&handle).await;
        assert_eq!(snap.reconnect_attempts, 0);
        assert_eq!(probe.lock().unwrap().negotiations, 1);

        handle.start();
        let snap = settle(&handle).await;
        assert!(!snap.manual_disconnect);
        assert_eq!(probe.lock().unwrap().negotiations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_backoff_cancels_pending_retry() {
        let (handle, probe) = live_session().await;
        emit(&probe, TransportSignal::Connection(ConnectionState::Disconnected));
        let snap = settle(&handle).await;
        assert_eq!(snap.phase, LinkPhase::Backoff);

        handle.stop();
        let snap = settle(&handle).await;
        assert_eq!(snap.phase, LinkPhase::Idle);
        tokio::time::sleep(BACKOFF * 2).await;
        settle(&handle).await;
        assert_eq!(probe.lock().unwrap().negotiations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_tears_down_previous_transport_first() {
        let (handle, probe) = live_session().await;
        handle.start();
        let snap = settle(&handle).await;
        assert_eq!(snap.phase, LinkPhase::Live);
        handle.start();
        settle(&handle).await;

        let p = probe.lock().unwrap();
        assert_eq!(p.negotiations, 3);
        assert_eq!(p.live_transports, 1);
        assert_eq!(p.max_live_transports, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_server_events_are_logged_once() {
        let (handle, probe) = live_session().await;
        emit(&probe, server_event("response.output_audio_transcript.delta", "event_5"));
        emit(&probe, server_event("response.output_audio_transcript.delta", "event_5"));
        emit(&probe, server_event("response.output_audio_transcript.delta", "event_6"));
        let snap = settle(&handle).await;
        let ids: Vec<_> = snap
            .events
            .iter()
            .filter_map(|e| e.event_id.as_deref())
            .collect();
        assert_eq!(ids, ["event_6", "event_5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn assistant_turn_gates_mic_and_blocks_text() {
        let (handle, probe) = live_session().await;
        emit(&probe, server_event(ASSISTANT_AUDIO_STARTED, "event_1"));
        let snap = settle(&handle).await;
        assert!(snap.ai_speaking);
        assert_eq!(probe.lock().unwrap().mic_enabled, Some(false));

        handle.send_text("barging in");
        settle(&handle).await;
        {
            let p = probe.lock().unwrap();
            assert!(p.sent.is_empty());
            assert_eq!(p.reports, vec![SessionError::AssistantSpeaking]);
        }

        emit(&probe, server_event("response.done", "event_2"));
        assert!(settle(&handle).await.ai_speaking);

        emit(&probe, server_event(ASSISTANT_AUDIO_STOPPED, "event_3"));
        let snap = settle(&handle).await;
        assert!(!snap.ai_speaking);
        assert_eq!(probe.lock().unwrap().mic_enabled, Some(true));

        handle.send_text("my turn");
        let snap = settle(&handle).await;
        let sent = probe.lock().unwrap().sent.clone();
        assert_eq!(sent.len(), 2);
        let first: Value = serde_json::from_str(&sent[0]).unwrap();
        let second: Value = serde_json::from_str(&sent[1]).unwrap();
        assert_eq!(first["type"], "conversation.item.create");
        assert_eq!(first["item"]["content"][0]["text"], "my turn");
        assert!(first.get("timestamp").is_none());
        assert_eq!(second["type"], "response.create");

        assert_eq!(snap.events[0].kind, "response.create");
        assert_eq!(snap.events[1].kind, "conversation.item.create");
        assert_eq!(
            snap.events[1].event_id.as_deref(),
            first["event_id"].as_str(),
            "generated id is on the wire and in the log"
        );
        assert!(snap.events[1].timestamp.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_starts_with_a_fresh_turn() {
        let (handle, probe) = live_session().await;
        emit(&probe, server_event(ASSISTANT_AUDIO_STARTED, "event_1"));
        assert!(settle(&handle).await.ai_speaking);
        assert_eq!(probe.lock().unwrap().mic_enabled, Some(false));

        emit(&probe, TransportSignal::Connection(ConnectionState::Failed));
        let snap = settle(&handle).await;
        assert!(!snap.ai_speaking);

        tokio::time::sleep(BACKOFF).await;
        settle(&handle).await;
        assert_eq!(probe.lock().unwrap().negotiations, 2);
        assert_eq!(probe.lock().unwrap().mic_enabled, Some(true));
        open_channel(&probe);
        emit(&probe, TransportSignal::Connection(ConnectionState::Connected));
        let snap = settle(&handle).await;
        assert!(snap.active);
        assert!(!snap.ai_speaking);

        handle.send_text("still there?");
        settle(&handle).await;
        let p = probe.lock().unwrap();
        assert_eq!(p.sent.len(), 2);
        assert!(p.reports.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_open_channel_is_reported_not_logged() {
        let (handle, probe) = launch();
        handle.send_event(RealtimeEvent::new("response.create"));
        let snap = settle(&handle).await;
        assert!(snap.events.is_empty());
        let p = probe.lock().unwrap();
        assert!(p.sent.is_empty());
        assert!(matches!(p.reports.as_slice(), [SessionError::ChannelSend(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn supplied_event_id_is_kept() {
        let (handle, probe) = live_session().await;
        let mut ev = RealtimeEvent::new("session.update");
        ev.event_id = Some("client-7".into());
        handle.send_event(ev);
        let snap = settle(&handle).await;
        assert_eq!(snap.events[0].event_id.as_deref(), Some("client-7"));
        assert!(probe.lock().unwrap().sent[0].contains("client-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn negotiation_error_goes_through_reconnect_policy() {
        let (handle, probe) = launch();
        probe
            .lock()
            .unwrap()
            .negotiation_failures
            .push_back(SessionError::Negotiation("502 Bad Gateway".into()));
        handle.start();
        let snap = settle(&handle).await;
        assert_eq!(snap.reconnect_attempts, 1);
        assert_eq!(snap.phase, LinkPhase::Backoff);

        tokio::time::sleep(BACKOFF).await;
        let snap = settle(&handle).await;
        assert_eq!(snap.phase, LinkPhase::Live);
        assert!(probe.lock().unwrap().reports.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn media_access_error_is_fatal() {
        let (handle, probe) = launch();
        probe
            .lock()
            .unwrap()
            .negotiation_failures
            .push_back(SessionError::MediaAccess("permission denied".into()));
        handle.start();
        let snap = settle(&handle).await;
        assert_eq!(snap.phase, LinkPhase::Idle);
        assert_eq!(snap.reconnect_attempts, 0);
        tokio::time::sleep(BACKOFF * 2).await;
        settle(&handle).await;

        let p = probe.lock().unwrap();
        assert_eq!(p.negotiations, 1);
        assert!(matches!(p.reports.as_slice(), [SessionError::MediaAccess(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn credential_error_on_first_attempt_is_reported_without_retry() {
        let (handle, probe) = launch();
        probe
            .lock()
            .unwrap()
            .credential_failures
            .push_back(SessionError::Credential("500".into()));
        handle.start();
        let snap = settle(&handle).await;
        assert_eq!(snap.phase, LinkPhase::Idle);
        tokio::time::sleep(BACKOFF * 2).await;
        settle(&handle).await;

        let p = probe.lock().unwrap();
        assert_eq!(p.credentials, 1);
        assert_eq!(p.negotiations, 0);
        assert!(matches!(p.reports.as_slice(), [SessionError::Credential(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn credential_error_during_reconnect_counts_as_attempt() {
        let (handle, probe) = live_session().await;
        emit(&probe, TransportSignal::Connection(ConnectionState::Failed));
        settle(&handle).await;
        probe
            .lock()
            .unwrap()
            .credential_failures
            .push_back(SessionError::Credential("timeout".into()));

        tokio::time::sleep(BACKOFF).await;
        let snap = settle(&handle).await;
        assert_eq!(snap.reconnect_attempts, 2);
        assert_eq!(snap.phase, LinkPhase::Backoff);
        assert!(probe.lock().unwrap().reports.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn channel_close_marks_inactive_without_reconnect() {
        let (handle, probe) = live_session().await;
        emit(&probe, TransportSignal::ChannelClosed);
        let snap = settle(&handle).await;
        assert!(!snap.active);
        assert_eq!(snap.phase, LinkPhase::Live);
        tokio::time::sleep(BACKOFF * 2).await;
        settle(&handle).await;
        assert_eq!(probe.lock().unwrap().negotiations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_open_clears_the_log() {
        let (handle, probe) = live_session().await;
        emit(&probe, server_event("session.created", "event_1"));
        assert_eq!(settle(&handle).await.events.len(), 1);
        emit(&probe, TransportSignal::ChannelOpen);
        assert!(settle(&handle).await.events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_timestamps_are_preserved_or_stamped() {
        let (handle, probe) = live_session().await;
        emit(
            &probe,
            TransportSignal::ChannelMessage(
                r#"{"type":"session.updated","event_id":"event_1","timestamp":"08:00:00"}"#.into(),
            ),
        );
        emit(&probe, TransportSignal::ChannelMessage("not json".into()));
        emit(&probe, server_event("session.created", "event_2"));
        let snap = settle(&handle).await;
        assert_eq!(snap.events.len(), 2);
        assert_eq!(snap.events[1].timestamp.as_deref(), Some("08:00:00"));
        assert!(snap.events[0].timestamp.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_start_defers_to_running_session() {
        let (handle, probe) = live_session().await;
        handle.start_scheduled();
        settle(&handle).await;
        assert_eq!(probe.lock().unwrap().negotiations, 1);

        handle.stop();
        settle(&handle).await;
        handle.stop_scheduled();
        handle.start_scheduled();
        let snap = settle(&handle).await;
        assert!(!snap.manual_disconnect);
        assert_eq!(probe.lock().unwrap().negotiations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_signals_are_ignored_after_restart() {
        let (handle, probe) = live_session().await;
        let old = probe.lock().unwrap().emitters[0].clone();
        handle.start();
        settle(&handle).await;
        assert!(!old.emit(TransportSignal::Connection(ConnectionState::Failed)));
        let snap = settle(&handle).await;
        assert_eq!(snap.reconnect_attempts, 0);
        assert_eq!(snap.phase, LinkPhase::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn every_input_renders() {
        let (handle, probe) = launch();
        handle.start();
        settle(&handle).await;
        assert!(probe.lock().unwrap().renders >= 2);
        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(handle.snapshot().await.is_none());
    }
}
