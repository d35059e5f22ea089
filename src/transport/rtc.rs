//! WebRTC transport: one peer connection carrying the microphone track,
//! the assistant's audio, and the `oai-events` data channel.

use super::{Channel, ConnectionState, Negotiated, Negotiator, SignalEmitter, Transport, TransportSignal};
use crate::audio::{self, MicCapture, Speaker, FRAME_DURATION, FRAME_SAMPLES, PCMU_RATE, ULAW_SILENCE};
use crate::credential::Credential;
use crate::error::{Result, SessionError};
use crate::provider::openai::HandshakeEndpoint;
use crate::settings::Settings;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn rtc_err(e: webrtc::Error) -> SessionError {
    SessionError::Negotiation(e.to_string())
}

fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: PCMU_RATE,
        channels: 1,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn close_peer(pc: Arc<RTCPeerConnection>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = pc.close().await {
                    log::warn!("[rtc] closing peer connection: {}", e);
                }
            });
        }
        Err(_) => log::warn!("[rtc] no runtime to close peer connection on"),
    }
}

/// Closes the peer connection unless the handshake got all the way through.
struct PeerGuard {
    pc: Arc<RTCPeerConnection>,
    armed: bool,
}

impl PeerGuard {
    fn new(pc: RTCPeerConnection) -> Self {
        Self {
            pc: Arc::new(pc),
            armed: true,
        }
    }

    fn disarm(mut self) -> Arc<RTCPeerConnection> {
        self.armed = false;
        self.pc.clone()
    }
}

impl std::ops::Deref for PeerGuard {
    type Target = Arc<RTCPeerConnection>;

    fn deref(&self) -> &Self::Target {
        &self.pc
    }
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        if self.armed {
            log::debug!("[rtc] abandoning half-built peer connection");
            close_peer(self.pc.clone());
        }
    }
}

/// Holds the task currently playing the remote track.
#[derive(Default)]
struct PlaybackSlot {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackSlot {
    fn replace(&self, task: JoinHandle<()>) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(old) = slot.replace(task) {
                old.abort();
            }
        }
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(old) = slot.take() {
                old.abort();
            }
        }
    }
}

pub struct RtcNegotiator {
    endpoint: HandshakeEndpoint,
    channel_label: String,
    ice_servers: Vec<String>,
    mic_device: Option<String>,
    speaker_device: Option<String>,
}

impl RtcNegotiator {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            endpoint: HandshakeEndpoint::new(&settings.realtime_url, &settings.model),
            channel_label: settings.data_channel_label.clone(),
            ice_servers: settings.ice_servers.clone(),
            mic_device: settings.mic_device_name().map(str::to_string),
            speaker_device: settings.speaker_device_name().map(str::to_string),
        }
    }

    async fn new_peer_connection(&self) -> Result<RTCPeerConnection> {
        // Only G.711 is offered, so the media path needs no codec library.
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: pcmu_capability(),
                    payload_type: 0,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(rtc_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        api.new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await
        .map_err(rtc_err)
    }
}

#[async_trait]
impl Negotiator for RtcNegotiator {
    async fn negotiate(&self, credential: Credential, signals: SignalEmitter) -> Result<Negotiated> {
        let (frames_tx, frames_rx) = mpsc::channel::<Vec<i16>>(64);
        let mic_device = self.mic_device.clone();
        let capture = tokio::task::spawn_blocking(move || MicCapture::start(mic_device.as_deref(), frames_tx))
            .await
            .map_err(|e| SessionError::MediaAccess(format!("capture task failed: {}", e)))??;

        let pc = PeerGuard::new(self.new_peer_connection().await?);
        let playback = Arc::new(PlaybackSlot::default());
        wire_peer(&pc, &signals, &playback, self.speaker_device.clone());

        let track = Arc::new(TrackLocalStaticSample::new(
            pcmu_capability(),
            "audio".to_owned(),
            "realtalk".to_owned(),
        ));
        let rtp_sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_err)?;
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let dc = pc
            .create_data_channel(&self.channel_label, None)
            .await
            .map_err(rtc_err)?;
        wire_channel(&dc, &signals);

        let offer = pc.create_offer(None).await.map_err(rtc_err)?;
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await.map_err(rtc_err)?;
        let _ = gathered.recv().await;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| SessionError::Negotiation("no local description after gathering".into()))?;

        let answer_sdp = self.endpoint.exchange(&local.sdp, &credential).await?;
        let answer = RTCSessionDescription::answer(answer_sdp).map_err(rtc_err)?;
        pc.set_remote_description(answer).await.map_err(rtc_err)?;
        log::info!("[rtc] remote description applied");

        let mic_enabled = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(pump_microphone(frames_rx, track, mic_enabled.clone()));

        Ok(Negotiated {
            transport: Box::new(RtcTransport {
                pc: Some(pc.disarm()),
                capture: Some(capture),
                mic_enabled,
                pump: Some(pump),
                playback,
            }),
            channel: Box::new(RtcChannel::new(dc)),
        })
    }
}

fn wire_peer(
    pc: &RTCPeerConnection,
    signals: &SignalEmitter,
    playback: &Arc<PlaybackSlot>,
    speaker_device: Option<String>,
) {
    let emitter = signals.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        log::info!("[rtc] peer connection state: {}", s);
        emitter.emit(TransportSignal::Connection(map_state(s)));
        Box::pin(async {})
    }));

    let emitter = signals.clone();
    pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        emitter.emit(TransportSignal::Ice(s.to_string()));
        Box::pin(async {})
    }));

    let slot = playback.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let slot = slot.clone();
        let device = speaker_device.clone();
        Box::pin(async move {
            if track.kind() != RTPCodecType::Audio {
                return;
            }
            log::info!(
                "[rtc] remote audio track ({})",
                track.codec().capability.mime_type
            );
            slot.replace(tokio::spawn(play_remote(track, device)));
        })
    }));
}

fn wire_channel(dc: &Arc<RTCDataChannel>, signals: &SignalEmitter) {
    let emitter = signals.clone();
    dc.on_open(Box::new(move || {
        emitter.emit(TransportSignal::ChannelOpen);
        Box::pin(async {})
    }));

    let emitter = signals.clone();
    dc.on_close(Box::new(move || {
        emitter.emit(TransportSignal::ChannelClosed);
        Box::pin(async {})
    }));

    let emitter = signals.clone();
    dc.on_error(Box::new(move |err: webrtc::Error| {
        emitter.emit(TransportSignal::ChannelError(err.to_string()));
        Box::pin(async {})
    }));

    let emitter = signals.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => {
                emitter.emit(TransportSignal::ChannelMessage(text));
            }
            Err(_) => log::warn!("[rtc] dropping non-UTF-8 message ({} bytes)", msg.data.len()),
        }
        Box::pin(async {})
    }));
}

async fn pump_microphone(
    mut frames: mpsc::Receiver<Vec<i16>>,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
) {
    let silence = Bytes::from(vec![ULAW_SILENCE; FRAME_SAMPLES]);
    while let Some(frame) = frames.recv().await {
        let data = if enabled.load(Ordering::SeqCst) {
            Bytes::from(frame.iter().map(|&s| audio::linear_to_ulaw(s)).collect::<Vec<u8>>())
        } else {
            silence.clone()
        };
        let sample = Sample {
            data,
            duration: FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            log::debug!("[rtc] dropped mic frame: {}", e);
        }
    }
    log::debug!("[rtc] microphone pump finished");
}

async fn play_remote(track: Arc<TrackRemote>, device: Option<String>) {
    let mut speaker = match tokio::task::spawn_blocking(move || Speaker::start(device.as_deref())).await {
        Ok(Ok(speaker)) => speaker,
        Ok(Err(e)) => {
            log::error!("[rtc] playback unavailable: {}", e);
            return;
        }
        Err(e) => {
            log::error!("[rtc] playback task failed: {}", e);
            return;
        }
    };
    let mut pcm: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES);
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                pcm.clear();
                pcm.extend(packet.payload.iter().map(|&b| audio::ulaw_to_linear(b)));
                speaker.push(&pcm);
            }
            Err(e) => {
                log::debug!("[rtc] remote track ended: {}", e);
                break;
            }
        }
    }
}

pub struct RtcTransport {
    pc: Option<Arc<RTCPeerConnection>>,
    capture: Option<MicCapture>,
    mic_enabled: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    playback: Arc<PlaybackSlot>,
}

impl Transport for RtcTransport {
    fn set_microphone_enabled(&self, enabled: bool) {
        self.mic_enabled.store(enabled, Ordering::SeqCst);
        log::info!("[rtc] microphone {}", if enabled { "enabled" } else { "muted" });
    }

    fn stop_local_tracks(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    fn close(&mut self) {
        self.stop_local_tracks();
        self.playback.clear();
        if let Some(pc) = self.pc.take() {
            close_peer(pc);
        }
    }
}

impl Drop for RtcTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sends go through a single writer task so they leave in call order.
pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
    outbox: Option<mpsc::UnboundedSender<String>>,
}

impl RtcChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        let (outbox, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = dc.clone();
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = writer.send_text(text).await {
                    log::error!("[rtc] data channel send failed: {}", e);
                }
            }
        });
        Self {
            dc,
            outbox: Some(outbox),
        }
    }
}

impl Channel for RtcChannel {
    fn is_open(&self) -> bool {
        self.outbox.is_some() && self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(SessionError::ChannelSend(format!(
                "data channel is {}",
                self.dc.ready_state()
            )));
        }
        match &self.outbox {
            Some(outbox) => outbox
                .send(text)
                .map_err(|_| SessionError::ChannelSend("writer stopped".into())),
            None => Err(SessionError::ChannelSend("data channel closed".into())),
        }
    }

    fn close(&mut self) {
        if self.outbox.take().is_none() {
            return;
        }
        let dc = self.dc.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = dc.close().await {
                    log::warn!("[rtc] closing data channel: {}", e);
                }
            });
        }
    }
}

impl Drop for RtcChannel {
    fn drop(&mut self) {
        self.close();
    }
}
