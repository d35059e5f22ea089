use crate::error::SessionError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::collections::VecDeque;
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// G.711 runs at 8 kHz mono; frames are 20 ms.
pub const PCMU_RATE: u32 = 8000;
pub const FRAME_SAMPLES: usize = 160;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
/// µ-law encoding of a zero sample.
pub const ULAW_SILENCE: u8 = 0xFF;

const FALLBACK_CAPTURE_RATE: u32 = 48000;
/// Cap on queued playback audio, in seconds.
const PLAYBACK_MAX_BUFFER_SECS: usize = 2;

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;
    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) as i32 | mantissa) as u8
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Live microphone capture, resampled to 8 kHz and cut into 20 ms frames.
///
/// The cpal stream lives on its own thread; dropping or stopping the
/// capture releases the device.
pub struct MicCapture {
    stop_tx: Option<std_mpsc::Sender<()>>,
}

impl MicCapture {
    /// Blocks until the device is open. Run it off the async executor.
    pub fn start(
        device_name: Option<&str>,
        frames_tx: mpsc::Sender<Vec<i16>>,
    ) -> Result<Self, SessionError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<String, String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let name = device_name.map(str::to_string);

        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let (raw_tx, raw_rx) = std_mpsc::sync_channel::<Vec<f32>>(128);
                let (stream, input_rate) = match open_input(name.as_deref(), raw_tx) {
                    Ok((stream, label, rate)) => {
                        let _ = ready_tx.send(Ok(label));
                        (stream, rate)
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                frame_capture(raw_rx, stop_rx, frames_tx, input_rate);
                drop(stream);
                log::info!("[audio] capture stopped");
            })
            .map_err(|e| SessionError::MediaAccess(format!("spawning capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(label)) => {
                log::info!("[audio] capturing from {}", label);
                Ok(Self {
                    stop_tx: Some(stop_tx),
                })
            }
            Ok(Err(e)) => Err(SessionError::MediaAccess(e)),
            Err(_) => Err(SessionError::MediaAccess("capture thread exited".into())),
        }
    }

    pub fn stop(&mut self) {
        // Dropping the sender wakes the capture thread, which then exits.
        self.stop_tx.take();
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input(
    device_name: Option<&str>,
    raw_tx: std_mpsc::SyncSender<Vec<f32>>,
) -> Result<(cpal::Stream, String, u32), String> {
    let host = cpal::default_host();
    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| format!("Failed to list devices: {}", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("Device '{}' not found", name))?
    } else {
        host.default_input_device()
            .ok_or("No default input device")?
    };
    let label = device.name().unwrap_or_else(|_| "unknown".into());

    let config = match try_config(&device, PCMU_RATE)
        .or_else(|| try_config(&device, FALLBACK_CAPTURE_RATE))
    {
        Some(cfg) => cfg,
        None => {
            let default = device
                .default_input_config()
                .map_err(|e| format!("No input config: {}", e))?;
            StreamConfig {
                channels: default.channels(),
                sample_rate: default.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            }
        }
    };
    let rate = config.sample_rate.0;
    let channels = config.channels as usize;
    log::debug!("[audio] input config: {}Hz, {}ch", rate, channels);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = if channels > 1 {
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .collect()
                } else {
                    data.to_vec()
                };
                let _ = raw_tx.try_send(mono);
            },
            |err| {
                log::error!("[audio] input stream error: {}", err);
            },
            None,
        )
        .map_err(|e| format!("Failed to build stream: {}", e))?;
    stream
        .play()
        .map_err(|e| format!("Failed to start stream: {}", e))?;
    Ok((stream, label, rate))
}

fn try_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported = device.supported_input_configs().ok()?;
    let mut fallback_channels = None;
    for range in supported {
        if range.min_sample_rate().0 <= rate && range.max_sample_rate().0 >= rate {
            if range.channels() == 1 {
                fallback_channels = Some(1);
                break;
            }
            fallback_channels.get_or_insert(range.channels());
        }
    }
    fallback_channels.map(|channels| StreamConfig {
        channels,
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    })
}

fn frame_capture(
    raw_rx: std_mpsc::Receiver<Vec<f32>>,
    stop_rx: std_mpsc::Receiver<()>,
    frames_tx: mpsc::Sender<Vec<i16>>,
    input_rate: u32,
) {
    let mut resampler = ResamplerState::default();
    let mut pending: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES * 2);
    loop {
        if let Err(TryRecvError::Disconnected) = stop_rx.try_recv() {
            break;
        }
        let samples = match raw_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(s) => s,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let resampled = resample_linear(&samples, input_rate, PCMU_RATE, &mut resampler);
        pending.extend(
            resampled
                .iter()
                .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16),
        );
        while pending.len() >= FRAME_SAMPLES {
            let frame: Vec<i16> = pending.drain(..FRAME_SAMPLES).collect();
            if let Err(mpsc::error::TrySendError::Closed(_)) = frames_tx.try_send(frame) {
                return;
            }
        }
    }
}

/// Plays 8 kHz PCM on an output device.
pub struct Speaker {
    queue: Arc<Mutex<VecDeque<f32>>>,
    resampler: ResamplerState,
    output_rate: u32,
    max_buffered: usize,
    _stop_tx: std_mpsc::Sender<()>,
}

impl Speaker {
    /// Blocks until the device is open. Run it off the async executor.
    pub fn start(device_name: Option<&str>) -> Result<Self, String> {
        let queue: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let name = device_name.map(str::to_string);
        let queue_out = queue.clone();

        std::thread::Builder::new()
            .name("speaker".into())
            .spawn(move || {
                let stream = match open_output(name.as_deref(), queue_out) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Returns once the Speaker (and its sender) is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| format!("Failed to spawn playback thread: {}", e))?;

        let output_rate = ready_rx
            .recv()
            .map_err(|_| "playback thread exited".to_string())??;
        Ok(Self {
            queue,
            resampler: ResamplerState::default(),
            output_rate,
            max_buffered: output_rate as usize * PLAYBACK_MAX_BUFFER_SECS,
            _stop_tx: stop_tx,
        })
    }

    pub fn push(&mut self, pcm: &[i16]) {
        let samples: Vec<f32> = pcm.iter().map(|&s| s as f32 / 32768.0).collect();
        let resampled = resample_linear(&samples, PCMU_RATE, self.output_rate, &mut self.resampler);
        if let Ok(mut q) = self.queue.lock() {
            q.extend(resampled);
            let excess = q.len().saturating_sub(self.max_buffered);
            if excess > 0 {
                q.drain(..excess);
            }
        }
    }
}

fn open_output(
    device_name: Option<&str>,
    queue: Arc<Mutex<VecDeque<f32>>>,
) -> Result<(cpal::Stream, u32), String> {
    let host = cpal::default_host();
    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| format!("Failed to list devices: {}", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("Device '{}' not found", name))?
    } else {
        host.default_output_device()
            .ok_or("No default output device")?
    };
    let default = device
        .default_output_config()
        .map_err(|e| format!("No output config: {}", e))?;
    let config: StreamConfig = default.config();
    let channels = config.channels as usize;
    let rate = config.sample_rate.0;
    log::info!(
        "[audio] playing on {} ({}Hz, {}ch)",
        device.name().unwrap_or_else(|_| "unknown".into()),
        rate,
        channels
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut q = match queue.lock() {
                    Ok(q) => q,
                    Err(_) => {
                        data.fill(0.0);
                        return;
                    }
                };
                for frame in data.chunks_mut(channels.max(1)) {
                    let v = q.pop_front().unwrap_or(0.0);
                    frame.fill(v);
                }
            },
            |err| {
                log::error!("[audio] output stream error: {}", err);
            },
            None,
        )
        .map_err(|e| format!("Failed to build output stream: {}", e))?;
    stream
        .play()
        .map_err(|e| format!("Failed to start output stream: {}", e))?;
    Ok((stream, rate))
}

#[derive(Default)]
struct ResamplerState {
    t: f64,
    last_sample: f32,
    has_last: bool,
}

fn resample_linear(
    samples: &[f32],
    input_rate: u32,
    target_rate: u32,
    state: &mut ResamplerState,
) -> Vec<f32> {
    if samples.is_empty() || input_rate == target_rate {
        return samples.to_vec();
    }
    let step = input_rate as f64 / target_rate as f64;
    let mut out = Vec::with_capacity(((samples.len() as f64 / step) + 2.0) as usize);

    let mut buf = Vec::with_capacity(samples.len() + 1);
    if state.has_last {
        buf.push(state.last_sample);
    }
    buf.extend_from_slice(samples);

    let mut i: usize = 0;
    let mut t = state.t;
    while i + 1 < buf.len() {
        let s0 = buf[i];
        let s1 = buf[i + 1];
        out.push(s0 + (s1 - s0) * t as f32);
        t += step;
        while t >= 1.0 {
            t -= 1.0;
            i += 1;
            if i + 1 >= buf.len() {
                break;
            }
        }
    }

    state.t = t;
    if let Some(last) = buf.last() {
        state.last_sample = *last;
        state.has_last = true;
    }
    out
}

/// List available input devices (name strings).
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(_) => Vec::new(),
    }
}

/// List available output devices (name strings).
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(_) => Vec::new(),
    }
}
