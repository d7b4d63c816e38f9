//! Side-channel PCM audio path: capture, gain, i16-LE chunk framing over
//! signaling, and gapless scheduling of decoded remote chunks.
//!
//! This path is deliberately distinct from the negotiated track transport —
//! not every participant supports peer media, so encoded chunks ride the
//! signaling connection for the whole call while unmuted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::devices::{self, DeviceError};
use crate::id_types::StreamId;
use crate::protocol::{Envelope, MediaStatePayload};
use crate::types::SharedEnvelopeSender;

/// Fixed capture/playback rate for the PCM side channel.
pub const SAMPLE_RATE: u32 = 48_000;
/// Samples per outbound chunk (20 ms of mono audio).
pub const FRAME_SAMPLES: usize = 960;
/// Chunks landing in the past are clamped to now plus this many samples.
pub const SCHEDULE_EPSILON_SAMPLES: u64 = 480;

#[derive(Debug)]
pub enum AudioError {
    ChunkDecode(base64::DecodeError),
    OddChunkLength(usize),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::ChunkDecode(e) => write!(f, "audio chunk is not valid base64: {}", e),
            AudioError::OddChunkLength(n) => {
                write!(f, "audio chunk byte length {} is not i16-aligned", n)
            }
        }
    }
}

impl std::error::Error for AudioError {}

/// f32 gain shared across threads without a lock (stored as raw bits).
pub struct SharedGain(AtomicU32);

impl SharedGain {
    pub fn new(value: f32) -> Self {
        SharedGain(AtomicU32::new(value.to_bits()))
    }

    pub fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Scales a frame in place, clamping to the valid sample range.
pub fn apply_gain(frame: &mut [f32], gain: f32) {
    for sample in frame.iter_mut() {
        *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
}

/// Mean absolute amplitude of a frame; the speaking detector's input.
pub fn mean_abs(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    frame.iter().map(|s| s.abs()).sum::<f32>() / frame.len() as f32
}

/// Encodes f32 samples as i16 little-endian bytes.
pub fn encode_pcm(frame: &[f32]) -> Bytes {
    let mut out = BytesMut::with_capacity(frame.len() * 2);
    for sample in frame {
        let v = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.put_i16_le(v);
    }
    out.freeze()
}

/// Decodes i16 little-endian bytes back to f32 samples.
pub fn decode_pcm(bytes: &[u8]) -> Result<Vec<f32>, AudioError> {
    if bytes.len() % 2 != 0 {
        return Err(AudioError::OddChunkLength(bytes.len()));
    }
    let mut buf = bytes;
    let mut out = Vec::with_capacity(bytes.len() / 2);
    while buf.has_remaining() {
        out.push(buf.get_i16_le() as f32 / i16::MAX as f32);
    }
    Ok(out)
}

pub fn encode_chunk(frame: &[f32]) -> String {
    BASE64.encode(encode_pcm(frame))
}

pub fn decode_chunk(data: &str) -> Result<Vec<f32>, AudioError> {
    let bytes = BASE64.decode(data).map_err(AudioError::ChunkDecode)?;
    decode_pcm(&bytes)
}

/// One pending scheduled chunk inside the mixer.
struct ScheduledChunk {
    stream_id: String,
    start: u64,
    samples: Vec<f32>,
}

/// Upper bound on buffered playback audio. With no running output stream
/// the clock never advances, so the backlog must be bounded here; oldest
/// arrivals are evicted first.
pub const MAX_PENDING_SAMPLES: usize = (SAMPLE_RATE as usize) * 2;

struct MixState {
    /// Samples consumed by the output so far; the playback clock.
    clock: u64,
    /// Per-remote-stream "next scheduled sample" cursor.
    cursors: HashMap<String, u64>,
    pending: Vec<ScheduledChunk>,
}

/// Playback graph: mixes remote PCM streams into one output feed. Each
/// stream keeps its own cursor so consecutive chunks queue back-to-back
/// regardless of arrival jitter; a chunk that would land in the past is
/// clamped to now + epsilon.
pub struct PlaybackMixer {
    state: StdMutex<MixState>,
    gain: SharedGain,
}

impl Default for PlaybackMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackMixer {
    pub fn new() -> Self {
        PlaybackMixer {
            state: StdMutex::new(MixState {
                clock: 0,
                cursors: HashMap::new(),
                pending: Vec::new(),
            }),
            gain: SharedGain::new(1.0),
        }
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.set(gain);
    }

    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    /// Schedules a decoded chunk for a remote stream. Returns the sample
    /// index the chunk was placed at.
    pub fn submit(&self, stream_id: &str, samples: Vec<f32>) -> u64 {
        let mut state = self.state.lock().unwrap();
        let floor = state.clock + SCHEDULE_EPSILON_SAMPLES;
        let cursor = state.cursors.get(stream_id).copied().unwrap_or(0);
        let start = cursor.max(floor);
        let len = samples.len() as u64;
        state.cursors.insert(stream_id.to_string(), start + len);
        state.pending.push(ScheduledChunk {
            stream_id: stream_id.to_string(),
            start,
            samples,
        });

        let mut buffered: usize = state.pending.iter().map(|c| c.samples.len()).sum();
        while buffered > MAX_PENDING_SAMPLES && !state.pending.is_empty() {
            let dropped = state.pending.remove(0);
            buffered -= dropped.samples.len();
            debug!(stream_id = %dropped.stream_id, "Playback backlog full, dropping oldest chunk");
        }
        start
    }

    /// Drops the cursor and any pending audio for a stream that ended.
    pub fn remove_stream(&self, stream_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.cursors.remove(stream_id);
        state.pending.retain(|c| c.stream_id != stream_id);
    }

    /// Total samples currently queued across all streams.
    pub fn buffered_samples(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.pending.iter().map(|c| c.samples.len()).sum()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.cursors.clear();
        state.pending.clear();
    }

    /// Fills an output buffer by summing all chunks overlapping the current
    /// clock window, then advances the clock. Called from the output device
    /// callback.
    pub fn fill(&self, out: &mut [f32]) {
        out.fill(0.0);
        let gain = self.gain.get();
        let mut state = self.state.lock().unwrap();
        let window_start = state.clock;
        let window_end = window_start + out.len() as u64;

        for chunk in &state.pending {
            let chunk_end = chunk.start + chunk.samples.len() as u64;
            if chunk_end <= window_start || chunk.start >= window_end {
                continue;
            }
            let from = window_start.max(chunk.start);
            let to = window_end.min(chunk_end);
            for idx in from..to {
                let src = (idx - chunk.start) as usize;
                let dst = (idx - window_start) as usize;
                out[dst] += chunk.samples[src];
            }
        }

        state.clock = window_end;
        let clock = state.clock;
        state.pending.retain(|c| c.start + c.samples.len() as u64 > clock);

        if gain != 1.0 {
            apply_gain(out, gain);
        } else {
            for sample in out.iter_mut() {
                *sample = sample.clamp(-1.0, 1.0);
            }
        }
    }
}

/// Running microphone capture: a dedicated thread owns the cpal stream
/// (cpal streams are not `Send`) and forwards fixed-size frames.
pub struct CaptureHandle {
    frames: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
    stop: Arc<AtomicBool>,
}

impl CaptureHandle {
    /// Hands the frame feed to whoever consumes it (once).
    pub fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<f32>>> {
        self.frames.take()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens the selected input device and starts mono 48 kHz capture.
pub fn start_capture(device_name: &str) -> Result<CaptureHandle, DeviceError> {
    let device = devices::find_input_device(device_name)?;
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = stop.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    std::thread::spawn(move || {
        let config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: BufferSize::Default,
        };

        let mut pending: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES * 2);
        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                pending.extend_from_slice(data);
                while pending.len() >= FRAME_SAMPLES {
                    let frame: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
                    let _ = frame_tx.send(frame);
                }
            },
            |err| warn!(error = %err, "Capture stream error"),
            None,
        );

        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(DeviceError::Unavailable(e.to_string())));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(DeviceError::Unavailable(e.to_string())));
            return;
        }
        let _ = ready_tx.send(Ok(()));

        while !stop_thread.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        drop(stream);
    });

    ready_rx
        .recv()
        .map_err(|_| DeviceError::Unavailable("capture thread exited".to_string()))??;

    Ok(CaptureHandle {
        frames: Some(frame_rx),
        stop,
    })
}

/// Running playback stream; dropping it stops the output thread.
pub struct PlaybackHandle {
    stop: Arc<AtomicBool>,
}

impl PlaybackHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens the selected output device and pulls samples from the mixer.
pub fn start_playback(
    device_name: &str,
    mixer: Arc<PlaybackMixer>,
) -> Result<PlaybackHandle, DeviceError> {
    let device = devices::find_output_device(device_name)?;
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = stop.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    std::thread::spawn(move || {
        let config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: BufferSize::Default,
        };

        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _| {
                mixer.fill(data);
            },
            |err| warn!(error = %err, "Playback stream error"),
            None,
        );

        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(DeviceError::Unavailable(e.to_string())));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(DeviceError::Unavailable(e.to_string())));
            return;
        }
        let _ = ready_tx.send(Ok(()));

        while !stop_thread.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        drop(stream);
    });

    ready_rx
        .recv()
        .map_err(|_| DeviceError::Unavailable("playback thread exited".to_string()))??;

    Ok(PlaybackHandle { stop })
}

/// Local outbound audio chunk stream. Exists only while the session is
/// active; muting pauses transmission without tearing capture down.
pub struct MicUplink {
    pub stream_id: StreamId,
    seq: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl MicUplink {
    /// Spawns the encode/send loop over a frame feed. Levels of transmitted
    /// frames are reported through `level_tx` for the speaking detector.
    pub fn start(
        channel_id: String,
        mut frames: mpsc::UnboundedReceiver<Vec<f32>>,
        gain: Arc<SharedGain>,
        muted: Arc<AtomicBool>,
        outbound: SharedEnvelopeSender,
        level_tx: mpsc::UnboundedSender<f32>,
    ) -> Self {
        let stream_id = StreamId::from(Uuid::new_v4().to_string());
        let seq = Arc::new(AtomicU64::new(0));

        let stream_id_task = stream_id.clone();
        let seq_task = seq.clone();
        let task = tokio::spawn(async move {
            info!(stream_id = %stream_id_task, "Mic uplink started");
            while let Some(mut frame) = frames.recv().await {
                if muted.load(Ordering::Relaxed) {
                    continue;
                }
                apply_gain(&mut frame, gain.get());
                let _ = level_tx.send(mean_abs(&frame));

                let payload = MediaStatePayload::AudioChunk {
                    participant_id: None,
                    stream_id: stream_id_task.as_ref().to_string(),
                    seq: seq_task.fetch_add(1, Ordering::Relaxed),
                    data: encode_chunk(&frame),
                };
                let env = Envelope::media_state(channel_id.clone(), &payload);
                let tx_lock = outbound.lock().await;
                if let Some(tx) = tx_lock.as_ref() {
                    if tx.send(env).await.is_err() {
                        debug!("Outbound channel closed, stopping uplink");
                        break;
                    }
                }
            }
            info!(stream_id = %stream_id_task, "Mic uplink stopped");
        });

        MicUplink {
            stream_id,
            seq,
            task,
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    pub fn stop(self) {
        self.task.abort();
    }
}
