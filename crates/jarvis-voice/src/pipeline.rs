//! **Audio Capture Pipeline** — one utterance at a time, from microphone
//! acquisition to a base64 payload ready for the wire.
//!
//! `start()` acquires the device, opens an Utterance and begins appending
//! fixed-duration chunks while emitting a normalized amplitude sample per
//! chunk for live feedback. `stop()` finalizes the utterance, releases the
//! device and returns the encoded payload. The device handle and the
//! amplitude loop are scoped to the lifetime of one utterance.

use crate::capture::{CaptureConfig, CaptureDevice, CaptureHandle};
use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// An in-progress or finalized capture: ordered chunks, capture start, and
/// the finalization flag. Owned exclusively by the pipeline until finalized.
#[derive(Debug, Default)]
pub struct Utterance {
    pub chunks: Vec<Vec<f32>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finalized: bool,
}

impl Utterance {
    fn total_samples(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

/// Finalized utterance, encoded for transmission (PCM16LE, base64).
#[derive(Debug, Clone)]
pub struct UtterancePayload {
    pub audio_b64: String,
    pub sample_rate: u32,
    pub samples: usize,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

struct ActiveUtterance {
    handle: CaptureHandle,
    utterance: Arc<Mutex<Utterance>>,
    collector: JoinHandle<()>,
}

/// Acquires the microphone, chunks and accumulates audio, derives the live
/// amplitude signal, and finalizes an utterance for transmission.
pub struct CapturePipeline {
    config: CaptureConfig,
    device: Arc<dyn CaptureDevice>,
    max_utterance: Duration,
    amplitude: broadcast::Sender<f32>,
    limit: broadcast::Sender<()>,
    active: Option<ActiveUtterance>,
}

impl CapturePipeline {
    pub fn new(
        config: CaptureConfig,
        device: Arc<dyn CaptureDevice>,
        max_utterance: Duration,
    ) -> Self {
        let (amplitude, _) = broadcast::channel(64);
        let (limit, _) = broadcast::channel(4);
        Self {
            config,
            device,
            max_utterance,
            amplitude,
            limit,
            active: None,
        }
    }

    /// Normalized amplitude (0.0–1.0), one sample per captured chunk.
    pub fn subscribe_amplitude(&self) -> broadcast::Receiver<f32> {
        self.amplitude.subscribe()
    }

    /// Fires once when an open utterance reaches the max-duration bound; the
    /// owner is expected to force a `stop()`.
    pub fn subscribe_limit(&self) -> broadcast::Receiver<()> {
        self.limit.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Open a new utterance and begin capturing. Fails with
    /// `DeviceUnavailable` if the microphone cannot be acquired and
    /// `SessionBusy` if an utterance is already open; neither leaves any
    /// state behind.
    pub fn start(&mut self) -> VoiceResult<()> {
        if self.active.is_some() {
            return Err(VoiceError::SessionBusy);
        }

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let handle = self.device.open(&self.config, chunk_tx)?;

        let utterance = Arc::new(Mutex::new(Utterance {
            chunks: Vec::new(),
            started_at: Some(Utc::now()),
            finalized: false,
        }));

        let collector = self.spawn_collector(chunk_rx, Arc::clone(&utterance));
        self.active = Some(ActiveUtterance {
            handle,
            utterance,
            collector,
        });
        info!("utterance opened");
        Ok(())
    }

    fn spawn_collector(
        &self,
        mut chunk_rx: mpsc::UnboundedReceiver<crate::capture::AudioChunk>,
        utterance: Arc<Mutex<Utterance>>,
    ) -> JoinHandle<()> {
        let amplitude = self.amplitude.clone();
        let limit = self.limit.clone();
        let max_samples =
            (self.max_utterance.as_secs_f64() * self.config.sample_rate as f64) as usize;

        tokio::spawn(async move {
            let mut limit_hit = false;
            while let Some(chunk) = chunk_rx.recv().await {
                let _ = amplitude.send(rms_amplitude(&chunk.samples));

                let total = {
                    let mut guard = match utterance.lock() {
                        Ok(g) => g,
                        Err(_) => {
                            warn!("utterance lock poisoned; collector stopping");
                            return;
                        }
                    };
                    if guard.finalized {
                        // Late chunk after stop(); drop it.
                        continue;
                    }
                    guard.chunks.push(chunk.samples);
                    guard.total_samples()
                };

                if !limit_hit && total >= max_samples {
                    limit_hit = true;
                    warn!("max utterance duration reached, signalling owner");
                    let _ = limit.send(());
                }
            }
            debug!("chunk stream closed, collector done");
        })
    }

    /// Finalize the open utterance: release the microphone, concatenate the
    /// chunks into one encoded payload and return it. Calling with no open
    /// utterance is a no-op returning `NotRecording`.
    pub async fn stop(&mut self) -> VoiceResult<UtterancePayload> {
        let active = self.active.take().ok_or(VoiceError::NotRecording)?;
        active.handle.release();
        // The device thread drops the chunk sender on release; wait for the
        // collector to drain whatever was already captured.
        let _ = active.collector.await;

        let mut guard = active
            .utterance
            .lock()
            .map_err(|_| VoiceError::AudioStream("utterance lock poisoned".into()))?;
        guard.finalized = true;

        let samples: Vec<f32> = guard.chunks.iter().flatten().copied().collect();
        let started_at = guard.started_at.unwrap_or_else(Utc::now);
        drop(guard);

        let duration =
            Duration::from_secs_f64(samples.len() as f64 / self.config.sample_rate as f64);
        let payload = UtterancePayload {
            audio_b64: encode_pcm16_base64(&samples),
            sample_rate: self.config.sample_rate,
            samples: samples.len(),
            started_at,
            duration,
        };
        info!(
            "utterance finalized: {} samples, {:.2}s",
            payload.samples,
            duration.as_secs_f64()
        );
        Ok(payload)
    }

    /// Abrupt teardown: release the device and discard the open utterance,
    /// if any. Safe to call in any state.
    pub fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            active.handle.release();
            active.collector.abort();
            warn!("utterance aborted, microphone released");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.abort();
    }
}

/// RMS of one chunk, clamped to 0.0–1.0.
pub fn rms_amplitude(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt().clamp(0.0, 1.0)
}

/// Concatenated samples as 16-bit little-endian PCM, base64-encoded.
pub fn encode_pcm16_base64(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&clamped.to_le_bytes());
    }
    BASE64.encode(bytes)
}

/// Decode a base64 audio payload (synthesis results) into raw bytes.
pub fn decode_base64_audio(data: &str) -> VoiceResult<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| VoiceError::Encoding(e.to_string()))
}
