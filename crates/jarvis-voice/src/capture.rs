//! Microphone capture behind a device seam.
//!
//! The pipeline talks to the microphone through the `CaptureDevice` trait so
//! the state machine can be tested without hardware. `CpalCapture` is the
//! production device; `ScriptedCapture` plays back canned chunks.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Chunk size in samples (default: 1600 for 100ms at 16kHz)
    pub chunk_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            chunk_size: 1_600, // 100ms at 16kHz
        }
    }
}

impl CaptureConfig {
    /// Wall-clock duration covered by one chunk.
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / self.sample_rate as f64)
    }
}

/// Fixed-duration chunk sent from the capture thread
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,
}

/// Microphone seam. `open` acquires the device and starts streaming chunks;
/// the returned handle scopes the acquisition to one utterance.
pub trait CaptureDevice: Send + Sync {
    fn open(
        &self,
        config: &CaptureConfig,
        chunks: mpsc::UnboundedSender<AudioChunk>,
    ) -> VoiceResult<CaptureHandle>;
}

/// Holds the device for the lifetime of one utterance. Releasing (or
/// dropping) stops the stream and frees the microphone — no path may leave
/// the device held after recording ends.
pub struct CaptureHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureHandle {
    pub fn from_release(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Stop the stream and free the device.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Production capture via CPAL. The `cpal::Stream` is not `Send`, so a
/// dedicated thread owns it and parks until the handle is released.
#[derive(Debug, Default)]
pub struct CpalCapture;

impl CaptureDevice for CpalCapture {
    fn open(
        &self,
        config: &CaptureConfig,
        chunks: mpsc::UnboundedSender<AudioChunk>,
    ) -> VoiceResult<CaptureHandle> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = config.clone();
        let sample_rate = config.sample_rate;
        let chunk_size = config.chunk_size;

        thread::spawn(move || {
            let stream = match build_input_stream(&config, chunks) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(VoiceError::from(e)));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            // Park until released; dropping the stream stops capture.
            let _ = stop_rx.recv();
            drop(stream);
        });

        ready_rx
            .recv()
            .map_err(|_| VoiceError::DeviceUnavailable("capture thread died".into()))??;
        info!(
            "microphone acquired ({}Hz, {} samples/chunk)",
            sample_rate, chunk_size
        );
        Ok(CaptureHandle::from_release(move || {
            let _ = stop_tx.send(());
        }))
    }
}

fn build_input_stream(
    config: &CaptureConfig,
    chunks: mpsc::UnboundedSender<AudioChunk>,
) -> VoiceResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("no input device available".into()))?;
    info!(
        "using input device: {}",
        device.name().unwrap_or_else(|_| "unknown".into())
    );

    let stream_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let chunk_size = config.chunk_size;
    let mut sample_buffer: Vec<f32> = Vec::with_capacity(chunk_size);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                sample_buffer.push(sample);
                if sample_buffer.len() >= chunk_size {
                    let chunk = AudioChunk {
                        samples: std::mem::take(&mut sample_buffer),
                    };
                    if chunks.send(chunk).is_err() {
                        // Collector gone; the stream is about to be dropped.
                        return;
                    }
                    sample_buffer.reserve(chunk_size);
                }
            }
        },
        move |err| {
            warn!("audio stream error: {}", err);
        },
        None,
    )?;

    Ok(stream)
}

/// Scripted device for tests: emits canned chunks, optionally on repeat,
/// and can be told to refuse acquisition.
pub struct ScriptedCapture {
    chunks: Vec<Vec<f32>>,
    fail_open: bool,
    repeat: bool,
    pace: Duration,
}

impl ScriptedCapture {
    pub fn new(chunks: Vec<Vec<f32>>) -> Self {
        Self {
            chunks,
            fail_open: false,
            repeat: false,
            pace: Duration::ZERO,
        }
    }

    /// Device that refuses acquisition (simulates a missing microphone).
    pub fn unavailable() -> Self {
        Self {
            chunks: Vec::new(),
            fail_open: true,
            repeat: false,
            pace: Duration::ZERO,
        }
    }

    /// Cycle the scripted chunks until released, `pace` apart.
    pub fn on_repeat(mut self, pace: Duration) -> Self {
        self.repeat = true;
        self.pace = pace;
        self
    }
}

impl CaptureDevice for ScriptedCapture {
    fn open(
        &self,
        _config: &CaptureConfig,
        chunks: mpsc::UnboundedSender<AudioChunk>,
    ) -> VoiceResult<CaptureHandle> {
        if self.fail_open {
            return Err(VoiceError::DeviceUnavailable(
                "scripted device is unavailable".into(),
            ));
        }

        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let script = self.chunks.clone();
        let repeat = self.repeat;
        let pace = self.pace;

        thread::spawn(move || {
            loop {
                for samples in &script {
                    if stop_rx.try_recv().is_ok() {
                        return;
                    }
                    if chunks
                        .send(AudioChunk {
                            samples: samples.clone(),
                        })
                        .is_err()
                    {
                        return;
                    }
                    if !pace.is_zero() {
                        thread::sleep(pace);
                    }
                }
                if !repeat {
                    break;
                }
            }
            // Script exhausted: hold the "device" until released.
            let _ = stop_rx.recv();
        });

        Ok(CaptureHandle::from_release(move || {
            let _ = stop_tx.send(());
        }))
    }
}
