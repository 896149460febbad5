//! Speaker output behind a sink seam.
//!
//! The interaction layer plays synthesized speech through the `PlaybackSink`
//! trait. `RodioPlayback` drives the default output device; `NullPlayback`
//! swallows audio for tests and records what it was asked to play.

use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use tracing::info;

/// Speaker seam. Held by at most one owner at a time; the interaction state
/// machine's mutual-exclusion invariant enforces that.
pub trait PlaybackSink: Send + Sync {
    /// Queue decoded audio bytes (WAV/MP3) for playback.
    fn play(&self, bytes: &[u8]) -> VoiceResult<()>;

    /// Stop immediately and clear the queue.
    fn stop(&self);

    fn is_playing(&self) -> bool;

    /// Block until all queued audio has finished. Callers on an async task
    /// should wrap this in `spawn_blocking`.
    fn drain(&self);
}

/// Production playback via a `rodio::Sink` on the default output device.
/// The `rodio::OutputStream` is not `Send`, so a dedicated thread owns it
/// and parks until this struct is dropped.
pub struct RodioPlayback {
    _stream_handle: OutputStreamHandle,
    sink: Arc<Sink>,
    _shutdown: std_mpsc::Sender<()>,
}

impl RodioPlayback {
    pub fn new() -> VoiceResult<Self> {
        let (ready_tx, ready_rx) =
            std_mpsc::channel::<VoiceResult<(OutputStreamHandle, Arc<Sink>)>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        thread::spawn(move || {
            let (stream, stream_handle) = match OutputStream::try_default() {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::DeviceUnavailable(e.to_string())));
                    return;
                }
            };
            let sink = match Sink::try_new(&stream_handle) {
                Ok(sink) => Arc::new(sink),
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                    return;
                }
            };
            let _ = ready_tx.send(Ok((stream_handle, Arc::clone(&sink))));
            // Park until dropped; dropping the stream stops playback.
            let _ = shutdown_rx.recv();
            drop(stream);
        });

        let (stream_handle, sink) = ready_rx
            .recv()
            .map_err(|_| VoiceError::DeviceUnavailable("playback thread died".into()))??;
        info!("playback sink ready");
        Ok(Self {
            _stream_handle: stream_handle,
            sink,
            _shutdown: shutdown_tx,
        })
    }
}

impl PlaybackSink for RodioPlayback {
    fn play(&self, bytes: &[u8]) -> VoiceResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let cursor = Cursor::new(bytes.to_vec());
        let source = rodio::Decoder::new(cursor)
            .map_err(|e| VoiceError::Playback(format!("decode failed: {}", e)))?;
        self.sink.append(source.convert_samples::<f32>());
        Ok(())
    }

    fn stop(&self) {
        self.sink.stop();
        info!("playback stopped");
    }

    fn is_playing(&self) -> bool {
        !self.sink.empty()
    }

    fn drain(&self) {
        self.sink.sleep_until_end();
    }
}

/// Silent sink for tests: counts playbacks, never touches hardware.
#[derive(Debug, Default)]
pub struct NullPlayback {
    played: AtomicUsize,
    stopped: AtomicUsize,
}

impl NullPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-empty payloads played so far.
    pub fn played_count(&self) -> usize {
        self.played.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl PlaybackSink for NullPlayback {
    fn play(&self, bytes: &[u8]) -> VoiceResult<()> {
        if !bytes.is_empty() {
            self.played.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        false
    }

    fn drain(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_counts_playbacks() {
        let sink = NullPlayback::new();
        sink.play(b"audio").unwrap();
        sink.play(b"").unwrap();
        sink.play(b"more").unwrap();
        assert_eq!(sink.played_count(), 2);
        assert!(!sink.is_playing());
    }

    #[test]
    fn null_sink_counts_stops() {
        let sink = NullPlayback::new();
        sink.stop();
        sink.stop();
        assert_eq!(sink.stop_count(), 2);
    }
}
