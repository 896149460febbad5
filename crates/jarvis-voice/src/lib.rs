//! # Jarvis Voice — capture and playback for the assistant client
//!
//! Acquires the microphone for one utterance at a time, chunks and
//! accumulates audio with a live amplitude signal, and encodes the finalized
//! payload for the gateway. Playback drives synthesized replies through the
//! speaker. Both device edges sit behind traits so the interaction layer can
//! be tested without hardware.

pub mod capture;
pub mod error;
pub mod pipeline;
pub mod playback;

pub use capture::{AudioChunk, CaptureConfig, CaptureDevice, CaptureHandle, CpalCapture, ScriptedCapture};
pub use error::{VoiceError, VoiceResult};
pub use pipeline::{
    decode_base64_audio, encode_pcm16_base64, rms_amplitude, CapturePipeline, Utterance,
    UtterancePayload,
};
pub use playback::{NullPlayback, PlaybackSink, RodioPlayback};
