//! Error types for the audio capture and playback pipeline

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the capture/playback pipeline
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Session busy: an utterance is already open")]
    SessionBusy,

    #[error("Not recording: no utterance is open")]
    NotRecording,

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Payload encoding error: {0}")]
    Encoding(String),
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}
