//! Voice processing module
//!
//! Microphone capture, gapless playback of assistant audio, the PCM wire
//! codec, and wake phrase listening. Device access goes through the
//! [`Microphone`] and [`Speaker`] traits; [`device`] provides the cpal
//! implementations.

mod capture;
pub mod codec;
pub mod device;
mod playback;
mod stt;
mod wake_word;

pub use capture::{
    AudioFrame, CaptureStream, FrameSink, Framer, InputStream, Microphone, SampleCallback,
    VoiceActivity, rms,
};
pub use codec::EncodedAudio;
pub use device::{CpalMicrophone, CpalSpeaker, samples_to_wav};
pub use playback::{AudioOutput, PlaybackChunk, PlaybackHandle, PlaybackScheduler, Speaker};
pub use stt::{SpeechSegmenter, SpeechToText, TranscribingRecognizer};
pub use wake_word::{
    RESTART_BACKOFF, RecognitionErrorKind, RecognitionEvent, SpeechRecognizer, WakePhrase, WakeSignal,
    WakeWordListener,
};

/// Sample rate for microphone capture and outbound audio (16kHz for speech)
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of assistant audio and the playback device
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
