//! cpal-backed microphone and speaker
//!
//! cpal streams are not `Send` on every platform, so each stream lives on its
//! own thread. Closing signals that thread and joins it, which drops the
//! stream before `close` returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::capture::{InputStream, Microphone, SampleCallback};
use super::playback::{AudioOutput, PlaybackHandle, Speaker};
use super::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::{Error, Result};

/// Map a device error to `PermissionDenied` when the platform refused access
fn device_error(message: String) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed")
    {
        Error::PermissionDenied(message)
    } else {
        Error::Audio(message)
    }
}

/// Keeps a stream alive on a dedicated thread until closed
struct StreamThread {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Run `build` on a new thread and keep its stream until `stop`
    fn spawn<F>(name: &str, build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(device_error(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Blocks until stop() sends or drops the sender
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Audio("audio thread exited during setup".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("audio thread panicked");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn input_config(device: &cpal::Device) -> Result<StreamConfig> {
    let supported_config = device
        .supported_input_configs()
        .map_err(|e| device_error(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(CAPTURE_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(CAPTURE_SAMPLE_RATE)
        })
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

    Ok(supported_config
        .with_sample_rate(SampleRate(CAPTURE_SAMPLE_RATE))
        .config())
}

/// Default input device
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

struct CpalInput {
    thread: StreamThread,
}

impl InputStream for CpalInput {
    fn close(&mut self) {
        self.thread.stop();
    }
}

impl Microphone for CpalMicrophone {
    fn open(&self, mut on_samples: SampleCallback) -> Result<Box<dyn InputStream>> {
        let thread = StreamThread::spawn("tempo-capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| Error::Audio("no input device available".to_string()))?;
            let config = input_config(&device)?;

            tracing::debug!(
                device = device.name().unwrap_or_default(),
                sample_rate = CAPTURE_SAMPLE_RATE,
                channels = config.channels,
                "audio capture initialized"
            );

            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| on_samples(data),
                    |err| {
                        tracing::error!(error = %err, "audio capture error");
                    },
                    None,
                )
                .map_err(|e| device_error(e.to_string()))
        })?;

        Ok(Box::new(CpalInput { thread }))
    }
}

struct Voice {
    id: PlaybackHandle,
    start_frame: u64,
    samples: Vec<f32>,
}

/// Mixes scheduled voices against a frame counter that doubles as the clock
#[derive(Default)]
struct Mixer {
    position: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    fn render(&mut self, data: &mut [f32], channels: usize) {
        for frame in data.chunks_mut(channels) {
            let pos = self.position;
            let mut sample = 0.0f32;
            for voice in &self.voices {
                if pos >= voice.start_frame {
                    #[allow(clippy::cast_possible_truncation)]
                    let offset = (pos - voice.start_frame) as usize;
                    if let Some(s) = voice.samples.get(offset) {
                        sample += s;
                    }
                }
            }
            for out in frame.iter_mut() {
                *out = sample.clamp(-1.0, 1.0);
            }
            self.position += 1;
        }

        let pos = self.position;
        self.voices
            .retain(|v| v.start_frame + v.samples.len() as u64 > pos);
    }
}

/// Output device opened for one session
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    next_id: AtomicU64,
    thread: Mutex<Option<StreamThread>>,
}

impl AudioOutput for CpalOutput {
    #[allow(clippy::cast_precision_loss)]
    fn now(&self) -> f64 {
        self.mixer
            .lock()
            .map(|m| m.position as f64 / f64::from(PLAYBACK_SAMPLE_RATE))
            .unwrap_or_default()
    }

    fn sample_rate(&self) -> u32 {
        PLAYBACK_SAMPLE_RATE
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn start_at(&self, samples: Vec<f32>, at: f64) -> PlaybackHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let start_frame = (at * f64::from(PLAYBACK_SAMPLE_RATE)).round().max(0.0) as u64;
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.voices.push(Voice {
                id,
                start_frame,
                samples,
            });
        }
        id
    }

    fn stop(&self, handle: PlaybackHandle) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.voices.retain(|v| v.id != handle);
        }
    }

    fn close(&self) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.voices.clear();
        }
        if let Ok(mut thread) = self.thread.lock() {
            if let Some(mut t) = thread.take() {
                t.stop();
                tracing::debug!("audio playback closed");
            }
        }
    }
}

/// Default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalSpeaker;

impl Speaker for CpalSpeaker {
    fn open(&self) -> Result<Arc<dyn AudioOutput>> {
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let callback_mixer = Arc::clone(&mixer);

        let thread = StreamThread::spawn("tempo-playback", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

            let supported_config = device
                .supported_output_configs()
                .map_err(|e| device_error(e.to_string()))?
                .find(|c| {
                    c.channels() == 1
                        && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
                })
                .or_else(|| {
                    // Fallback: try stereo
                    device.supported_output_configs().ok()?.find(|c| {
                        c.channels() == 2
                            && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                            && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
                    })
                })
                .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

            let config = supported_config
                .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
                .config();
            let channels = usize::from(config.channels);

            tracing::debug!(
                device = device.name().unwrap_or_default(),
                sample_rate = PLAYBACK_SAMPLE_RATE,
                channels,
                "audio playback initialized"
            );

            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        if let Ok(mut mixer) = callback_mixer.lock() {
                            mixer.render(data, channels);
                        } else {
                            data.fill(0.0);
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| device_error(e.to_string()))
        })?;

        Ok(Arc::new(CpalOutput {
            mixer,
            next_id: AtomicU64::new(0),
            thread: Mutex::new(Some(thread)),
        }))
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
