//! Gapless playback scheduling
//!
//! Decoded chunks are placed back-to-back on the output clock:
//! `start = max(next_start, now)`, then `next_start = start + duration`.

use std::sync::{Arc, Mutex};

use crate::Result;

/// Identifies one scheduled chunk on an [`AudioOutput`]
pub type PlaybackHandle = u64;

/// An open output device with its own clock
pub trait AudioOutput: Send + Sync {
    /// Current time of the output clock in seconds
    fn now(&self) -> f64;

    /// Samples per second the output consumes
    fn sample_rate(&self) -> u32;

    /// Start playing `samples` at clock time `at`
    fn start_at(&self, samples: Vec<f32>, at: f64) -> PlaybackHandle;

    /// Stop a playing or scheduled chunk immediately
    fn stop(&self, handle: PlaybackHandle);

    /// Release the device
    fn close(&self);
}

/// Opens the output device once per session
pub trait Speaker: Send + Sync {
    /// Open the output device
    ///
    /// # Errors
    ///
    /// Returns error if no usable output device exists
    fn open(&self) -> Result<Arc<dyn AudioOutput>>;
}

/// Decoded samples and where they start on the output clock
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    pub samples: Vec<f32>,
    pub start: f64,
}

impl PlaybackChunk {
    /// Length in seconds at `sample_rate`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 / f64::from(sample_rate)
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    next_start: Option<f64>,
    in_flight: Vec<(PlaybackHandle, f64)>,
}

/// Schedules decoded chunks on an output with no gaps or overlaps
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    state: Mutex<SchedulerState>,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Schedule `samples` right after everything already queued
    ///
    /// Returns the chunk as scheduled.
    pub fn enqueue(&self, samples: Vec<f32>) -> PlaybackChunk {
        let now = self.output.now();
        let Ok(mut state) = self.state.lock() else {
            return PlaybackChunk { samples, start: now };
        };

        state.in_flight.retain(|(_, end)| *end > now);

        let start = state.next_start.map_or(now, |next| next.max(now));
        let chunk = PlaybackChunk { samples, start };
        let end = start + chunk.duration(self.output.sample_rate());

        let handle = self.output.start_at(chunk.samples.clone(), start);
        state.in_flight.push((handle, end));
        state.next_start = Some(end);

        tracing::trace!(start, end, "playback chunk scheduled");
        chunk
    }

    /// Stop everything playing or scheduled and reset the timeline
    pub fn hard_stop(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let stopped = state.in_flight.len();
        for (handle, _) in state.in_flight.drain(..) {
            self.output.stop(handle);
        }
        state.next_start = None;
        if stopped > 0 {
            tracing::debug!(stopped, "playback flushed");
        }
    }

    /// Whether any scheduled audio has not finished yet
    #[must_use]
    pub fn is_playing(&self) -> bool {
        let now = self.output.now();
        self.state
            .lock()
            .map(|s| s.in_flight.iter().any(|(_, end)| *end > now))
            .unwrap_or(false)
    }

    /// Clock time at which the queued audio runs out
    #[must_use]
    pub fn next_start(&self) -> Option<f64> {
        self.state.lock().ok().and_then(|s| s.next_start)
    }

    /// Hard-stop and release the output device
    pub fn close(&self) {
        self.hard_stop();
        self.output.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[derive(Default)]
    struct ManualOutput {
        now: Mutex<f64>,
        next: AtomicU64,
        started: Mutex<Vec<(PlaybackHandle, f64)>>,
        stopped: Mutex<Vec<PlaybackHandle>>,
    }

    impl ManualOutput {
        fn set_now(&self, t: f64) {
            *self.now.lock().unwrap() = t;
        }
    }

    impl AudioOutput for ManualOutput {
        fn now(&self) -> f64 {
            *self.now.lock().unwrap()
        }

        fn sample_rate(&self) -> u32 {
            10
        }

        fn start_at(&self, _samples: Vec<f32>, at: f64) -> PlaybackHandle {
            let id = self.next.fetch_add(1, Ordering::SeqCst);
            self.started.lock().unwrap().push((id, at));
            id
        }

        fn stop(&self, handle: PlaybackHandle) {
            self.stopped.lock().unwrap().push(handle);
        }

        fn close(&self) {}
    }

    #[test]
    fn chunks_are_back_to_back() {
        let output = Arc::new(ManualOutput::default());
        output.set_now(1.0);
        let scheduler = PlaybackScheduler::new(output.clone());

        let durations = [5usize, 10, 3];
        let chunks: Vec<_> = durations
            .iter()
            .map(|n| scheduler.enqueue(vec![0.0; *n]))
            .collect();

        assert!((chunks[0].start - 1.0).abs() < 1e-9);
        for pair in chunks.windows(2) {
            let prev_end = pair[0].start + pair[0].duration(10);
            assert!(pair[1].start >= pair[0].start);
            assert!((pair[1].start - prev_end).abs() < 1e-9);
        }
        assert!((scheduler.next_start().unwrap() - 2.8).abs() < 1e-9);
    }

    #[test]
    fn late_chunk_starts_now_instead_of_in_the_past() {
        let output = Arc::new(ManualOutput::default());
        let scheduler = PlaybackScheduler::new(output.clone());

        scheduler.enqueue(vec![0.0; 10]);
        output.set_now(5.0);
        let chunk = scheduler.enqueue(vec![0.0; 10]);

        assert!((chunk.start - 5.0).abs() < 1e-9);
    }

    #[test]
    fn hard_stop_stops_in_flight_and_resets() {
        let output = Arc::new(ManualOutput::default());
        output.set_now(2.0);
        let scheduler = PlaybackScheduler::new(output.clone());

        scheduler.enqueue(vec![0.0; 10]);
        scheduler.enqueue(vec![0.0; 10]);
        assert!(scheduler.is_playing());

        scheduler.hard_stop();

        assert_eq!(output.stopped.lock().unwrap().len(), 2);
        assert_eq!(scheduler.next_start(), None);
        assert!(!scheduler.is_playing());

        let chunk = scheduler.enqueue(vec![0.0; 1]);
        assert!((chunk.start - 2.0).abs() < 1e-9);
    }

    #[test]
    fn hard_stop_on_idle_scheduler_is_harmless() {
        let output = Arc::new(ManualOutput::default());
        let scheduler = PlaybackScheduler::new(output.clone());
        scheduler.hard_stop();
        scheduler.hard_stop();
        assert!(output.stopped.lock().unwrap().is_empty());
    }
}
