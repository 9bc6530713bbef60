//! Gapless scheduling of streamed reply audio on an output timeline.
//!
//! Every decoded chunk is placed at `max(next_start, now)` so consecutive
//! chunks abut exactly, and late chunks start immediately rather than in the
//! past. `cancel_all` silences everything and resets the timeline to now.

pub mod cpal_output;
pub mod virtual_output;

pub use cpal_output::CpalOutput;
pub use virtual_output::VirtualOutput;

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::encoder::{self, DecodeError};

#[derive(Error, Debug, Clone)]
pub enum PlaybackError {
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("Output is closed")]
    Closed,
}

/// Monotonic output time in seconds.
pub trait OutputClock: Send + Sync {
    fn now(&self) -> f64;
}

/// An output that can start buffers at a given clock time and stop them.
pub trait AudioOutput: OutputClock {
    fn schedule(
        &self,
        id: u64,
        samples: Vec<f32>,
        sample_rate: u32,
        start_at: f64,
    ) -> Result<(), PlaybackError>;

    /// Stop a scheduled buffer; unknown or finished ids are ignored.
    fn stop(&self, id: u64);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackEntry {
    pub id: u64,
    pub start: f64,
    pub duration: f64,
}

impl PlaybackEntry {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    next_start: f64,
    in_flight: HashMap<u64, PlaybackEntry>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let next_start = output.now();
        Self {
            output,
            next_start,
            in_flight: HashMap::new(),
            next_id: 0,
        }
    }

    /// Decode 16-bit PCM and schedule it right after whatever is already
    /// queued. An empty payload is a no-op and returns `None`.
    pub fn enqueue(
        &mut self,
        pcm: &[u8],
        sample_rate: u32,
    ) -> Result<Option<PlaybackEntry>, DecodeError> {
        let samples = encoder::pcm16_to_samples(pcm)?;
        if samples.is_empty() || sample_rate == 0 {
            return Ok(None);
        }

        let now = self.output.now();
        let start = self.next_start.max(now);
        let duration = samples.len() as f64 / sample_rate as f64;
        let id = self.next_id;
        self.next_id += 1;

        if let Err(e) = self.output.schedule(id, samples, sample_rate, start) {
            log::warn!("Playback: Failed to schedule chunk {}: {}", id, e);
            return Ok(None);
        }

        let entry = PlaybackEntry {
            id,
            start,
            duration,
        };
        self.next_start = entry.end();
        self.in_flight.insert(id, entry);
        log::trace!(
            "Playback: Chunk {} at {:.3}s for {:.3}s ({} in flight)",
            id,
            start,
            duration,
            self.in_flight.len()
        );
        Ok(Some(entry))
    }

    /// Stop every scheduled buffer and reset the timeline to now. Returns
    /// the number of buffers stopped.
    pub fn cancel_all(&mut self) -> usize {
        let stopped = self.in_flight.len();
        for id in self.in_flight.keys() {
            self.output.stop(*id);
        }
        self.in_flight.clear();
        self.next_start = self.output.now();
        if stopped > 0 {
            log::debug!("Playback: Cancelled {} chunk(s)", stopped);
        }
        stopped
    }

    /// Forget buffers whose end time has passed. Returns how many finished.
    pub fn reap_finished(&mut self) -> usize {
        let now = self.output.now();
        let before = self.in_flight.len();
        self.in_flight.retain(|_, entry| entry.end() > now);
        before - self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn now(&self) -> f64 {
        self.output.now()
    }

    /// Seconds of audio still queued past the current time.
    pub fn queued_secs(&self) -> f64 {
        if self.in_flight.is_empty() {
            0.0
        } else {
            (self.next_start - self.output.now()).max(0.0)
        }
    }
}
