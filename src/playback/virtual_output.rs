//! An output with no device behind it. Records what was scheduled and
//! reports either a manually driven clock or wall-clock time.

use std::sync::Mutex;
use std::time::Instant;

use super::{AudioOutput, OutputClock, PlaybackError};

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    pub id: u64,
    pub start: f64,
    pub duration: f64,
    pub stopped: bool,
}

enum Clock {
    Manual(f64),
    Realtime(Instant),
}

struct Inner {
    clock: Clock,
    buffers: Vec<ScheduledBuffer>,
}

pub struct VirtualOutput {
    inner: Mutex<Inner>,
}

impl VirtualOutput {
    /// Clock starts at zero and only moves through `advance`/`set_time`.
    pub fn manual() -> Self {
        Self::with_clock(Clock::Manual(0.0))
    }

    /// Clock follows wall time from construction.
    pub fn realtime() -> Self {
        Self::with_clock(Clock::Realtime(Instant::now()))
    }

    fn with_clock(clock: Clock) -> Self {
        Self {
            inner: Mutex::new(Inner {
                clock,
                buffers: Vec::new(),
            }),
        }
    }

    pub fn advance(&self, secs: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Clock::Manual(t) = &mut inner.clock {
                *t += secs;
            }
        }
    }

    pub fn set_time(&self, secs: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Clock::Manual(t) = &mut inner.clock {
                *t = secs;
            }
        }
    }

    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        self.inner
            .lock()
            .map(|inner| inner.buffers.clone())
            .unwrap_or_default()
    }

    /// Buffers audible at time `t`
    pub fn active_at(&self, t: f64) -> usize {
        self.scheduled()
            .iter()
            .filter(|b| !b.stopped && b.start <= t && t < b.start + b.duration)
            .count()
    }

    pub fn stopped_count(&self) -> usize {
        self.scheduled().iter().filter(|b| b.stopped).count()
    }
}

impl OutputClock for VirtualOutput {
    fn now(&self) -> f64 {
        match self.inner.lock() {
            Ok(inner) => match inner.clock {
                Clock::Manual(t) => t,
                Clock::Realtime(origin) => origin.elapsed().as_secs_f64(),
            },
            Err(_) => 0.0,
        }
    }
}

impl AudioOutput for VirtualOutput {
    fn schedule(
        &self,
        id: u64,
        samples: Vec<f32>,
        sample_rate: u32,
        start_at: f64,
    ) -> Result<(), PlaybackError> {
        let mut inner = self.inner.lock().map_err(|_| PlaybackError::Closed)?;
        inner.buffers.push(ScheduledBuffer {
            id,
            start: start_at,
            duration: samples.len() as f64 / sample_rate as f64,
            stopped: false,
        });
        Ok(())
    }

    fn stop(&self, id: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            for buffer in inner.buffers.iter_mut().filter(|b| b.id == id) {
                buffer.stopped = true;
            }
        }
    }
}
