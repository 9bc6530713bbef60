//! A frame source fed from code rather than hardware. Used by headless hosts
//! that already own an audio stream, and by tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{AudioFrame, AudioFrameSource, CaptureError, FrameStream};
use crate::encoder::INPUT_SAMPLE_RATE;

type SenderSlot = Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>;

pub struct ChannelFrameSource {
    slot: SenderSlot,
    sequence: Arc<AtomicU64>,
    sample_rate: u32,
    capacity: usize,
    unavailable: Option<String>,
}

/// Cloneable handle that pushes frames into an open `ChannelFrameSource`.
#[derive(Clone)]
pub struct FrameFeeder {
    slot: SenderSlot,
    sequence: Arc<AtomicU64>,
    sample_rate: u32,
}

impl ChannelFrameSource {
    pub fn new(capacity: usize) -> (Self, FrameFeeder) {
        Self::with_sample_rate(INPUT_SAMPLE_RATE, capacity)
    }

    pub fn with_sample_rate(sample_rate: u32, capacity: usize) -> (Self, FrameFeeder) {
        let slot: SenderSlot = Arc::new(Mutex::new(None));
        let sequence = Arc::new(AtomicU64::new(0));
        let feeder = FrameFeeder {
            slot: slot.clone(),
            sequence: sequence.clone(),
            sample_rate,
        };
        (
            Self {
                slot,
                sequence,
                sample_rate,
                capacity: capacity.max(1),
                unavailable: None,
            },
            feeder,
        )
    }

    /// A source whose `open` always fails, as a missing or denied device does.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        let (mut source, _) = Self::new(1);
        source.unavailable = Some(reason.into());
        source
    }
}

impl AudioFrameSource for ChannelFrameSource {
    fn open(&mut self) -> Result<FrameStream, CaptureError> {
        if let Some(reason) = &self.unavailable {
            return Err(CaptureError::Device(reason.clone()));
        }
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| CaptureError::Stream("frame slot poisoned".to_string()))?;
        if slot.is_some() {
            return Err(CaptureError::AlreadyOpen);
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        *slot = Some(tx);
        self.sequence.store(0, Ordering::SeqCst);
        log::debug!(
            "Capture: Channel source open at {}Hz (capacity {})",
            self.sample_rate,
            self.capacity
        );
        Ok(rx)
    }

    fn close(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            if slot.take().is_some() {
                log::debug!("Capture: Channel source closed");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.slot.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

impl FrameFeeder {
    /// Push one frame. Returns false if the source is closed or the
    /// consumer is behind, in which case the frame is dropped.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        let slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(_) => return false,
        };
        let Some(tx) = slot.as_ref() else {
            return false;
        };
        let frame = AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        };
        tx.try_send(frame).is_ok()
    }
}
