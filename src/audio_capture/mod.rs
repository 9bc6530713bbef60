pub mod channel;
pub mod imp_cpal;

pub use channel::{ChannelFrameSource, FrameFeeder};
pub use imp_cpal::{list_devices, CpalFrameSource};

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::encoder::INPUT_SAMPLE_RATE;

/// Samples per emitted frame, ~256 ms at 16 kHz
pub const DEFAULT_FRAME_SIZE: usize = 4096;
/// Fixed input block fed to the resampler
const RESAMPLER_CHUNK: usize = 1024;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No audio devices found")]
    NoDevices,
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Resampling error: {0}")]
    Resampling(String),
    #[error("Capture already open")]
    AlreadyOpen,
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device name to capture from (None = default device)
    pub device_name: Option<String>,
    /// Channel to capture (0-based index)
    pub channel: u32,
    pub frame_size: usize,
    /// Rate of emitted frames; hardware audio is resampled to this
    pub sample_rate: u32,
    /// Frames buffered between the device callback and the consumer
    pub queue_depth: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            channel: 0,
            frame_size: DEFAULT_FRAME_SIZE,
            sample_rate: INPUT_SAMPLE_RATE,
            queue_depth: 16,
        }
    }
}

/// Audio device information
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub channel_count: u32,
}

/// A fixed-length block of mono samples in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Monotonic per open; gaps mean dropped frames
    pub sequence: u64,
}

impl AudioFrame {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

pub type FrameStream = mpsc::Receiver<AudioFrame>;

/// A live capture device emitting fixed-size frames in capture order.
pub trait AudioFrameSource: Send {
    /// Acquire the device and start emitting frames. Fails with a
    /// `CaptureError` if the device cannot be acquired.
    fn open(&mut self) -> Result<FrameStream, CaptureError>;

    /// Release the device. Idempotent, and safe before `open`.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Cuts an arbitrary sample stream into fixed-size frames, resampling to the
/// target rate on the way when the hardware rate differs.
pub struct FrameAssembler {
    frame_size: usize,
    sample_rate: u32,
    sequence: u64,
    resampler: Option<SincFixedIn<f32>>,
    resample_input: Vec<f32>,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(input_rate: u32, config: &CaptureConfig) -> Result<Self, CaptureError> {
        if config.frame_size == 0 {
            return Err(CaptureError::Config("frame_size must be non-zero".to_string()));
        }

        let resampler = if input_rate != config.sample_rate {
            let ratio = config.sample_rate as f64 / input_rate as f64;
            let params = SincInterpolationParameters {
                sinc_len: 32,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLER_CHUNK, 1)
                .map_err(|e| CaptureError::Resampling(e.to_string()))?;
            log::info!(
                "Capture: Resampling {}Hz -> {}Hz (ratio: {:.3})",
                input_rate,
                config.sample_rate,
                ratio
            );
            Some(resampler)
        } else {
            None
        };

        Ok(Self {
            frame_size: config.frame_size,
            sample_rate: config.sample_rate,
            sequence: 0,
            resampler,
            resample_input: Vec::new(),
            pending: Vec::with_capacity(config.frame_size),
        })
    }

    /// Push mono samples at the input rate; `emit` receives each completed
    /// frame in order.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        match self.resampler.as_mut() {
            Some(resampler) => {
                self.resample_input.extend_from_slice(samples);
                while self.resample_input.len() >= RESAMPLER_CHUNK {
                    let block: Vec<f32> = self.resample_input.drain(..RESAMPLER_CHUNK).collect();
                    match resampler.process(&[block], None) {
                        Ok(mut output) => {
                            if let Some(channel) = output.pop() {
                                self.pending.extend_from_slice(&channel);
                            }
                        }
                        Err(e) => log::error!("Capture: Resampling error: {}", e),
                    }
                }
            }
            None => self.pending.extend_from_slice(samples),
        }

        while self.pending.len() >= self.frame_size {
            let samples: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            let frame = AudioFrame {
                samples,
                sample_rate: self.sample_rate,
                sequence: self.sequence,
            };
            self.sequence += 1;
            emit(frame);
        }
    }
}
