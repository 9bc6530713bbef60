use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use super::{AudioOutput, OutputClock, PlaybackError};

/// A buffer placed on the output timeline, already at the device rate
struct Voice {
    id: u64,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

struct Timeline {
    voices: Vec<Voice>,
}

/// Speaker output through cpal.
///
/// The device callback mixes every voice that overlaps the current block and
/// advances a frame counter, which doubles as the output clock. Like the
/// capture side, the `cpal::Stream` lives on its own thread.
pub struct CpalOutput {
    timeline: Arc<Mutex<Timeline>>,
    cursor: Mutex<TimelineCursor>,
    frames_played: Arc<AtomicU64>,
    device_rate: u32,
    stop_tx: Sender<()>,
    audio_thread: Option<thread::JoinHandle<()>>,
}

impl CpalOutput {
    pub fn new(device_name: Option<&str>) -> Result<Self, PlaybackError> {
        log::debug!("Playback: Creating cpal output");
        let host = cpal::default_host();
        log::debug!("Playback: Using audio host: {:?}", host.id());

        let device = match device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| PlaybackError::Device(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| PlaybackError::Device(format!("Device not found: {}", name)))?,
            None => host
                .default_output_device()
                .ok_or_else(|| PlaybackError::Device("No output device found".to_string()))?,
        };
        log::info!("Playback: Using output device: {:?}", device.name());

        let supported_config = device
            .default_output_config()
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        log::debug!("Playback: Using output config: {:?}", supported_config);

        let device_rate = supported_config.sample_rate().0;
        let timeline = Arc::new(Mutex::new(Timeline { voices: Vec::new() }));
        let frames_played = Arc::new(AtomicU64::new(0));

        let (stop_tx, stop_rx) = channel::<()>();
        let (ready_tx, ready_rx) = channel::<Result<(), PlaybackError>>();

        let thread_timeline = timeline.clone();
        let thread_frames = frames_played.clone();
        let audio_thread = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let config = supported_config.config();
                let stream = match supported_config.sample_format() {
                    SampleFormat::F32 => {
                        build_stream::<f32>(&device, &config, thread_timeline, thread_frames)
                    }
                    SampleFormat::I16 => {
                        build_stream::<i16>(&device, &config, thread_timeline, thread_frames)
                    }
                    SampleFormat::U16 => {
                        build_stream::<u16>(&device, &config, thread_timeline, thread_frames)
                    }
                    other => Err(PlaybackError::Device(format!(
                        "Unsupported sample format {:?}",
                        other
                    ))),
                };

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(PlaybackError::Stream(e.to_string())));
                    return;
                }

                log::debug!("Playback: Output stream started");
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                log::debug!("Playback: Output thread exiting");
            })
            .map_err(|e| PlaybackError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                timeline,
                cursor: Mutex::new(TimelineCursor::new(device_rate)),
                frames_played,
                device_rate,
                stop_tx,
                audio_thread: Some(audio_thread),
            }),
            Ok(Err(e)) => {
                let _ = audio_thread.join();
                log::error!("Playback: Failed to start output: {}", e);
                Err(e)
            }
            Err(_) => {
                let _ = audio_thread.join();
                Err(PlaybackError::Stream("output thread exited early".to_string()))
            }
        }
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    timeline: Arc<Mutex<Timeline>>,
    frames_played: Arc<AtomicU64>,
) -> Result<cpal::Stream, PlaybackError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let block_start = frames_played.load(Ordering::Acquire);
                let block_frames = (data.len() / channels) as u64;

                match timeline.lock() {
                    Ok(mut timeline) => {
                        for (i, frame) in data.chunks_mut(channels).enumerate() {
                            let position = block_start + i as u64;
                            let mut mixed = 0.0f32;
                            for voice in &timeline.voices {
                                if position >= voice.start_frame && position < voice.end_frame() {
                                    mixed += voice.samples[(position - voice.start_frame) as usize];
                                }
                            }
                            let value = T::from_sample(mixed.clamp(-1.0, 1.0));
                            for out in frame.iter_mut() {
                                *out = value;
                            }
                        }
                        let block_end = block_start + block_frames;
                        timeline.voices.retain(|v| v.end_frame() > block_end);
                    }
                    Err(_) => {
                        for out in data.iter_mut() {
                            *out = T::EQUILIBRIUM;
                        }
                    }
                }

                frames_played.fetch_add(block_frames, Ordering::Release);
            },
            move |err| {
                log::error!("Playback: Stream error: {}", err);
            },
            None,
        )
        .map_err(|e| PlaybackError::Stream(e.to_string()))
}

/// Linear interpolation that carries its phase and the last input sample
/// from one chunk to the next, so a stream resampled in pieces matches the
/// same stream resampled at once. Output lags the input by one sample.
struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    /// Output samples emitted so far
    produced: u64,
    /// Absolute input index of `carry`
    base: u64,
    carry: Option<f32>,
}

impl StreamResampler {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            produced: 0,
            base: 0,
            carry: None,
        }
    }

    fn process(&mut self, chunk: &[f32]) -> Vec<f32> {
        if self.from_rate == self.to_rate {
            return chunk.to_vec();
        }
        let Some(&tail) = chunk.last() else {
            return Vec::new();
        };

        let (from, to) = (self.from_rate as u64, self.to_rate as u64);
        let carry = self.carry.unwrap_or(0.0);
        let first = if self.carry.is_some() {
            self.base + 1
        } else {
            self.base
        };
        let last = first + chunk.len() as u64 - 1;
        let sample = |i: u64| {
            if i < first {
                carry
            } else {
                chunk[(i - first) as usize]
            }
        };

        let mut out = Vec::with_capacity((chunk.len() as u64 * to / from) as usize + 1);
        loop {
            let position = self.produced * from;
            let idx = position / to;
            if idx + 1 > last {
                break;
            }
            let fract = (position % to) as f32 / to as f32;
            let a = sample(idx);
            let b = sample(idx + 1);
            out.push(a + (b - a) * fract);
            self.produced += 1;
        }

        self.base = last;
        self.carry = Some(tail);
        out
    }
}

/// Maps scheduled chunks to device frames. A chunk that starts where the
/// previous one ended, at the same rate, is placed on its exact end frame
/// and resampled with the carried state; anything else starts afresh at
/// its rounded start frame.
struct TimelineCursor {
    device_rate: u32,
    end_secs: f64,
    end_frame: u64,
    resampler: Option<StreamResampler>,
}

impl TimelineCursor {
    fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            end_secs: 0.0,
            end_frame: 0,
            resampler: None,
        }
    }

    /// Returns the start frame and the samples at the device rate.
    fn place(&mut self, samples: &[f32], sample_rate: u32, start_at: f64) -> (u64, Vec<f32>) {
        let device_rate = self.device_rate;
        let one_frame = 1.0 / device_rate as f64;
        let continues = self
            .resampler
            .as_ref()
            .map(|r| r.from_rate == sample_rate)
            .unwrap_or(false)
            && (start_at - self.end_secs).abs() <= one_frame;

        if !continues {
            self.resampler = None;
            self.end_frame = (start_at * device_rate as f64).round().max(0.0) as u64;
        }
        let resampler = self
            .resampler
            .get_or_insert_with(|| StreamResampler::new(sample_rate, device_rate));

        let start_frame = self.end_frame;
        let out = resampler.process(samples);
        self.end_frame += out.len() as u64;
        self.end_secs = start_at + samples.len() as f64 / sample_rate as f64;
        (start_frame, out)
    }

    fn reset(&mut self) {
        self.resampler = None;
    }
}

impl OutputClock for CpalOutput {
    fn now(&self) -> f64 {
        self.frames_played.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }
}

impl AudioOutput for CpalOutput {
    fn schedule(
        &self,
        id: u64,
        samples: Vec<f32>,
        sample_rate: u32,
        start_at: f64,
    ) -> Result<(), PlaybackError> {
        let (start_frame, samples) = {
            let mut cursor = self.cursor.lock().map_err(|_| PlaybackError::Closed)?;
            cursor.place(&samples, sample_rate, start_at)
        };
        let mut timeline = self.timeline.lock().map_err(|_| PlaybackError::Closed)?;
        timeline.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
        Ok(())
    }

    fn stop(&self, id: u64) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.voices.retain(|v| v.id != id);
        }
        if let Ok(mut cursor) = self.cursor.lock() {
            cursor.reset();
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.audio_thread.take() {
            if let Err(e) = thread.join() {
                log::error!("Playback: Failed to join audio thread: {:?}", e);
            }
        }
    }
}
