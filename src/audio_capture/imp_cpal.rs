use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream as CpalStream,
};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::mpsc;

use super::{
    AudioDeviceInfo, AudioFrame, AudioFrameSource, CaptureConfig, CaptureError, FrameAssembler,
    FrameStream,
};

/// Microphone capture through cpal.
///
/// `cpal::Stream` is not `Send`, so the stream lives on a dedicated thread
/// for as long as the source is open. `open` waits for that thread to report
/// whether the device could be acquired.
pub struct CpalFrameSource {
    config: CaptureConfig,
    stop_tx: Option<std_mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CpalFrameSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            stop_tx: None,
            handle: None,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }
}

impl AudioFrameSource for CpalFrameSource {
    fn open(&mut self) -> Result<FrameStream, CaptureError> {
        if self.handle.is_some() {
            return Err(CaptureError::AlreadyOpen);
        }

        let (frame_tx, frame_rx) = mpsc::channel(self.config.queue_depth.max(1));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), CaptureError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = self.config.clone();

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || match build_stream(&config, frame_tx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Blocks until close() signals or the source is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::info!("Capture: Device released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| CaptureError::Stream(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                self.handle = Some(handle);
                Ok(frame_rx)
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                log::error!("Capture: Failed to open device: {}", e);
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::Stream(
                    "capture thread exited before reporting readiness".to_string(),
                ))
            }
        }
    }

    fn close(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Capture: Capture thread panicked");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for CpalFrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn find_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, CaptureError> {
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| CaptureError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| CaptureError::Device(format!("Device not found: {}", name))),
        None => host
            .default_input_device()
            .ok_or_else(|| CaptureError::Device("No default input device found".into())),
    }
}

fn build_stream(
    config: &CaptureConfig,
    sender: mpsc::Sender<AudioFrame>,
) -> Result<CpalStream, CaptureError> {
    let host = cpal::default_host();
    log::info!("Capture: Initializing with host {:?}", host.id());

    let device = find_device(&host, config.device_name.as_deref())?;
    log::info!("Capture: Using input device {:?}", device.name());

    let supported_config = match select_input_config(&device, config.channel, config.sample_rate)
    {
        Ok(c) => c,
        Err(err) => {
            log::warn!(
                "Capture: Failed to select preferred input config: {}. Falling back to default.",
                err
            );
            device
                .default_input_config()
                .map_err(|e| CaptureError::Device(e.to_string()))?
        }
    };

    if config.channel >= u32::from(supported_config.channels()) {
        return Err(CaptureError::Config(format!(
            "Selected channel {} is not available (device has {} channels)",
            config.channel,
            supported_config.channels()
        )));
    }

    let stream_config = supported_config.config();
    let hardware_rate = stream_config.sample_rate.0;
    let channels = stream_config.channels as usize;

    log::info!(
        "Capture: Hardware {}Hz, {} channels, {:?} -> {}Hz mono frames of {}",
        hardware_rate,
        channels,
        supported_config.sample_format(),
        config.sample_rate,
        config.frame_size
    );

    let assembler = FrameAssembler::new(hardware_rate, config)?;

    let stream = match supported_config.sample_format() {
        SampleFormat::I16 => create_input_stream::<i16>(
            &device,
            &stream_config,
            config.channel,
            channels,
            sender,
            assembler,
        )?,
        SampleFormat::U16 => create_input_stream::<u16>(
            &device,
            &stream_config,
            config.channel,
            channels,
            sender,
            assembler,
        )?,
        SampleFormat::F32 => create_input_stream::<f32>(
            &device,
            &stream_config,
            config.channel,
            channels,
            sender,
            assembler,
        )?,
        other => {
            return Err(CaptureError::Config(format!(
                "Unsupported sample format {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| CaptureError::Device(e.to_string()))?;

    Ok(stream)
}

/// Prefer integer formats and the rate closest to the target.
fn select_input_config(
    device: &Device,
    channel: u32,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig, CaptureError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| CaptureError::Config(e.to_string()))?;

    let mut best: Option<cpal::SupportedStreamConfig> = None;
    let mut best_format_rank = u8::MAX;
    let mut best_rate_diff = u32::MAX;

    for range in configs {
        if channel >= range.channels() as u32 {
            continue;
        }

        let format_rank = match range.sample_format() {
            SampleFormat::I16 => 0,
            SampleFormat::F32 => 1,
            SampleFormat::U16 => 2,
            _ => 3,
        };

        let chosen_rate = target_rate.clamp(range.min_sample_rate().0, range.max_sample_rate().0);
        let rate_diff = chosen_rate.abs_diff(target_rate);

        if format_rank < best_format_rank
            || (format_rank == best_format_rank && rate_diff < best_rate_diff)
        {
            best_format_rank = format_rank;
            best_rate_diff = rate_diff;
            best = Some(range.with_sample_rate(cpal::SampleRate(chosen_rate)));
        }
    }

    best.ok_or_else(|| CaptureError::Config("No supported input configs found".to_string()))
}

fn create_input_stream<T>(
    device: &Device,
    config: &cpal::StreamConfig,
    channel: u32,
    channels: usize,
    sender: mpsc::Sender<AudioFrame>,
    mut assembler: FrameAssembler,
) -> Result<CpalStream, CaptureError>
where
    T: Sample + SizedSample + Send + Sync + 'static,
    f32: FromSample<T>,
{
    let mut mono = Vec::new();
    let mut dropped: u64 = 0;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                for frame in data.chunks(channels) {
                    if let Some(s) = frame.get(channel as usize) {
                        mono.push(f32::from_sample(*s));
                    }
                }

                assembler.push(&mono, |frame| {
                    // Never block the device callback; a slow consumer loses frames
                    if sender.try_send(frame).is_err() {
                        dropped += 1;
                        if dropped % 50 == 1 {
                            log::warn!("Capture: Consumer behind, {} frame(s) dropped", dropped);
                        }
                    }
                });
            },
            move |err| log::error!("Capture: Stream error: {}", err),
            None,
        )
        .map_err(|e| CaptureError::Device(e.to_string()))
}

/// List available input devices
pub fn list_devices() -> Result<Vec<AudioDeviceInfo>, CaptureError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| CaptureError::Device(e.to_string()))?;

    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut infos = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else { continue };
        let channel_count = device
            .default_input_config()
            .map(|c| u32::from(c.channels()))
            .unwrap_or(0);
        infos.push(AudioDeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            channel_count,
        });
    }

    if infos.is_empty() {
        return Err(CaptureError::NoDevices);
    }
    Ok(infos)
}
