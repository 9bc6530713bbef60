use std::sync::Arc;
use std::thread;
use std::time::Duration;

use live_voice_rs::encoder::{samples_to_pcm16, OUTPUT_SAMPLE_RATE};
use live_voice_rs::playback::{CpalOutput, PlaybackScheduler};

const CHUNK_SAMPLES: usize = 2400; // 100ms at 24kHz

fn load_wav(path: &str) -> Result<(Vec<f32>, u32), Box<dyn std::error::Error>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    println!("📁 WAV file spec: {:?}", spec);

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err("only 16-bit integer WAV files are supported".into());
    }

    let channels = spec.channels as usize;
    let interleaved = reader
        .samples::<i16>()
        .map(|s| s.map(|sample| sample as f32 / i16::MAX as f32))
        .collect::<Result<Vec<f32>, _>>()?;

    // first channel only
    let mono = interleaved.into_iter().step_by(channels.max(1)).collect();
    Ok((mono, spec.sample_rate))
}

fn sine(seconds: f32, frequency: f32, sample_rate: u32) -> Vec<f32> {
    let count = (seconds * sample_rate as f32) as usize;
    (0..count)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            0.3 * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 2 {
        eprintln!("Usage: {} [audio_file.wav]", args[0]);
        eprintln!();
        eprintln!("Without a file a two second 440Hz tone is played.");
        std::process::exit(1);
    }

    let (samples, sample_rate) = match args.get(1) {
        Some(path) => load_wav(path)?,
        None => (sine(2.0, 440.0, OUTPUT_SAMPLE_RATE), OUTPUT_SAMPLE_RATE),
    };
    println!(
        "🎵 {} samples ({:.2}s at {}Hz)",
        samples.len(),
        samples.len() as f64 / sample_rate as f64,
        sample_rate
    );

    let output = Arc::new(CpalOutput::new(None)?);
    println!("🔊 Output device running at {}Hz", output.device_rate());
    let mut scheduler = PlaybackScheduler::new(output);

    // Chunks arrive faster than real time, the way streamed replies do
    for chunk in samples.chunks(CHUNK_SAMPLES) {
        scheduler.enqueue(&samples_to_pcm16(chunk), sample_rate)?;
        thread::sleep(Duration::from_millis(20));
    }
    println!(
        "📤 Scheduled {} chunk(s), {:.2}s queued",
        scheduler.in_flight(),
        scheduler.queued_secs()
    );

    while !scheduler.is_idle() {
        scheduler.reap_finished();
        thread::sleep(Duration::from_millis(50));
    }

    println!("🎉 Playback finished at {:.2}s", scheduler.now());
    Ok(())
}
