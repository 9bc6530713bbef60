use anyhow::Context;
use clap::Parser;
use live_voice_rs::{
    audio_capture::{list_devices, CaptureConfig, CpalFrameSource},
    config::{load_config, EngineConfig},
    engine::{EngineEvent, VoiceEngine},
    playback::{AudioOutput, CpalOutput, VirtualOutput},
    tools::ToolRegistry,
    wakeword::{Sensitivity, WakeWordConfig},
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

#[derive(Parser, Debug)]
#[command(name = "live-voice", about = "Talk to a live conversational agent")]
struct Args {
    /// JSON engine configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only respond after this phrase is spoken
    #[arg(long)]
    wake_word: Option<String>,

    /// Wake phrase position strictness: low, medium or high
    #[arg(long, default_value = "medium")]
    sensitivity: Sensitivity,

    /// Print capture devices and exit
    #[arg(long)]
    list_devices: bool,

    #[arg(long)]
    input_device: Option<String>,

    #[arg(long)]
    output_device: Option<String>,

    /// Stream the microphone only after pressing Enter
    #[arg(long)]
    push_to_talk: bool,

    #[arg(long)]
    voice: Option<String>,

    /// Text turn sent on connect so the agent speaks first
    #[arg(long)]
    greeting: Option<String>,
}

impl Args {
    fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => EngineConfig::default(),
        };

        if let Some(phrase) = &self.wake_word {
            let mut wake = config.wake_word.take().unwrap_or_else(WakeWordConfig::default);
            wake.phrase = phrase.clone();
            wake.sensitivity = self.sensitivity;
            config.wake_word = Some(wake);
        }
        if self.push_to_talk {
            config.push_to_talk = true;
        }
        if let Some(voice) = &self.voice {
            config.session.voice = voice.clone();
        }
        if self.greeting.is_some() {
            config.session.greeting = self.greeting.clone();
        }
        Ok(config)
    }
}

fn print_devices() -> anyhow::Result<()> {
    println!("🎤 Capture devices:");
    for device in list_devices()? {
        println!(
            "   {} ({} channel(s)){}",
            device.name,
            device.channel_count,
            if device.is_default { " [default]" } else { "" }
        );
    }
    Ok(())
}

fn open_output(device: Option<&str>) -> Arc<dyn AudioOutput> {
    match CpalOutput::new(device) {
        Ok(output) => {
            log::info!("🔊 Output running at {} Hz", output.device_rate());
            Arc::new(output)
        }
        Err(e) => {
            log::warn!("No usable output device ({}), replies will be silent", e);
            Arc::new(VirtualOutput::realtime())
        }
    }
}

fn example_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register_fn("getCurrentTime", |_| {
        Ok(json!({ "time": chrono::Local::now().to_rfc3339() }))
    });
    tools
}

fn print_event(event: &EngineEvent, wake_mode: bool) {
    match event {
        EngineEvent::StateChanged { to, .. } => {
            println!("📍 {}", to.status_text(wake_mode));
        }
        EngineEvent::TranscriptUpdated { .. } => {}
        EngineEvent::TurnFinalized(turn) => {
            if !turn.user.is_empty() {
                println!("🗣️  You: {}", turn.user);
            }
            if !turn.agent.is_empty() {
                println!("🤖 Agent: {}", turn.agent);
            }
        }
        EngineEvent::SessionOpened => println!("✅ Connected"),
        EngineEvent::SessionClosed { reason } => match reason {
            Some(reason) => println!("🔌 Session closed: {}", reason),
            None => println!("🔌 Session closed"),
        },
        EngineEvent::Error(message) => eprintln!("❌ {}", message),
        EngineEvent::Warning(message) => eprintln!("⚠️  {}", message),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_devices {
        return print_devices();
    }

    let config = args.engine_config()?;
    let wake_mode = config.wake_word.is_some();
    let push_to_talk = config.push_to_talk;
    let api = load_config()?;

    let capture = CpalFrameSource::new(CaptureConfig {
        device_name: args.input_device.clone(),
        ..Default::default()
    });

    let mut engine = VoiceEngine::builder()
        .api_key(api.gemini_key())
        .source(Box::new(capture))
        .output(open_output(args.output_device.as_deref()))
        .tools(example_tools())
        .build()?;

    let mut events = BroadcastStream::new(engine.subscribe());
    engine.start(config).await?;

    println!("🎧 Live voice session starting...");
    if wake_mode {
        println!("   Say the wake word to start talking");
    } else if !push_to_talk {
        println!("   Just start talking");
    }
    println!("   Press Enter to talk or interrupt, type a line to send text");
    println!("   Press Ctrl+C to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => {
                    print_event(&event, wake_mode);
                    if matches!(event, EngineEvent::SessionClosed { .. }) {
                        break;
                    }
                }
                Some(Err(e)) => log::warn!("Missed engine events: {}", e),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {
                    engine.press_talk();
                }
                Ok(Some(line)) => {
                    engine.submit_text(line.trim());
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    log::warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\n🛑 Stopping...");
                break;
            }
        }
    }

    if let Some(elapsed) = engine.status().elapsed() {
        log::info!("Session lasted {:.1}s", elapsed.as_secs_f64());
    }
    engine.stop().await;
    println!("👋 Goodbye!");
    Ok(())
}
