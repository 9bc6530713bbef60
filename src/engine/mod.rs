//! The conversation engine: one serialized loop that owns the session, the
//! playback scheduler, the transcript buffers and the wake gate, and drives
//! the state machine from capture frames, session events and timers.

pub mod state;

pub use state::{transition, ConversationEvent, ConversationState, Transition};

use secrecy::{ExposeSecret, SecretBox};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use strum::Display;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::audio_capture::{AudioFrame, AudioFrameSource, FrameStream};
use crate::config::{EngineConfig, SessionConfig};
use crate::encoder::FrameEncoder;
use crate::error::{EngineError, Result};
use crate::playback::{AudioOutput, PlaybackScheduler, VirtualOutput};
use crate::protocol::{ClientMessage, ServerEvent};
use crate::session::{ChannelListener, DuplexSessionChannel, SessionHandle, SessionNotice};
use crate::tools::{self, ToolRegistry};
use crate::transcript::{Role, TranscriptAggregator, TurnRecord};
use crate::wakeword::{GateAction, WakeWordGate};

const REAP_INTERVAL: Duration = Duration::from_millis(50);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 256;

/// Notifications for the host application
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged {
        from: ConversationState,
        to: ConversationState,
    },
    TranscriptUpdated {
        role: Role,
        text: String,
    },
    TurnFinalized(TurnRecord),
    SessionOpened,
    SessionClosed {
        reason: Option<String>,
    },
    Error(String),
    Warning(String),
}

/// How user speech reaches the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ListenMode {
    /// Microphone always streams; the service detects turns
    OpenMic,
    /// Microphone streams only while `Listening` after a talk press
    PushToTalk,
    /// Microphone always streams; replies are gated on a spoken wake phrase
    WakeWord,
}

impl ListenMode {
    pub fn from_config(config: &EngineConfig) -> Self {
        if config.wake_word.is_some() {
            ListenMode::WakeWord
        } else if config.push_to_talk {
            ListenMode::PushToTalk
        } else {
            ListenMode::OpenMic
        }
    }
}

/// Snapshot of what the host shows the user
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: ConversationState,
    pub status_text: String,
    pub last_error: Option<String>,
    pub session_started: Option<Instant>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: ConversationState::Idle,
            status_text: ConversationState::Idle.status_text(false).to_string(),
            last_error: None,
            session_started: None,
        }
    }
}

impl EngineStatus {
    /// Time since the current session opened
    pub fn elapsed(&self) -> Option<Duration> {
        self.session_started.map(|t| t.elapsed())
    }
}

fn lock_status(status: &Mutex<EngineStatus>) -> MutexGuard<'_, EngineStatus> {
    match status.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum Command {
    Talk,
    SubmitText(String),
    Stop,
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<Option<Box<dyn AudioFrameSource>>>,
}

#[derive(Default)]
pub struct VoiceEngineBuilder {
    api_key: Option<String>,
    source: Option<Box<dyn AudioFrameSource>>,
    output: Option<Arc<dyn AudioOutput>>,
    tools: ToolRegistry,
}

impl VoiceEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn source(mut self, source: Box<dyn AudioFrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn output(mut self, output: Arc<dyn AudioOutput>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn build(self) -> Result<VoiceEngine> {
        let source = self
            .source
            .ok_or_else(|| EngineError::Config("a capture source is required".to_string()))?;
        let output = self.output.unwrap_or_else(|| {
            log::info!("Engine: No output given, using a virtual realtime output");
            Arc::new(VirtualOutput::realtime())
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(VoiceEngine {
            api_key: SecretBox::new(Box::new(self.api_key.unwrap_or_default())),
            source: Some(source),
            output,
            tools: self.tools,
            events,
            status: Arc::new(Mutex::new(EngineStatus::default())),
            running: None,
        })
    }
}

/// Host-facing engine. Owns exactly one capture source and one output.
pub struct VoiceEngine {
    api_key: SecretBox<String>,
    source: Option<Box<dyn AudioFrameSource>>,
    output: Arc<dyn AudioOutput>,
    tools: ToolRegistry,
    events: broadcast::Sender<EngineEvent>,
    status: Arc<Mutex<EngineStatus>>,
    running: Option<Running>,
}

impl VoiceEngine {
    pub fn builder() -> VoiceEngineBuilder {
        VoiceEngineBuilder::new()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> EngineStatus {
        lock_status(&self.status).clone()
    }

    pub fn state(&self) -> ConversationState {
        lock_status(&self.status).state
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.task.is_finished())
            .unwrap_or(false)
    }

    /// Open capture, connect, and start the event loop. Fails fast with
    /// `AlreadyStarted` while a previous start is still running.
    ///
    /// The connect runs on the loop task, so a `stop` issued while it is
    /// pending (after this future was dropped) aborts it and returns the
    /// capture source.
    pub async fn start(&mut self, config: EngineConfig) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::AlreadyStarted);
        }
        self.reclaim().await;

        config.session.validate()?;
        let mode = ListenMode::from_config(&config);
        let gate = match &config.wake_word {
            Some(wake) => Some(WakeWordGate::new(wake, &wake.variant_table()?)?),
            None => None,
        };

        let mut source = self.source.take().ok_or_else(|| {
            EngineError::DeviceUnavailable("capture source is not available".to_string())
        })?;

        log::info!("Engine: Starting in {} mode", mode);
        let frames = match source.open() {
            Ok(frames) => frames,
            Err(e) => {
                self.source = Some(source);
                return Err(self.start_failed(e.into()));
            }
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let startup = Startup {
            session_config: config.session.clone(),
            api_key: SecretBox::new(Box::new(self.api_key.expose_secret().clone())),
            source,
            frames,
            commands: command_rx,
            ready: ready_tx,
            mode,
            gate,
            greeting: config.session.greeting.clone(),
            output: self.output.clone(),
            tools: self.tools.clone(),
            events: self.events.clone(),
            status: self.status.clone(),
        };
        self.running = Some(Running {
            commands,
            task: tokio::spawn(startup.run()),
        });

        let error = match ready_rx.await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => EngineError::ConnectionError("event loop ended while connecting".to_string()),
        };
        self.reclaim().await;
        Err(self.start_failed(error))
    }

    /// Tear everything down: capture, session, playback, then transcripts
    /// and timers. A no-op when not started.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.commands.send(Command::Stop);
        match tokio::time::timeout(STOP_TIMEOUT, running.task).await {
            Ok(Ok(source)) => self.source = source,
            Ok(Err(e)) => log::error!("Engine: Event loop failed: {}", e),
            Err(_) => log::error!("Engine: Event loop did not stop within {:?}", STOP_TIMEOUT),
        }
    }

    /// Push-to-talk press, also usable as manual barge-in
    pub fn press_talk(&self) -> bool {
        self.send_command(Command::Talk)
    }

    /// Send a typed user turn
    pub fn submit_text(&self, text: impl Into<String>) -> bool {
        self.send_command(Command::SubmitText(text.into()))
    }

    fn send_command(&self, command: Command) -> bool {
        match &self.running {
            Some(running) if !running.task.is_finished() => running.commands.send(command).is_ok(),
            _ => false,
        }
    }

    /// Collect the capture source back from a loop that ended on its own.
    async fn reclaim(&mut self) {
        if let Some(running) = self.running.take() {
            match running.task.await {
                Ok(source) => self.source = source,
                Err(e) => log::error!("Engine: Event loop failed: {}", e),
            }
        }
    }

    fn start_failed(&self, error: EngineError) -> EngineError {
        log::error!("Engine: Start failed: {}", error);
        lock_status(&self.status).last_error = Some(error.to_string());
        let _ = self.events.send(EngineEvent::Error(error.to_string()));
        error
    }
}

/// Everything the loop task needs to connect and then run.
struct Startup {
    session_config: SessionConfig,
    api_key: SecretBox<String>,
    source: Box<dyn AudioFrameSource>,
    frames: FrameStream,
    commands: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<()>>,
    mode: ListenMode,
    gate: Option<WakeWordGate>,
    greeting: Option<String>,
    output: Arc<dyn AudioOutput>,
    tools: ToolRegistry,
    events: broadcast::Sender<EngineEvent>,
    status: Arc<Mutex<EngineStatus>>,
}

impl Startup {
    async fn run(self) -> Option<Box<dyn AudioFrameSource>> {
        let Startup {
            session_config,
            api_key,
            mut source,
            frames,
            mut commands,
            ready,
            mode,
            gate,
            greeting,
            output,
            tools,
            events,
            status,
        } = self;

        let (listener, notices) = ChannelListener::new();
        let connected = tokio::select! {
            result = DuplexSessionChannel::connect(
                &session_config,
                api_key.expose_secret(),
                listener,
            ) => Some(result),
            _ = wait_for_stop(&mut commands) => None,
        };

        let mut session = match connected {
            Some(Ok(session)) => session,
            Some(Err(e)) => {
                source.close();
                let _ = ready.send(Err(e.into()));
                return Some(source);
            }
            None => {
                log::info!("Engine: Stopped while connecting");
                source.close();
                let _ = ready.send(Err(EngineError::ConnectionError(
                    "stopped while connecting".to_string(),
                )));
                return Some(source);
            }
        };
        session.attach_capture(source);

        {
            let mut status = lock_status(&status);
            status.last_error = None;
            status.status_text = status.state.status_text(mode == ListenMode::WakeWord).to_string();
        }

        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        let engine_loop = EngineLoop {
            state: ConversationState::Idle,
            mode,
            session,
            notices,
            frames,
            frames_open: true,
            commands,
            scheduler: PlaybackScheduler::new(output),
            transcripts: TranscriptAggregator::new(),
            gate,
            wake_buffer: String::new(),
            tools,
            tool_tx,
            tool_rx,
            pending_tools: HashSet::new(),
            reply_complete: false,
            greeting,
            events,
            status,
        };

        // A dropped `start` still leaves a running engine for `stop` to end
        let _ = ready.send(Ok(()));
        engine_loop.run().await
    }
}

/// Resolve on `Stop` or a dropped engine; other commands need an open
/// session and are dropped.
async fn wait_for_stop(commands: &mut mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Stop => return,
            Command::Talk | Command::SubmitText(_) => {
                log::debug!("Engine: Ignoring command while connecting")
            }
        }
    }
}

/// Append a transcript delta, keeping words apart.
fn append_delta(buffer: &mut String, delta: &str) {
    let joined = buffer.is_empty()
        || delta.is_empty()
        || buffer.ends_with(char::is_whitespace)
        || delta.starts_with(char::is_whitespace);
    if !joined {
        buffer.push(' ');
    }
    buffer.push_str(delta);
}

enum Exit {
    Stopped,
    Failed(String),
    Closed(Option<String>),
}

struct ToolOutcome {
    id: String,
    name: String,
    response: Value,
    unhandled: bool,
}

struct EngineLoop {
    state: ConversationState,
    mode: ListenMode,
    session: SessionHandle,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
    frames: FrameStream,
    frames_open: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    scheduler: PlaybackScheduler,
    transcripts: TranscriptAggregator,
    gate: Option<WakeWordGate>,
    /// User text since the gate last went dormant
    wake_buffer: String,
    tools: ToolRegistry,
    tool_tx: mpsc::UnboundedSender<ToolOutcome>,
    tool_rx: mpsc::UnboundedReceiver<ToolOutcome>,
    pending_tools: HashSet<String>,
    /// The service has finished sending the current reply
    reply_complete: bool,
    greeting: Option<String>,
    events: broadcast::Sender<EngineEvent>,
    status: Arc<Mutex<EngineStatus>>,
}

impl EngineLoop {
    async fn run(mut self) -> Option<Box<dyn AudioFrameSource>> {
        let mut reap = tokio::time::interval(REAP_INTERVAL);
        reap.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let exit = loop {
            let deadline = self.gate.as_ref().and_then(|g| g.deadline());

            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Talk) => self.dispatch(ConversationEvent::TalkPressed),
                    Some(Command::SubmitText(text)) => self.commit_turn(&text),
                    Some(Command::Stop) | None => break Exit::Stopped,
                },
                notice = self.notices.recv() => match notice {
                    Some(notice) => {
                        if let Some(exit) = self.on_notice(notice) {
                            break exit;
                        }
                    }
                    None => break Exit::Closed(None),
                },
                Some(outcome) = self.tool_rx.recv() => self.on_tool_outcome(outcome),
                frame = self.frames.recv(), if self.frames_open => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => {
                        self.frames_open = false;
                        log::warn!("Engine: Capture stream ended");
                        self.emit(EngineEvent::Warning("capture stream ended".to_string()));
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_silence_timeout();
                }
                _ = reap.tick() => {
                    self.scheduler.reap_finished();
                    self.check_playback_finished();
                }
            }
        };

        self.shutdown(exit).await
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn dispatch(&mut self, event: ConversationEvent) {
        let t = transition(self.state, event);
        if t.cancel_playback {
            let stopped = self.scheduler.cancel_all();
            if stopped > 0 {
                log::info!("Engine: Cancelled {} playback chunk(s) on {}", stopped, event);
            }
        }
        if t.from == t.to {
            return;
        }

        log::info!("Engine: {} -> {} ({})", t.from, t.to, event);
        if t.to == ConversationState::Speaking {
            self.reply_complete = false;
        }
        if t.to == ConversationState::Idle && !self.gate_active() {
            self.clear_wake_text();
        }
        self.state = t.to;
        {
            let mut status = lock_status(&self.status);
            status.state = t.to;
            status.status_text = t.to.status_text(self.mode == ListenMode::WakeWord).to_string();
        }
        self.emit(EngineEvent::StateChanged {
            from: t.from,
            to: t.to,
        });
    }

    fn gate_active(&self) -> bool {
        self.gate.as_ref().map(|g| g.is_active()).unwrap_or(false)
    }

    /// Forget user text seen while the gate was dormant.
    fn clear_wake_text(&mut self) {
        if self.gate.is_some() {
            self.wake_buffer.clear();
            self.transcripts.clear(Role::User);
        }
    }

    fn replies_allowed(&self) -> bool {
        self.mode != ListenMode::WakeWord
            || matches!(
                self.state,
                ConversationState::Processing | ConversationState::Speaking
            )
    }

    fn on_notice(&mut self, notice: SessionNotice) -> Option<Exit> {
        match notice {
            SessionNotice::Opened => {
                self.on_open();
                None
            }
            SessionNotice::Event(event) => self.on_server_event(event),
            SessionNotice::Failed(message) => Some(Exit::Failed(message)),
            SessionNotice::Closed(reason) => Some(Exit::Closed(reason)),
        }
    }

    fn on_open(&mut self) {
        lock_status(&self.status).session_started = Some(Instant::now());
        self.emit(EngineEvent::SessionOpened);
        if let Some(greeting) = self.greeting.take() {
            log::info!("Engine: Sending greeting");
            self.commit_turn(&greeting);
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) -> Option<Exit> {
        match event {
            ServerEvent::SetupComplete => {}
            ServerEvent::PartialTranscript {
                role: Role::User,
                text,
            } => self.on_user_partial(&text),
            ServerEvent::PartialTranscript {
                role: Role::Agent,
                text,
            } => self.on_agent_partial(&text),
            ServerEvent::AudioChunk { data, sample_rate } => self.on_audio(&data, sample_rate),
            ServerEvent::TurnComplete => self.on_turn_complete(),
            ServerEvent::Interrupted => {
                if self.state == ConversationState::Speaking {
                    log::info!("Engine: Service reported barge-in");
                    self.dispatch(ConversationEvent::SpeechDetected);
                }
            }
            ServerEvent::ToolInvocation { id, name, args } => self.on_tool_call(id, name, args),
            ServerEvent::ToolCallCancelled { ids } => {
                for id in ids {
                    if self.pending_tools.remove(&id) {
                        log::info!("Engine: Tool call {} cancelled", id);
                    }
                }
            }
            ServerEvent::GoAway { time_left } => {
                log::warn!(
                    "Engine: Service is going away (time left: {})",
                    time_left.as_deref().unwrap_or("unknown")
                );
                return Some(Exit::Closed(Some("go away".to_string())));
            }
        }
        None
    }

    fn on_user_partial(&mut self, delta: &str) {
        let text = self.transcripts.on_partial(Role::User, delta).to_string();
        self.emit(EngineEvent::TranscriptUpdated {
            role: Role::User,
            text,
        });

        match self.gate.as_mut() {
            Some(gate) => {
                append_delta(&mut self.wake_buffer, delta);
                if gate.on_partial(&self.wake_buffer, Instant::now()) == GateAction::Activated {
                    self.dispatch(ConversationEvent::WakeDetected);
                }
            }
            None => {
                if self.state == ConversationState::Idle && self.mode == ListenMode::OpenMic {
                    self.dispatch(ConversationEvent::SpeechDetected);
                }
            }
        }
    }

    fn on_agent_partial(&mut self, delta: &str) {
        if !self.replies_allowed() {
            return;
        }
        let text = self.transcripts.on_partial(Role::Agent, delta).to_string();
        self.emit(EngineEvent::TranscriptUpdated {
            role: Role::Agent,
            text,
        });
        self.dispatch(ConversationEvent::ReplyArrived);
    }

    fn on_audio(&mut self, data: &[u8], sample_rate: u32) {
        if !self.replies_allowed() {
            log::trace!("Engine: Ignoring reply audio while dormant");
            return;
        }
        match self.scheduler.enqueue(data, sample_rate) {
            Ok(Some(_)) => self.dispatch(ConversationEvent::ReplyArrived),
            Ok(None) => {}
            Err(e) => {
                let warning = EngineError::from(e).to_string();
                log::warn!("Engine: Dropping reply audio chunk: {}", warning);
                self.emit(EngineEvent::Warning(warning));
            }
        }
    }

    fn on_turn_complete(&mut self) {
        self.reply_complete = true;

        if self.mode == ListenMode::WakeWord && !self.replies_allowed() {
            // A reply we never played; keep only an utterance still in progress
            self.transcripts.clear(Role::Agent);
            if !self.gate_active() {
                self.clear_wake_text();
            }
            return;
        }

        let record = self.transcripts.on_turn_complete();
        self.emit(EngineEvent::TurnFinalized(record));
        if !self.gate_active() {
            self.wake_buffer.clear();
        }
        self.check_playback_finished();
    }

    fn check_playback_finished(&mut self) {
        if self.state == ConversationState::Speaking
            && self.reply_complete
            && self.scheduler.is_idle()
        {
            self.dispatch(ConversationEvent::PlaybackFinished);
        }
    }

    fn on_frame(&mut self, frame: AudioFrame) {
        if self.mode == ListenMode::PushToTalk && self.state != ConversationState::Listening {
            return;
        }
        let chunk = FrameEncoder::new(frame.sample_rate).encode(&frame.samples);
        self.session.send(chunk);
    }

    fn on_silence_timeout(&mut self) {
        let Some(gate) = self.gate.as_mut() else {
            return;
        };
        let committed = gate.poll_commit(Instant::now());
        if !gate.is_active() {
            self.wake_buffer.clear();
        }
        if let Some(utterance) = committed {
            self.commit_turn(&utterance);
        }
    }

    /// Send a complete user text turn and wait for the reply.
    fn commit_turn(&mut self, text: &str) {
        if self.session.send_message(ClientMessage::text_turn(text)) {
            self.dispatch(ConversationEvent::TurnCommitted);
        } else {
            log::warn!("Engine: Session not open, dropping turn '{}'", text);
        }
    }

    fn on_tool_call(&mut self, id: String, name: String, args: Value) {
        log::info!("Engine: Tool call {} ({})", name, id);
        self.pending_tools.insert(id.clone());
        let tools = self.tools.clone();
        let tx = self.tool_tx.clone();
        tokio::spawn(async move {
            let outcome = match tools.handle(&name, args).await {
                Ok(response) => ToolOutcome {
                    id,
                    name,
                    response,
                    unhandled: false,
                },
                Err(e) => ToolOutcome {
                    response: tools::failure_response(&e.to_string()),
                    id,
                    name,
                    unhandled: true,
                },
            };
            let _ = tx.send(outcome);
        });
    }

    fn on_tool_outcome(&mut self, outcome: ToolOutcome) {
        if !self.pending_tools.remove(&outcome.id) {
            log::info!("Engine: Dropping result of cancelled tool call {}", outcome.id);
            return;
        }
        if outcome.unhandled {
            let warning = EngineError::ToolCallUnhandled(outcome.name.clone()).to_string();
            log::warn!("Engine: {}", warning);
            self.emit(EngineEvent::Warning(warning));
        }
        self.session.send_message(ClientMessage::tool_response(
            &outcome.id,
            &outcome.name,
            outcome.response,
        ));
    }

    async fn shutdown(mut self, exit: Exit) -> Option<Box<dyn AudioFrameSource>> {
        // Capture first, then the transport
        let source = self.session.close().await;
        self.scheduler.cancel_all();
        self.transcripts.discard();
        if let Some(gate) = self.gate.as_mut() {
            gate.reset();
        }
        self.wake_buffer.clear();
        self.pending_tools.clear();

        let reason = match exit {
            Exit::Stopped => {
                self.dispatch(ConversationEvent::Stop);
                None
            }
            Exit::Failed(message) => {
                let error = EngineError::ConnectionError(message);
                lock_status(&self.status).last_error = Some(error.to_string());
                self.emit(EngineEvent::Error(error.to_string()));
                self.dispatch(ConversationEvent::ChannelError);
                Some(error.to_string())
            }
            Exit::Closed(reason) => {
                self.dispatch(ConversationEvent::Stop);
                reason
            }
        };

        lock_status(&self.status).session_started = None;
        self.emit(EngineEvent::SessionClosed { reason });
        log::info!("Engine: Stopped");
        source
    }
}
