//! The bidirectional streaming connection to the remote conversational
//! service.
//!
//! `DuplexSessionChannel::connect` opens the socket, sends the setup message
//! and spawns one writer and one reader task. Inbound traffic is reported
//! through a [`SessionListener`]; outbound audio goes through a bounded queue
//! that drops on overflow so a slow network never stalls capture.

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::audio_capture::AudioFrameSource;
use crate::config::SessionConfig;
use crate::encoder::EncodedChunk;
use crate::protocol::{ClientMessage, ProtocolError, ServerEvent, ServerMessage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Timed out connecting to {0}")]
    Timeout(String),
    #[error("Remote closed the session: {0}")]
    RemoteClosed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Receives everything that happens on a session. Called from the session's
/// reader task; implementations should hand work off rather than block.
pub trait SessionListener: Send + Sync + 'static {
    fn on_open(&self);
    fn on_server_event(&self, event: ServerEvent);
    /// Called at most once per session, after which the session is closed.
    fn on_error(&self, error: SessionError);
    fn on_close(&self, reason: Option<String>);
}

/// Listener callbacks flattened into one queue
#[derive(Debug)]
pub enum SessionNotice {
    Opened,
    Event(ServerEvent),
    Failed(String),
    Closed(Option<String>),
}

/// A [`SessionListener`] that forwards every callback into a channel so a
/// single consumer can handle them in order.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<SessionNotice>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl SessionListener for ChannelListener {
    fn on_open(&self) {
        let _ = self.tx.send(SessionNotice::Opened);
    }

    fn on_server_event(&self, event: ServerEvent) {
        let _ = self.tx.send(SessionNotice::Event(event));
    }

    fn on_error(&self, error: SessionError) {
        let _ = self.tx.send(SessionNotice::Failed(error.to_string()));
    }

    fn on_close(&self, reason: Option<String>) {
        let _ = self.tx.send(SessionNotice::Closed(reason));
    }
}

struct Shared {
    state: Mutex<SessionState>,
    errored: AtomicBool,
    close_notified: AtomicBool,
    listener: Arc<dyn SessionListener>,
    audio_tx: mpsc::Sender<ClientMessage>,
    preroll: Mutex<VecDeque<EncodedChunk>>,
    preroll_capacity: usize,
    dropped: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    fn state(&self) -> SessionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Closed)
    }

    fn set_state(&self, next: SessionState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                log::debug!("Session: {} -> {}", *state, next);
                *state = next;
            }
        }
    }

    fn mark_open(&self) {
        self.set_state(SessionState::Open);
        let buffered: Vec<EncodedChunk> = self
            .preroll
            .lock()
            .map(|mut ring| ring.drain(..).collect())
            .unwrap_or_default();
        if !buffered.is_empty() {
            log::info!("Session: Flushing {} pre-roll frame(s)", buffered.len());
        }
        for chunk in buffered {
            self.enqueue_audio(&chunk);
        }
        self.listener.on_open();
    }

    fn enqueue_audio(&self, chunk: &EncodedChunk) -> bool {
        match self.audio_tx.try_send(ClientMessage::audio(chunk)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 50 == 1 {
                    log::warn!("Session: Outbound queue full, {} frame(s) dropped", dropped);
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Report a failure once, then tear the session down.
    fn fail(&self, error: SessionError) {
        if !self.errored.swap(true, Ordering::SeqCst) {
            log::error!("Session: {}", error);
            self.set_state(SessionState::Closed);
            self.listener.on_error(error);
        }
        self.shutdown.cancel();
    }

    fn notify_closed(&self, reason: Option<String>) {
        self.set_state(SessionState::Closed);
        if !self.close_notified.swap(true, Ordering::SeqCst) {
            log::info!(
                "Session: Closed{}",
                reason
                    .as_deref()
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default()
            );
            self.listener.on_close(reason);
        }
    }
}

/// Handle to one live session. Dropping it without `close` cancels the
/// background tasks but skips the graceful close handshake.
pub struct SessionHandle {
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<ClientMessage>,
    capture: Option<Box<dyn AudioFrameSource>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct DuplexSessionChannel;

impl DuplexSessionChannel {
    /// Connect and send the setup message. The returned handle is
    /// `Connecting` until the service acknowledges setup.
    pub async fn connect(
        config: &SessionConfig,
        api_key: &str,
        listener: Arc<dyn SessionListener>,
    ) -> Result<SessionHandle, SessionError> {
        let mut url = Url::parse(&config.endpoint)?;
        if !api_key.is_empty() {
            url.query_pairs_mut().append_pair("key", api_key);
        }

        log::info!("Session: Connecting to {} ({})", config.endpoint, config.model);
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| SessionError::Timeout(config.endpoint.clone()))??;
        let (mut write, mut read) = ws_stream.split();

        let setup = ClientMessage::setup(config).to_json()?;
        write.send(Message::Text(setup.into())).await?;
        log::debug!("Session: Setup sent");

        let (audio_tx, mut audio_rx) = mpsc::channel::<ClientMessage>(config.outbound_capacity.max(1));
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let shutdown = CancellationToken::new();

        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Connecting),
            errored: AtomicBool::new(false),
            close_notified: AtomicBool::new(false),
            listener,
            audio_tx,
            preroll: Mutex::new(VecDeque::with_capacity(config.preroll_frames)),
            preroll_capacity: config.preroll_frames,
            dropped: AtomicU64::new(0),
            shutdown: shutdown.clone(),
        });

        let writer_shared = shared.clone();
        let writer = tokio::spawn(async move {
            let mut sent: u64 = 0;
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = writer_shared.shutdown.cancelled() => break,
                    Some(msg) = control_rx.recv() => msg,
                    Some(msg) = audio_rx.recv() => msg,
                    else => break,
                };

                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Session: Failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    writer_shared.fail(SessionError::WebSocket(e));
                    break;
                }
                sent += 1;
            }

            log::debug!("Session: Writer stopping after {} message(s)", sent);
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            let mut close_reason = None;
            loop {
                let next = tokio::select! {
                    _ = reader_shared.shutdown.cancelled() => break,
                    next = read.next() => next,
                };

                let parsed = match next {
                    Some(Ok(Message::Text(text))) => ServerMessage::parse(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => ServerMessage::parse_bytes(bytes.as_slice()),
                    Some(Ok(Message::Close(frame))) => {
                        match frame {
                            Some(frame) if frame.code != CloseCode::Normal => {
                                reader_shared.fail(SessionError::RemoteClosed(format!(
                                    "{} {}",
                                    u16::from(frame.code),
                                    frame.reason
                                )));
                            }
                            Some(frame) => close_reason = Some(frame.reason.to_string()),
                            None => {}
                        }
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        if reader_shared.state() == SessionState::Closing {
                            log::debug!("Session: Read error while closing: {}", e);
                        } else {
                            reader_shared.fail(SessionError::WebSocket(e));
                        }
                        break;
                    }
                    None => {
                        if reader_shared.state() != SessionState::Closing {
                            reader_shared
                                .fail(SessionError::RemoteClosed("stream ended".to_string()));
                        }
                        break;
                    }
                };

                let message = match parsed {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Session: Ignoring unparseable message: {}", e);
                        continue;
                    }
                };

                for event in message.into_events() {
                    match event {
                        ServerEvent::SetupComplete => {
                            log::info!("Session: Setup complete, session open");
                            reader_shared.mark_open();
                        }
                        other => reader_shared.listener.on_server_event(other),
                    }
                }
            }

            reader_shared.shutdown.cancel();
            reader_shared.notify_closed(close_reason);
        });

        Ok(SessionHandle {
            shared,
            control_tx,
            capture: None,
            tasks: vec![writer, reader],
        })
    }
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Queue one outbound audio chunk without waiting. Returns whether it
    /// was queued. Outside `Open` the chunk is dropped, unless pre-roll is
    /// enabled and the session is still connecting.
    pub fn send(&self, chunk: EncodedChunk) -> bool {
        match self.state() {
            SessionState::Open => self.shared.enqueue_audio(&chunk),
            SessionState::Connecting if self.shared.preroll_capacity > 0 => {
                if let Ok(mut ring) = self.shared.preroll.lock() {
                    if ring.len() == self.shared.preroll_capacity {
                        ring.pop_front();
                    }
                    ring.push_back(chunk);
                }
                false
            }
            _ => false,
        }
    }

    /// Queue a control message (text turn, tool response). These bypass the
    /// audio queue and are never dropped while the session is open.
    pub fn send_message(&self, message: ClientMessage) -> bool {
        if !self.is_open() {
            log::debug!("Session: Not open, dropping control message");
            return false;
        }
        self.control_tx.send(message).is_ok()
    }

    /// Hand over the capture device so closing the session releases it.
    pub fn attach_capture(&mut self, source: Box<dyn AudioFrameSource>) {
        if let Some(mut previous) = self.capture.replace(source) {
            previous.close();
        }
    }

    pub fn frames_dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Release capture, then close the transport. Safe to call repeatedly
    /// and from any state. The closed capture source is handed back so the
    /// owner can reopen it for a later session.
    pub async fn close(&mut self) -> Option<Box<dyn AudioFrameSource>> {
        let capture = self.capture.take().map(|mut capture| {
            capture.close();
            capture
        });

        if self.tasks.is_empty() {
            return capture;
        }

        if self.state() != SessionState::Closed {
            self.shared.set_state(SessionState::Closing);
        }
        self.shared.shutdown.cancel();

        for task in self.tasks.drain(..) {
            if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                log::warn!("Session: Task did not stop within {:?}", CLOSE_GRACE);
            }
        }
        self.shared.notify_closed(None);
        capture
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
        self.shared.shutdown.cancel();
    }
}
