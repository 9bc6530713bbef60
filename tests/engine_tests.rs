//! End-to-end conversation flows: engine, session, scheduler and gate
//! driven by a mock service and a manually clocked output.

mod common;

use common::{agent_audio, agent_text, interrupted, turn_complete, user_text, MockServer, WAIT};
use live_voice_rs::audio_capture::{ChannelFrameSource, FrameFeeder};
use live_voice_rs::config::{EngineConfig, SessionConfig};
use live_voice_rs::engine::{ConversationState, EngineEvent, VoiceEngine};
use live_voice_rs::playback::VirtualOutput;
use live_voice_rs::tools::{ToolHandler, ToolRegistry};
use live_voice_rs::wakeword::{Sensitivity, WakeWordConfig};
use live_voice_rs::EngineError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

struct Harness {
    engine: VoiceEngine,
    events: broadcast::Receiver<EngineEvent>,
    output: Arc<VirtualOutput>,
    feeder: FrameFeeder,
    server: MockServer,
}

fn config_for(server: &MockServer) -> EngineConfig {
    EngineConfig {
        session: SessionConfig {
            endpoint: server.url.clone(),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn harness(tools: ToolRegistry) -> Harness {
    let server = MockServer::start().await;
    let (source, feeder) = ChannelFrameSource::new(16);
    let output = Arc::new(VirtualOutput::manual());
    let engine = VoiceEngine::builder()
        .source(Box::new(source))
        .output(output.clone())
        .tools(tools)
        .build()
        .unwrap();
    let events = engine.subscribe();
    Harness {
        engine,
        events,
        output,
        feeder,
        server,
    }
}

/// Start with `config` and complete the setup handshake.
async fn start_open(h: &mut Harness, config: EngineConfig) {
    h.engine.start(config).await.unwrap();
    h.server.open().await;
    wait_for(&mut h.events, |e| matches!(e, EngineEvent::SessionOpened)).await;
}

async fn wait_for<F>(events: &mut broadcast::Receiver<EngineEvent>, pred: F) -> EngineEvent
where
    F: Fn(&EngineEvent) -> bool,
{
    let search = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    };
    tokio::time::timeout(WAIT, search)
        .await
        .expect("timed out waiting for engine event")
}

async fn wait_for_state(events: &mut broadcast::Receiver<EngineEvent>, state: ConversationState) {
    wait_for(events, |e| matches!(e, EngineEvent::StateChanged { to, .. } if *to == state)).await;
}

fn wake_config(server: &MockServer, sensitivity: Sensitivity) -> EngineConfig {
    let mut config = config_for(server);
    config.wake_word = Some(WakeWordConfig {
        phrase: "Eve".to_string(),
        sensitivity,
        silence_commit_ms: 200,
        variants_file: None,
    });
    config
}

/// Wake the gate with `utterance` and wait for it to commit as a text turn.
async fn wake_and_commit(h: &mut Harness, utterance: &str) {
    h.server.send_json(user_text(utterance));
    wait_for_state(&mut h.events, ConversationState::Listening).await;
    let turn = h.server.expect("clientContent").await;
    assert_eq!(turn["clientContent"]["turns"][0]["parts"][0]["text"], utterance);
    wait_for_state(&mut h.events, ConversationState::Processing).await;
}

/// Drive the engine into Speaking with 0.1s of reply audio queued.
async fn reply_with_audio(h: &mut Harness) {
    h.server.send_json(agent_text("Hello"));
    h.server.send_json(agent_audio(2400));
    wait_for_state(&mut h.events, ConversationState::Speaking).await;
}

#[test_log::test(tokio::test)]
async fn test_start_twice_is_rejected() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = config_for(&h.server);
    h.engine.start(config.clone()).await.unwrap();

    let err = h.engine.start(config).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyStarted));
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_greeting_is_sent_on_open() {
    let mut h = harness(ToolRegistry::new()).await;
    let mut config = config_for(&h.server);
    config.session.greeting = Some("Introduce yourself".to_string());

    start_open(&mut h, config).await;
    let turn = h.server.expect("clientContent").await;
    assert_eq!(
        turn["clientContent"]["turns"][0]["parts"][0]["text"],
        "Introduce yourself"
    );
    wait_for_state(&mut h.events, ConversationState::Processing).await;
    assert!(h.engine.status().session_started.is_some());
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_captured_audio_is_streamed() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;

    assert!(h.feeder.push(vec![0.25; 1600]));
    let message = h.server.expect("realtimeInput").await;
    assert_eq!(
        message["realtimeInput"]["audio"]["mimeType"],
        "audio/pcm;rate=16000"
    );
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_reply_plays_then_returns_to_idle() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;

    reply_with_audio(&mut h).await;
    assert_eq!(h.output.active_at(0.05), 1);

    h.server.send_json(turn_complete());
    let finalized = wait_for(&mut h.events, |e| matches!(e, EngineEvent::TurnFinalized(_))).await;
    if let EngineEvent::TurnFinalized(turn) = finalized {
        assert_eq!(turn.agent, "Hello");
    }
    // audio is still queued, so the turn is not over yet
    assert_eq!(h.engine.state(), ConversationState::Speaking);

    h.output.advance(0.2);
    wait_for_state(&mut h.events, ConversationState::Idle).await;
    assert_eq!(h.engine.status().status_text, "Ready");
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_reply_chunks_are_gap_free() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;

    reply_with_audio(&mut h).await;
    h.server.send_json(agent_audio(2400));
    h.server.send_json(agent_audio(4800));
    h.server.send_json(turn_complete());
    wait_for(&mut h.events, |e| matches!(e, EngineEvent::TurnFinalized(_))).await;

    let scheduled = h.output.scheduled();
    assert_eq!(scheduled.len(), 3);
    for pair in scheduled.windows(2) {
        assert!((pair[0].start + pair[0].duration - pair[1].start).abs() < 1e-9);
    }
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_interruption_cancels_playback() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;

    reply_with_audio(&mut h).await;
    h.server.send_json(interrupted());
    wait_for_state(&mut h.events, ConversationState::Listening).await;

    assert_eq!(h.output.stopped_count(), 1);
    assert_eq!(h.output.active_at(0.05), 0);
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_talk_press_barges_in() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;

    reply_with_audio(&mut h).await;
    assert!(h.engine.press_talk());
    wait_for_state(&mut h.events, ConversationState::Listening).await;
    assert_eq!(h.output.stopped_count(), 1);
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_submit_text_commits_turn() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;

    assert!(h.engine.submit_text("What's on my calendar?"));
    let turn = h.server.expect("clientContent").await;
    assert_eq!(
        turn["clientContent"]["turns"][0]["parts"][0]["text"],
        "What's on my calendar?"
    );
    wait_for_state(&mut h.events, ConversationState::Processing).await;
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_tool_call_is_answered() {
    let mut tools = ToolRegistry::new();
    tools.register_fn("getWeather", |args| {
        Ok(json!({ "city": args["city"], "celsius": 21 }))
    });
    let mut h = harness(tools).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;

    h.server.send_json(json!({
        "toolCall": { "functionCalls": [
            { "id": "call-1", "name": "getWeather", "args": { "city": "Oslo" } }
        ]}
    }));

    let response = h.server.expect("toolResponse").await;
    let function = &response["toolResponse"]["functionResponses"][0];
    assert_eq!(function["id"], "call-1");
    assert_eq!(function["name"], "getWeather");
    assert_eq!(function["response"], json!({ "city": "Oslo", "celsius": 21 }));
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_unknown_tool_gets_failure_and_warning() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;

    h.server.send_json(json!({
        "toolCall": { "functionCalls": [
            { "id": "call-9", "name": "launchRockets", "args": {} }
        ]}
    }));

    let response = h.server.expect("toolResponse").await;
    let body = &response["toolResponse"]["functionResponses"][0]["response"];
    assert!(body["error"].as_str().unwrap().contains("launchRockets"));

    let warning = wait_for(&mut h.events, |e| matches!(e, EngineEvent::Warning(_))).await;
    assert!(matches!(warning, EngineEvent::Warning(w) if w.contains("launchRockets")));
    assert!(h.engine.is_running());
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_stop_releases_everything() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;
    reply_with_audio(&mut h).await;

    h.engine.stop().await;

    assert_eq!(h.engine.state(), ConversationState::Idle);
    assert!(!h.engine.is_running());
    assert!(!h.feeder.push(vec![0.0; 160]));
    assert_eq!(h.output.stopped_count(), 1);
    assert!(h.engine.status().session_started.is_none());
    wait_for(&mut h.events, |e| {
        matches!(e, EngineEvent::SessionClosed { reason: None })
    })
    .await;

    // second stop is a no-op
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_remote_failure_resets_and_allows_restart() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;
    reply_with_audio(&mut h).await;

    h.server.close(CloseCode::Error, "overloaded");
    wait_for(&mut h.events, |e| matches!(e, EngineEvent::Error(_))).await;
    wait_for(&mut h.events, |e| matches!(e, EngineEvent::SessionClosed { .. })).await;

    assert_eq!(h.engine.state(), ConversationState::Idle);
    assert!(h.engine.status().last_error.is_some());
    assert_eq!(h.output.stopped_count(), 1);
    tokio::time::timeout(WAIT, async {
        while h.engine.is_running() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("event loop did not finish");

    // a fresh service; the capture source is reclaimed from the ended loop
    h.server = MockServer::start().await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;
    assert!(h.engine.status().last_error.is_none());
    assert!(h.feeder.push(vec![0.0; 160]));
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_push_to_talk_only_streams_while_listening() {
    let mut h = harness(ToolRegistry::new()).await;
    let mut config = config_for(&h.server);
    config.push_to_talk = true;
    start_open(&mut h, config).await;

    assert!(h.engine.press_talk());
    wait_for_state(&mut h.events, ConversationState::Listening).await;
    assert!(h.feeder.push(vec![0.5; 1600]));
    h.server.expect("realtimeInput").await;
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_wake_word_gates_replies() {
    let mut h = harness(ToolRegistry::new()).await;
    let mut config = config_for(&h.server);
    config.wake_word = Some(WakeWordConfig {
        phrase: "Eve".to_string(),
        sensitivity: Sensitivity::Medium,
        silence_commit_ms: 200,
        variants_file: None,
    });
    start_open(&mut h, config).await;
    assert_eq!(h.engine.status().status_text, "Waiting for wake word");

    // background chatter and the reply to it are ignored
    h.server.send_json(user_text("I believe it will rain"));
    h.server.send_json(agent_text("Sounds wet"));
    h.server.send_json(agent_audio(2400));
    h.server.send_json(turn_complete());

    h.server.send_json(user_text("Eve, what time is it"));
    wait_for_state(&mut h.events, ConversationState::Listening).await;
    assert!(h.output.scheduled().is_empty());

    // silence commits the utterance as a text turn
    let turn = h.server.expect("clientContent").await;
    assert_eq!(
        turn["clientContent"]["turns"][0]["parts"][0]["text"],
        "Eve, what time is it"
    );
    wait_for_state(&mut h.events, ConversationState::Processing).await;

    reply_with_audio(&mut h).await;
    assert_eq!(h.output.scheduled().len(), 1);
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_wake_word_works_again_after_a_reply() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = wake_config(&h.server, Sensitivity::Medium);
    start_open(&mut h, config).await;

    wake_and_commit(&mut h, "Eve, what time is it").await;
    // trailing transcription after the commit
    h.server.send_json(user_text(" thanks"));
    reply_with_audio(&mut h).await;
    h.server.send_json(turn_complete());
    wait_for(&mut h.events, |e| matches!(e, EngineEvent::TurnFinalized(_))).await;

    h.output.set_time(1.0);
    wait_for_state(&mut h.events, ConversationState::Idle).await;

    h.server.send_json(user_text("Eve, stop the music"));
    wait_for_state(&mut h.events, ConversationState::Listening).await;
    let turn = h.server.expect("clientContent").await;
    assert_eq!(
        turn["clientContent"]["turns"][0]["parts"][0]["text"],
        "Eve, stop the music"
    );
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_wake_word_barges_in_while_speaking() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = wake_config(&h.server, Sensitivity::Medium);
    start_open(&mut h, config).await;

    wake_and_commit(&mut h, "Eve, play something").await;
    h.server.send_json(user_text(" please"));
    reply_with_audio(&mut h).await;
    h.server.send_json(turn_complete());
    wait_for(&mut h.events, |e| matches!(e, EngineEvent::TurnFinalized(_))).await;
    assert_eq!(h.engine.state(), ConversationState::Speaking);

    h.server.send_json(user_text("Eve, stop"));
    wait_for_state(&mut h.events, ConversationState::Listening).await;
    assert_eq!(h.output.stopped_count(), 1);
    assert_eq!(h.output.active_at(0.05), 0);
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_high_sensitivity_needs_phrase_first() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = wake_config(&h.server, Sensitivity::High);
    start_open(&mut h, config).await;

    h.server.send_json(user_text("Well, Eve, what time is it"));
    h.server.send_json(turn_complete());
    wake_and_commit(&mut h, "Eve, what time is it").await;
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_go_away_closes_without_error() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;

    h.server.send_json(json!({ "goAway": { "timeLeft": "10s" } }));
    let event = wait_for(&mut h.events, |e| {
        matches!(e, EngineEvent::Error(_) | EngineEvent::SessionClosed { .. })
    })
    .await;
    assert_eq!(
        event,
        EngineEvent::SessionClosed {
            reason: Some("go away".to_string())
        }
    );
    assert!(h.engine.status().last_error.is_none());
    assert_eq!(h.engine.state(), ConversationState::Idle);
    h.engine.stop().await;
}

struct SlowTool;

#[async_trait]
impl ToolHandler for SlowTool {
    async fn call(&self, _args: Value) -> Result<Value, String> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(json!({ "done": true }))
    }
}

#[test_log::test(tokio::test)]
async fn test_cancelled_tool_call_is_not_answered() {
    let mut tools = ToolRegistry::new();
    tools.register("slowLookup", Arc::new(SlowTool));
    let mut h = harness(tools).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;

    h.server.send_json(json!({
        "toolCall": { "functionCalls": [
            { "id": "call-x", "name": "slowLookup", "args": {} }
        ]}
    }));
    h.server.send_json(json!({ "toolCallCancellation": { "ids": ["call-x"] } }));
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(h.engine.submit_text("marker"));
    loop {
        let message = h.server.next_message().await.expect("client went away");
        assert!(message.get("toolResponse").is_none(), "cancelled call was answered");
        if message.get("clientContent").is_some() {
            break;
        }
    }
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_undecodable_audio_is_a_warning() {
    let mut h = harness(ToolRegistry::new()).await;
    let config = config_for(&h.server);
    start_open(&mut h, config).await;

    // three bytes is not whole PCM16 samples
    h.server.send_json(json!({
        "serverContent": { "modelTurn": { "parts": [{
            "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AQID" }
        }]}}
    }));
    let warning = wait_for(&mut h.events, |e| matches!(e, EngineEvent::Warning(_))).await;
    assert!(matches!(warning, EngineEvent::Warning(w) if w.starts_with("Decode error")));
    assert!(h.output.scheduled().is_empty());
    assert!(h.engine.is_running());
    h.engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_stop_aborts_a_pending_connect() {
    // accepts connections but never answers the handshake
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_url = format!("ws://{}", silent.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = silent.accept().await {
            held.push(socket);
        }
    });

    let mut h = harness(ToolRegistry::new()).await;
    let mut config = config_for(&h.server);
    config.session.endpoint = silent_url;
    let pending = tokio::time::timeout(Duration::from_millis(200), h.engine.start(config)).await;
    assert!(pending.is_err());
    assert!(h.engine.is_running());

    tokio::time::timeout(Duration::from_secs(1), h.engine.stop())
        .await
        .expect("stop waited for the connect");
    assert!(!h.engine.is_running());
    assert!(!h.feeder.push(vec![0.0; 160]));

    // the capture source came back, so a normal start works
    let config = config_for(&h.server);
    start_open(&mut h, config).await;
    assert!(h.feeder.push(vec![0.0; 160]));
    h.engine.stop().await;
}
