//! A scripted stand-in for the remote conversational service.
//!
//! Accepts exactly one WebSocket connection. Every text message the client
//! sends is parsed as JSON and queued for the test; the test pushes server
//! messages back with `send_json` and can end the session with `close`.

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct MockServer {
    pub url: String,
    inbound: mpsc::UnboundedReceiver<Value>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                return;
            };
            let (mut write, mut read) = ws.split();

            loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                                let _ = inbound_tx.send(value);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => {}
                    },
                    Some(msg) = outbound_rx.recv() => {
                        let closing = matches!(msg, Message::Close(_));
                        if write.send(msg).await.is_err() || closing {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            url,
            inbound,
            outbound,
        }
    }

    /// Next client message, or `None` once the client has gone away.
    pub async fn next_message(&mut self) -> Option<Value> {
        tokio::time::timeout(WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for a client message")
    }

    /// Skip ahead to the next client message carrying `key`.
    pub async fn expect(&mut self, key: &str) -> Value {
        loop {
            let message = self
                .next_message()
                .await
                .unwrap_or_else(|| panic!("client went away while waiting for '{}'", key));
            if message.get(key).is_some() {
                return message;
            }
        }
    }

    pub fn send_json(&self, value: Value) {
        self.outbound
            .send(Message::Text(value.to_string().into()))
            .unwrap();
    }

    /// Wait for the setup message and acknowledge it.
    pub async fn open(&mut self) -> Value {
        let setup = self.expect("setup").await;
        self.send_json(json!({ "setupComplete": {} }));
        setup
    }

    pub fn close(&self, code: CloseCode, reason: &str) {
        let _ = self.outbound.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
    }
}

pub fn agent_text(text: &str) -> Value {
    json!({ "serverContent": { "outputTranscription": { "text": text } } })
}

pub fn user_text(text: &str) -> Value {
    json!({ "serverContent": { "inputTranscription": { "text": text } } })
}

/// `samples` of silence as one 24kHz reply chunk
pub fn agent_audio(samples: usize) -> Value {
    let pcm = vec![0u8; samples * 2];
    json!({
        "serverContent": {
            "modelTurn": {
                "parts": [{
                    "inlineData": {
                        "mimeType": "audio/pcm;rate=24000",
                        "data": BASE64.encode(pcm)
                    }
                }]
            }
        }
    })
}

pub fn turn_complete() -> Value {
    json!({ "serverContent": { "turnComplete": true } })
}

pub fn interrupted() -> Value {
    json!({ "serverContent": { "interrupted": true } })
}
