//! Wire schema of the remote conversational service (JSON over WebSocket).
//!
//! The schema is owned by the service and changes between API versions, so
//! unknown fields are ignored on the way in and everything optional is
//! skipped on the way out.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::{ResponseModality, SessionConfig};
use crate::encoder::{self, EncodedChunk, OUTPUT_SAMPLE_RATE};
use crate::transcript::Role;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid string encoding")]
    InvalidString,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Empty>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Messages sent from the engine to the service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    pub fn setup(config: &SessionConfig) -> Self {
        let (modality, speech_config) = match config.modality {
            ResponseModality::Audio => (
                "AUDIO",
                Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                }),
            ),
            ResponseModality::Text => ("TEXT", None),
        };

        let tools = if config.tools.is_empty() {
            Vec::new()
        } else {
            vec![Tool {
                function_declarations: config
                    .tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        ClientMessage::Setup(Setup {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![modality.to_string()],
                speech_config,
            },
            system_instruction: config.resolved_system_instruction().map(|text| Content {
                role: None,
                parts: vec![Part {
                    text: Some(text),
                    ..Default::default()
                }],
            }),
            tools,
            input_audio_transcription: config.input_transcription.then(Empty::default),
            output_audio_transcription: config.output_transcription.then(Empty::default),
        })
    }

    pub fn audio(chunk: &EncodedChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Blob {
                mime_type: chunk.mime_type.clone(),
                data: chunk.payload.clone(),
            },
        })
    }

    /// A complete user text turn
    pub fn text_turn(text: &str) -> Self {
        ClientMessage::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(text.to_string()),
                    ..Default::default()
                }],
            }],
            turn_complete: true,
        })
    }

    pub fn tool_response(id: &str, name: &str, response: Value) -> Self {
        ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                id: id.to_string(),
                name: name.to_string(),
                response,
            }],
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// One message from the service; several fields may be set at once
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

/// Inbound events after flattening a `ServerMessage`
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    PartialTranscript { role: Role, text: String },
    AudioChunk { data: Vec<u8>, sample_rate: u32 },
    TurnComplete,
    Interrupted,
    ToolInvocation { id: String, name: String, args: Value },
    ToolCallCancelled { ids: Vec<String> },
    GoAway { time_left: Option<String> },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString)?;
        Self::parse(text)
    }

    /// Flatten into events in delivery order: transcripts, audio,
    /// interruption, turn completion, then tool traffic.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if let Some(text) = content.input_transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(ServerEvent::PartialTranscript {
                        role: Role::User,
                        text,
                    });
                }
            }
            if let Some(text) = content.output_transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(ServerEvent::PartialTranscript {
                        role: Role::Agent,
                        text,
                    });
                }
            }

            let mut audio = Vec::new();
            for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
                if part.thought == Some(true) {
                    continue;
                }
                if let Some(text) = part.text {
                    if !text.is_empty() {
                        events.push(ServerEvent::PartialTranscript {
                            role: Role::Agent,
                            text,
                        });
                    }
                }
                if let Some(blob) = part.inline_data {
                    if !blob.mime_type.starts_with("audio/") {
                        log::debug!("Protocol: Ignoring inline data of type {}", blob.mime_type);
                        continue;
                    }
                    match encoder::decode_base64(&blob.data) {
                        Ok(data) => audio.push(ServerEvent::AudioChunk {
                            data,
                            sample_rate: encoder::parse_sample_rate(&blob.mime_type)
                                .unwrap_or(OUTPUT_SAMPLE_RATE),
                        }),
                        Err(e) => log::warn!("Protocol: Dropping undecodable audio part: {}", e),
                    }
                }
            }
            events.extend(audio);

            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if let Some(call) = self.tool_call {
            for fc in call.function_calls {
                events.push(ServerEvent::ToolInvocation {
                    id: fc.id.unwrap_or_default(),
                    name: fc.name,
                    args: fc.args,
                });
            }
        }

        if let Some(cancel) = self.tool_call_cancellation {
            events.push(ServerEvent::ToolCallCancelled { ids: cancel.ids });
        }

        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::GoAway {
                time_left: go_away.time_left,
            });
        }

        events
    }
}
