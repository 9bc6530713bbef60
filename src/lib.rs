pub mod audio_capture;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transcript;
pub mod wakeword;

pub use engine::{ConversationState, EngineEvent, VoiceEngine};
pub use error::{EngineError, Result};
