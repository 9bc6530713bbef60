use thiserror::Error;

use crate::audio_capture::CaptureError;
use crate::config::ConfigError;
use crate::encoder::DecodeError;
use crate::session::SessionError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Unhandled tool call: {0}")]
    ToolCallUnhandled(String),

    #[error("Engine already started")]
    AlreadyStarted,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<CaptureError> for EngineError {
    fn from(err: CaptureError) -> Self {
        EngineError::DeviceUnavailable(err.to_string())
    }
}

impl From<SessionError> for EngineError {
    fn from(err: SessionError) -> Self {
        EngineError::ConnectionError(err.to_string())
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
