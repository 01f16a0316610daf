use thiserror::Error;

use crate::protocol::CommandLabel;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Could not properly close serial terminal: {0}")]
    CloseError(String),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Command {pending} is still pending, refusing {requested}")]
    CommandPending {
        pending: CommandLabel,
        requested: CommandLabel,
    },

    #[error("No active serial session")]
    NoActiveSession,

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl From<serialport::Error> for AppError {
    fn from(err: serialport::Error) -> Self {
        AppError::SerialError(err.to_string())
    }
}

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;
