//! Error types for the logging subsystem

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LoggingError {
    /// Another global subscriber is already installed
    #[error("Failed to initialize logging: {0}")]
    AlreadyInitialized(String),

    #[error("Unknown log level '{0}'")]
    UnknownLevel(String),
}

impl From<tracing_subscriber::util::TryInitError> for LoggingError {
    fn from(err: tracing_subscriber::util::TryInitError) -> Self {
        LoggingError::AlreadyInitialized(err.to_string())
    }
}
