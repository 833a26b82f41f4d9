// Stream Errors
// Failure taxonomy shared by the session registry, process supervisor and stream services

use thiserror::Error;

/// Errors that can occur while starting, feeding or stopping a stream session
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Cannot start stream for device '{device_id}': maximum of {max} parallel streams reached")]
    CapacityExceeded { device_id: String, max: usize },

    #[error("Failed to launch '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Maximum retries reached ({attempts} attempts)")]
    RetriesExhausted { attempts: u32 },

    #[error("Frame exceeds the {limit} byte frame buffer")]
    FrameTooLarge { limit: usize },

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Device '{0}' is not streaming")]
    NotStreaming(String),

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Process for device '{0}' exited before the stream was ready")]
    ProcessExited(String),

    #[error("Stream service is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Whether the error was caused by the caller rather than the system
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            StreamError::CapacityExceeded { .. }
                | StreamError::NotStreaming(_)
                | StreamError::UnknownDevice(_)
                | StreamError::InvalidPath(_)
                | StreamError::ShuttingDown
        )
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
