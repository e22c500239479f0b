//! Error types for control and camera sessions

use beamlink_core::{ClassifiedResponse, ConnectionError};
use thiserror::Error;

use crate::command::Mode;

/// Errors opening or driving a socket
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Link closed")]
    Closed,
}

/// Errors returned by control session tasks
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Firmware error: {}", .0.error.join(" "))]
    Firmware(ClassifiedResponse),

    #[error("Command `{command}` timed out")]
    Timeout { command: String },

    #[error("Session disconnected")]
    Disconnected,

    #[error("Command requires {expected:?} mode, session is in {actual:?}")]
    ModeMismatch { expected: Mode, actual: Mode },

    #[error("Task queue is full ({0} pending)")]
    QueueFull(usize),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ControlError {
    /// Firmware error codes, if this error came from the device
    pub fn codes(&self) -> &[String] {
        match self {
            Self::Firmware(classified) => &classified.error,
            _ => &[],
        }
    }

    /// Connection-level view of this error, used when deciding to reconnect
    pub fn connection_error(&self) -> Option<ConnectionError> {
        match self {
            Self::Connection(e) => Some(e.clone()),
            Self::Timeout { .. } => Some(ConnectionError::Timeout),
            Self::Disconnected | Self::Transport(_) => Some(ConnectionError::Disconnected),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connection(ConnectionError::Timeout))
    }
}

/// Errors from camera sessions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Timed out waiting for a frame")]
    Timeout,

    #[error("Camera returned {0} unreadable frames in a row")]
    InvalidFrames(u32),

    #[error("Camera session closed")]
    Closed,

    #[error("Failed to process frame: {0}")]
    Image(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
