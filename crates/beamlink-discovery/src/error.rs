//! Discovery errors

use beamlink_control::TransportError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Probe queue is full")]
    ProbeQueueFull,

    #[error("Discovery has stopped")]
    Stopped,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Backend reported: {0}")]
    Backend(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
