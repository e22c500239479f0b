//! Registry errors

use beamlink_control::{CameraError, ControlError};
use beamlink_core::{Capability, ConnectionError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MasterError {
    #[error("No device selected")]
    NoDeviceSelected,

    #[error("Connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Firmware {version} does not support {capability:?}")]
    Unsupported { capability: Capability, version: String },

    #[error("Device {0} was not discovered in time")]
    NotDiscovered(String),

    #[error("Job stopped in state {st_id}: {}", .error.join(", "))]
    JobFailed { st_id: i32, error: Vec<String> },
}

impl MasterError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Control(e) => e.is_timeout(),
            Self::Connection(e) => *e == ConnectionError::Timeout,
            _ => false,
        }
    }
}
