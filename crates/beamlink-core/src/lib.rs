//! Beamlink Core - Shared types for the laser-cutter connection layer
//!
//! This crate provides the pieces every other Beamlink crate agrees on:
//! - Device descriptors as announced by discovery
//! - Status codes and the `report` payload
//! - Firmware version capability checks
//! - Connection error taxonomy and firmware error classification
//! - Parsing of the `camera_offset` device setting

pub mod camera_offset;
pub mod classify;
pub mod device;
pub mod error;
pub mod status;
pub mod version;

pub use camera_offset::CameraOffset;
pub use classify::{classify_firmware_response, translate, ClassifiedResponse};
pub use device::{DeviceDescriptor, DeviceSource, FcodeVersion};
pub use error::ConnectionError;
pub use status::{Report, StatusCategory};
pub use version::{Capability, VersionChecker};
