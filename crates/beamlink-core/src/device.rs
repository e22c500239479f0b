//! Device descriptors as announced by the discovery feed

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the device is attached to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSource {
    /// Reachable over the local network
    #[default]
    Lan,
    /// Host-to-host USB link
    H2h,
    /// Anything the backend reports that we don't know about
    #[serde(other)]
    Other,
}

/// G-code dialect spoken by the device's raw mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FcodeVersion {
    V1,
    V2,
}

/// Models whose raw mode speaks the `M136`/`M137` dialect
const FCODE_V2_MODELS: &[&str] = &["ado1", "fbb2"];

/// Snapshot of one discovered device.
///
/// Superseded wholesale on every discovery tick; the feed keeps at most one
/// live descriptor per `uuid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable identity
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub ipaddr: String,
    #[serde(default)]
    pub model: String,
    /// Firmware version string, e.g. `3.2.6` or `1.5b12`
    #[serde(default, rename = "version")]
    pub firmware_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub st_id: i32,
    #[serde(default)]
    pub st_label: Option<String>,
    #[serde(default)]
    pub error_label: Option<String>,
    /// Whether the device requires a password to open a control session
    #[serde(default, rename = "password")]
    pub is_password_protected: bool,
    #[serde(default)]
    pub source: DeviceSource,
    /// USB address for host-to-host attached devices
    #[serde(default)]
    pub addr: Option<u32>,
    /// False when the backend announces that the device went away
    #[serde(default = "default_alive")]
    pub alive: bool,
    /// When the feed last heard about this device
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

fn default_alive() -> bool {
    true
}

impl DeviceDescriptor {
    /// Create a minimal descriptor for a network device
    pub fn new(uuid: impl Into<String>, ipaddr: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            ipaddr: ipaddr.into(),
            model: model.into(),
            firmware_version: String::new(),
            name: String::new(),
            serial: String::new(),
            st_id: 0,
            st_label: None,
            error_label: None,
            is_password_protected: false,
            source: DeviceSource::Lan,
            addr: None,
            alive: true,
            last_seen: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = version.into();
        self
    }

    pub fn with_password(mut self, protected: bool) -> Self {
        self.is_password_protected = protected;
        self
    }

    /// Host-to-host devices are keyed by their USB address
    pub fn normalize(&mut self) {
        if self.source == DeviceSource::H2h {
            if let Some(addr) = self.addr {
                self.uuid = addr.to_string();
            }
        }
    }

    pub fn is_usb(&self) -> bool {
        self.source == DeviceSource::H2h
    }

    /// Delta printers have no camera offset setting
    pub fn is_delta(&self) -> bool {
        self.model.starts_with("delta-")
    }

    pub fn fcode_version(&self) -> FcodeVersion {
        if FCODE_V2_MODELS.contains(&self.model.as_str()) {
            FcodeVersion::V2
        } else {
            FcodeVersion::V1
        }
    }

    /// Merge status fields from a `report` response into this snapshot
    pub fn apply_status(&mut self, st_id: i32, st_label: Option<String>, error_label: Option<String>) {
        self.st_id = st_id;
        self.st_label = st_label;
        self.error_label = error_label;
    }
}
