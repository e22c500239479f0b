//! Connection error taxonomy

use regex::Regex;
use serde::{Serialize, Serializer};
use std::sync::LazyLock;
use thiserror::Error;

/// `"Auth failed: AUTH_ERROR"` style messages carry the code as the last word
static TRAILING_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*:\s+(\w+)$").expect("valid regex"));

/// Reasons a control or camera session could not be established or was lost
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("TIMEOUT")]
    Timeout,
    #[error("REMOTE_IDENTIFY_ERROR")]
    RemoteIdentifyError,
    #[error("UNKNOWN_DEVICE")]
    UnknownDevice,
    #[error("NOT_FOUND")]
    NotFound,
    #[error("DISCONNECTED")]
    Disconnected,
    #[error("AUTH_ERROR")]
    AuthError,
    #[error("AUTH_FAILED")]
    AuthFailed,
    #[error("RESOURCE_BUSY")]
    ResourceBusy,
    #[error("FLUXMONITOR_VERSION_IS_TOO_OLD")]
    FluxmonitorVersionIsTooOld,
    #[error("{0}")]
    Other(String),
}

impl ConnectionError {
    /// Map a free-form error code or message onto the taxonomy
    pub fn from_code(raw: &str) -> Self {
        let trimmed = raw.trim();
        let code = TRAILING_CODE
            .captures(trimmed)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .unwrap_or(trimmed)
            .to_uppercase();

        match code.as_str() {
            "TIMEOUT" => Self::Timeout,
            "REMOTE_IDENTIFY_ERROR" => Self::RemoteIdentifyError,
            "UNKNOWN_DEVICE" => Self::UnknownDevice,
            "NOT_FOUND" => Self::NotFound,
            "DISCONNECTED" => Self::Disconnected,
            "AUTH_ERROR" => Self::AuthError,
            "AUTH_FAILED" => Self::AuthFailed,
            "RESOURCE_BUSY" => Self::ResourceBusy,
            "FLUXMONITOR_VERSION_IS_TOO_OLD" => Self::FluxmonitorVersionIsTooOld,
            _ => Self::Other(code),
        }
    }

    /// Build from the `error` field of a firmware frame, string or list
    pub fn from_codes(codes: &[String]) -> Self {
        match codes {
            [] => Self::Other("UNKNOWN_ERROR".to_string()),
            [single] => Self::from_code(single),
            many => Self::from_code(&many.join("_")).or_first(&many[0]),
        }
    }

    fn or_first(self, first: &str) -> Self {
        match self {
            Self::Other(_) => Self::from_code(first),
            known => known,
        }
    }

    pub fn code(&self) -> String {
        self.to_string()
    }

    /// Whether the device refused the credentials
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthError | Self::AuthFailed)
    }
}

impl Serialize for ConnectionError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.code())
    }
}
