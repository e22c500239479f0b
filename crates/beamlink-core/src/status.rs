//! Device status codes and the `report` payload

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Numeric status ids reported in `st_id`
pub mod code {
    pub const RAW: i32 = -10;
    pub const SCAN: i32 = -2;
    pub const MAINTAIN: i32 = -1;
    pub const IDLE: i32 = 0;
    pub const INIT: i32 = 1;
    pub const STARTING: i32 = 4;
    pub const RESUME_TO_STARTING: i32 = 6;
    pub const RUNNING: i32 = 16;
    pub const RESUME_TO_RUNNING: i32 = 18;
    pub const PAUSED: i32 = 32;
    pub const PAUSED_FROM_STARTING: i32 = 36;
    pub const PAUSING_FROM_STARTING: i32 = 38;
    pub const PAUSED_FROM_RUNNING: i32 = 48;
    pub const PAUSING_FROM_RUNNING: i32 = 50;
    pub const COMPLETED: i32 = 64;
    pub const COMPLETING: i32 = 66;
    pub const ABORTED: i32 = 128;
    pub const ABORTING: i32 = 130;
}

/// Coarse grouping of status ids for callers that only need to branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    Idle,
    Starting,
    Running,
    Pausing,
    Paused,
    Completing,
    Completed,
    Aborting,
    Aborted,
    Maintain,
    Raw,
    Unknown,
}

impl StatusCategory {
    pub fn from_id(st_id: i32) -> Self {
        match st_id {
            code::IDLE => Self::Idle,
            code::INIT | code::STARTING | code::RESUME_TO_STARTING => Self::Starting,
            code::RUNNING | code::RESUME_TO_RUNNING => Self::Running,
            code::PAUSING_FROM_STARTING | code::PAUSING_FROM_RUNNING => Self::Pausing,
            code::PAUSED | code::PAUSED_FROM_STARTING | code::PAUSED_FROM_RUNNING => Self::Paused,
            code::COMPLETING => Self::Completing,
            code::COMPLETED => Self::Completed,
            code::ABORTING => Self::Aborting,
            code::ABORTED => Self::Aborted,
            code::MAINTAIN | code::SCAN => Self::Maintain,
            code::RAW => Self::Raw,
            _ => Self::Unknown,
        }
    }

    /// Whether a job is in progress (running, paused or on its way)
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Pausing | Self::Paused | Self::Completing | Self::Aborting
        )
    }
}

/// States in which a firmware error interrupts a job and the user is asked to retry
pub fn is_retry_prompt_state(st_id: i32) -> bool {
    matches!(
        st_id,
        code::PAUSED_FROM_STARTING
            | code::PAUSED_FROM_RUNNING
            | code::ABORTED
            | code::PAUSING_FROM_RUNNING
            | code::PAUSING_FROM_STARTING
    )
}

/// Device status as returned by `play report`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub st_id: i32,
    #[serde(default)]
    pub st_label: String,
    /// Raw temperature/runtime readings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rt: Option<Value>,
    /// Subsystem state block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub st: Option<Value>,
    /// Progress in [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prog: Option<f64>,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub error: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Report {
    /// Build from a `report` response, accepting either the bare status
    /// object or one wrapped in `device_status`.
    pub fn from_response(response: &Value) -> Result<Self, serde_json::Error> {
        let body = response.get("device_status").unwrap_or(response);
        let mut report: Report = serde_json::from_value(body.clone())?;
        report.normalize();
        Ok(report)
    }

    /// Firmware may label an aborted job inconsistently
    pub fn normalize(&mut self) {
        if self.st_id == code::ABORTED {
            self.st_label = "ABORTED".to_string();
        }
    }

    pub fn category(&self) -> StatusCategory {
        StatusCategory::from_id(self.st_id)
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn error_label(&self) -> Option<String> {
        if self.error.is_empty() {
            None
        } else {
            Some(self.error.join("_"))
        }
    }
}

/// Firmware sends `error` either as a single string or as a list
pub(crate) fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) if s.is_empty() => Vec::new(),
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        Some(other) => vec![other.to_string()],
    })
}
