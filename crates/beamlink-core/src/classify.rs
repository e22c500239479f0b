//! Firmware error classification
//!
//! Firmware reports errors in several ad hoc shapes. Everything is folded
//! into a flat list of upper-case codes so callers can branch on a stable
//! vocabulary, and `translate` turns those codes into message keys.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;

static TRAILING_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*:\s*(\w+)$").expect("valid regex"));

/// Codes with a dedicated generic message
const GENERIC_KEYS: &[&str] = &[
    "UNKNOWN_ERROR",
    "OPERATION_ERROR",
    "SUBSYSTEM_ERROR",
    "UNKNOWN_COMMAND",
    "RESOURCE_BUSY",
    "TIMEOUT",
    "KICKED",
];

/// Codes (single or `_`-joined) with a dedicated monitor message
const MONITOR_KEYS: &[&str] = &[
    "HEAD_OFFLINE",
    "HEAD_ERROR_HEAD_OFFLINE",
    "HEAD_ERROR_TYPE_ERROR",
    "HEAD_ERROR_RESET",
    "HEAD_ERROR_HARDWARE_FAILURE",
    "HEAD_ERROR_SHAKE",
    "HEAD_ERROR_TILT",
    "HEAD_ERROR_FAN_FAILURE",
    "TYPE_ERROR",
    "USER_OPERATION",
    "FILE_NOT_FOUND",
    "HARDWARE_ERROR",
    "HARDWARE_ERROR_DOOR_OPENED",
    "HARDWARE_ERROR_PLATE_MISSING",
    "HARDWARE_ERROR_ZPROBE_ERROR",
    "HARDWARE_ERROR_CONVERGENCE_FAILED",
    "HARDWARE_ERROR_HOME_FAILED",
    "HARDWARE_ERROR_MAINBOARD_ERROR",
    "HARDWARE_ERROR_PUMP_ERROR",
    "HARDWARE_ERROR_FAN_FAILURE",
    "LASER_DOWN",
    "M_TOO_FAR",
    "AUTH_ERROR",
    "TOO_LARGE",
];

/// A firmware response with its error normalized to a code list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedResponse {
    pub status: String,
    pub error: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl ClassifiedResponse {
    pub fn is_error(&self) -> bool {
        self.status == "error" || self.status == "fatal" || !self.error.is_empty()
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.error.iter().any(|c| c == code)
    }
}

/// Strip `prefix: ` and upper-case a single code
pub fn normalize_code(raw: &str) -> String {
    let trimmed = raw.trim();
    TRAILING_CODE
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed)
        .to_uppercase()
}

/// Fold firmware error shapes into `{status, error: [...]}`
pub fn classify_firmware_response(response: &Value) -> ClassifiedResponse {
    let status = response
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let info = response.get("info").and_then(Value::as_str).map(str::to_string);

    let mut error: Vec<String> = match response.get("error") {
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    };

    if status == "error" {
        if info.as_deref() == Some("RESOURCE_BUSY") {
            error = vec!["RESOURCE_BUSY".to_string()];
        } else if let Some(module) = response.get("module").and_then(Value::as_str) {
            // Toolhead-originated errors are prefixed so they group with head errors
            if module == "LASER" && error.first().map(String::as_str) != Some("HEAD_ERROR") {
                error.insert(0, "HEAD_ERROR".to_string());
            }
        } else if error.first().map(String::as_str) == Some("HEAD_ERROR") && error.len() == 1 {
            error.push("HEAD_OFFLINE".to_string());
        }

        if error.is_empty() {
            error.push("UNKNOWN_ERROR".to_string());
        }
    }

    ClassifiedResponse {
        status,
        error: error.iter().map(|e| normalize_code(e)).collect(),
        info,
    }
}

/// Map one or more error codes onto a message key.
///
/// Generic codes resolve to `generic_error.<CODE>`; otherwise the joined
/// code list is tried before the first code, both as `monitor.<KEY>`.
/// Unknown codes fall back to the codes joined by spaces.
pub fn translate<S: AsRef<str>>(codes: &[S]) -> String {
    let Some(first) = codes.first() else {
        return String::new();
    };

    if GENERIC_KEYS.contains(&first.as_ref()) {
        return format!("generic_error.{}", first.as_ref());
    }

    let normalized: Vec<String> = codes.iter().map(|c| normalize_code(c.as_ref())).collect();
    let joined = normalized.join("_");
    if MONITOR_KEYS.contains(&joined.as_str()) {
        return format!("monitor.{joined}");
    }
    if MONITOR_KEYS.contains(&normalized[0].as_str()) {
        return format!("monitor.{}", normalized[0]);
    }

    normalized.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_resource_busy_from_info() {
        let classified = classify_firmware_response(&json!({
            "status": "error",
            "info": "RESOURCE_BUSY",
            "error": "something else"
        }));
        assert_eq!(classified.error, vec!["RESOURCE_BUSY"]);
        assert!(classified.is_error());
    }

    #[test]
    fn test_laser_module_prefixed() {
        let classified = classify_firmware_response(&json!({
            "status": "error",
            "module": "LASER",
            "error": ["TYPE_ERROR"]
        }));
        assert_eq!(classified.error, vec!["HEAD_ERROR", "TYPE_ERROR"]);
    }

    #[test]
    fn test_missing_module_means_head_offline() {
        let classified = classify_firmware_response(&json!({
            "status": "error",
            "error": "HEAD_ERROR"
        }));
        assert_eq!(classified.error, vec!["HEAD_ERROR", "HEAD_OFFLINE"]);
    }

    #[test]
    fn test_codes_normalized() {
        let classified = classify_firmware_response(&json!({
            "status": "error",
            "error": ["Kicked: kicked"]
        }));
        assert_eq!(classified.error, vec!["KICKED"]);
    }

    #[test]
    fn test_ok_response_has_no_error() {
        let classified = classify_firmware_response(&json!({"status": "ok"}));
        assert!(!classified.is_error());
        assert!(classified.error.is_empty());
    }

    #[test]
    fn test_error_without_codes() {
        let classified = classify_firmware_response(&json!({"status": "error"}));
        assert_eq!(classified.error, vec!["UNKNOWN_ERROR"]);
    }

    #[test]
    fn test_translate() {
        assert_eq!(translate(&["RESOURCE_BUSY"]), "generic_error.RESOURCE_BUSY");
        assert_eq!(translate(&["HEAD_ERROR", "HEAD_OFFLINE"]), "monitor.HEAD_ERROR_HEAD_OFFLINE");
        assert_eq!(translate(&["USER_OPERATION", "REMOTE"]), "monitor.USER_OPERATION");
        assert_eq!(translate(&["weird: thing"]), "THING");
        assert_eq!(translate::<&str>(&[]), "");
    }
}
