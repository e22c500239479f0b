//! Parsing of the `camera_offset` device setting
//!
//! The setting is a space-joined list of `KEY:value` tokens, for example
//! `Y:30 X:15 R:0 S:1.625 SX:1.625 SY:1.625 F:1`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static OFFSET_X: LazyLock<Regex> = LazyLock::new(|| token(r"X"));
static OFFSET_Y: LazyLock<Regex> = LazyLock::new(|| token(r"Y"));
static ANGLE: LazyLock<Regex> = LazyLock::new(|| token(r"R"));
static SCALE: LazyLock<Regex> = LazyLock::new(|| token(r"S"));
static SCALE_X: LazyLock<Regex> = LazyLock::new(|| token(r"SX"));
static SCALE_Y: LazyLock<Regex> = LazyLock::new(|| token(r"SY"));
static FLIP: LazyLock<Regex> = LazyLock::new(|| token(r"F"));

fn token(key: &str) -> Regex {
    Regex::new(&format!(r"(?:^|\s){key}:\s?(-?\d+(?:\.\d+)?)")).expect("valid regex")
}

fn capture(re: &Regex, setting: &str) -> Option<f64> {
    re.captures(setting)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Camera placement relative to the laser head
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraOffset {
    pub x: f64,
    pub y: f64,
    pub angle: f64,
    pub scale_ratio_x: f64,
    pub scale_ratio_y: f64,
    pub flip: bool,
}

impl CameraOffset {
    /// Parse the setting; `None` unless X, Y, R and a scale are present.
    /// Per-axis `SX`/`SY` take precedence over the averaged `S`.
    pub fn parse(setting: &str) -> Option<Self> {
        let scale = || capture(&SCALE, setting);
        Some(Self {
            x: capture(&OFFSET_X, setting)?,
            y: capture(&OFFSET_Y, setting)?,
            angle: capture(&ANGLE, setting)?,
            scale_ratio_x: capture(&SCALE_X, setting).or_else(scale)?,
            scale_ratio_y: capture(&SCALE_Y, setting).or_else(scale)?,
            flip: needs_flip(setting),
        })
    }
}

/// Whether frames from this camera arrive upside down
pub fn needs_flip(setting: &str) -> bool {
    capture(&FLIP, setting).is_some_and(|f| f > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_setting() {
        let offset = CameraOffset::parse("Y:30 X:15 R:0 S:1.625 SX:1.625 SY:1.625").unwrap();
        assert_eq!(offset.x, 15.0);
        assert_eq!(offset.y, 30.0);
        assert_eq!(offset.angle, 0.0);
        assert_eq!(offset.scale_ratio_x, 1.625);
        assert_eq!(offset.scale_ratio_y, 1.625);
        assert!(!offset.flip);
    }

    #[test]
    fn test_scale_falls_back_to_s() {
        let offset = CameraOffset::parse("X:-2.5 Y:3 R:-0.01 S:1.5").unwrap();
        assert_eq!(offset.x, -2.5);
        assert_eq!(offset.scale_ratio_x, 1.5);
        assert_eq!(offset.scale_ratio_y, 1.5);
    }

    #[test]
    fn test_axis_scales_win_over_average() {
        let offset = CameraOffset::parse("Y:30 X:15 R:0 S:1.65 SX:1.6 SY:1.7").unwrap();
        assert_eq!(offset.scale_ratio_x, 1.6);
        assert_eq!(offset.scale_ratio_y, 1.7);

        let only_x = CameraOffset::parse("Y:30 X:15 R:0 S:1.65 SX:1.6").unwrap();
        assert_eq!(only_x.scale_ratio_x, 1.6);
        assert_eq!(only_x.scale_ratio_y, 1.65);
    }

    #[test]
    fn test_x_not_confused_with_sx() {
        let offset = CameraOffset::parse("SX:2.0 SY:2.0 X:7 Y:8 R:0").unwrap();
        assert_eq!(offset.x, 7.0);
        assert_eq!(offset.scale_ratio_x, 2.0);
    }

    #[test]
    fn test_flip_flag() {
        assert!(needs_flip("X:15 Y:30 R:0 S:1.6 F:1"));
        assert!(needs_flip("X:15 Y:30 F: 1.0"));
        assert!(!needs_flip("X:15 Y:30 F:0"));
        assert!(!needs_flip("X:15 Y:30"));
    }

    #[test]
    fn test_incomplete_setting() {
        assert!(CameraOffset::parse("X:15").is_none());
    }
}
