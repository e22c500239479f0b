//! Firmware version capability checks
//!
//! Firmware versions look like `3.2.6` or `1.5b12`: the second segment may
//! carry an alpha (`a`) or beta (`b`) suffix with a build counter. Ordering
//! for the same minor number is alpha < beta < release.

use serde::{Deserialize, Serialize};
use tracing::warn;

const MINOR_WEIGHT: i64 = 120_000;
const ALPHA_OFFSET: i64 = 80_000;
const BETA_OFFSET: i64 = 40_000;

/// Features gated on a minimum firmware version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    ScanCalibration,
    OperateDuringPause,
    UpgradeKitProfileSetting,
    M666rMmtest,
    Backlash,
    CloseFan,
    BeamboxCameraSpeedUp,
    BeamboxCameraCalibrationXyRatio,
    RelocateOrigin,
    DiodeAndAutofocus,
    TempI2cCmd,
}

impl Capability {
    /// Lowest firmware version that supports this capability
    pub fn minimum(&self) -> &'static str {
        match self {
            Self::ScanCalibration => "1.1.5",
            Self::OperateDuringPause => "1.3.10",
            Self::CloseFan => "1.4.1",
            Self::UpgradeKitProfileSetting => "1.5b12",
            Self::M666rMmtest => "1.5b12",
            Self::Backlash => "1.5b12",
            Self::BeamboxCameraCalibrationXyRatio => "1.5.0",
            Self::BeamboxCameraSpeedUp => "1.5.0",
            Self::DiodeAndAutofocus => "3.0.0",
            Self::TempI2cCmd => "3.0.1",
            Self::RelocateOrigin => "3.2.0",
        }
    }
}

/// Parsed firmware version, ordered by (major, minor score, patch)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParsedVersion {
    major: i64,
    minor_score: i64,
    patch: i64,
}

impl ParsedVersion {
    fn parse(version: &str) -> Self {
        let mut segments = version.trim().trim_start_matches('v').split('.');
        let major = leading_number(segments.next().unwrap_or(""));
        let minor_score = segments.next().map(minor_score).unwrap_or(0);
        let patch = segments.next().map(leading_number).unwrap_or(0);
        Self {
            major,
            minor_score,
            patch,
        }
    }

    fn meets(&self, target: &ParsedVersion) -> bool {
        if self.major != target.major {
            return self.major > target.major;
        }
        if self.minor_score != target.minor_score {
            return self.minor_score > target.minor_score;
        }
        target.patch <= self.patch
    }
}

/// `5` -> 600000, `5b12` -> 560012, `5a3` -> 520003
fn minor_score(segment: &str) -> i64 {
    let (number, offset, counter) = if let Some((number, counter)) = segment.split_once('a') {
        (number, ALPHA_OFFSET, counter)
    } else if let Some((number, counter)) = segment.split_once('b') {
        (number, BETA_OFFSET, counter)
    } else {
        (segment, 0, "")
    };

    let mut counter = leading_number(counter);
    if counter >= BETA_OFFSET {
        warn!(segment, counter, "Pre-release counter out of range, clamping");
        counter = BETA_OFFSET - 1;
    }

    leading_number(number) * MINOR_WEIGHT - offset + counter
}

fn leading_number(s: &str) -> i64 {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Answers "does this firmware support X"
#[derive(Debug, Clone)]
pub struct VersionChecker {
    version: String,
    parsed: ParsedVersion,
}

impl VersionChecker {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            parsed: ParsedVersion::parse(version),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn meet_requirement(&self, capability: Capability) -> bool {
        self.meets_version(capability.minimum())
    }

    /// Whether this version is at least `target`
    pub fn meets_version(&self, target: &str) -> bool {
        self.parsed.meets(&ParsedVersion::parse(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_orderings() {
        assert!(VersionChecker::new("3.2.6").meets_version("3.0.1"));
        assert!(!VersionChecker::new("1.5b12").meets_version("1.5.0"));
        assert!(VersionChecker::new("1.5.0").meets_version("1.5b12"));
        assert!(VersionChecker::new("2.5.1").meets_version("2.5.1"));
    }

    #[test]
    fn test_major_dominates() {
        assert!(VersionChecker::new("2.0.0").meets_version("1.9.99"));
        assert!(!VersionChecker::new("1.9.99").meets_version("2.0.0"));
    }

    #[test]
    fn test_prerelease_ordering() {
        assert!(VersionChecker::new("1.5b13").meets_version("1.5b12"));
        assert!(!VersionChecker::new("1.5b11").meets_version("1.5b12"));
        assert!(!VersionChecker::new("1.5a99").meets_version("1.5b1"));
        assert!(VersionChecker::new("1.6a1").meets_version("1.5.40"));
    }

    #[test]
    fn test_patch_comparison() {
        assert!(!VersionChecker::new("3.0.0").meets_version("3.0.1"));
        assert!(VersionChecker::new("1.3.10").meets_version("1.3.9"));
    }

    #[test]
    fn test_transitive() {
        let versions = ["1.4.1", "1.5a2", "1.5b12", "1.5.0", "1.5.3", "3.0.1"];
        for (i, lower) in versions.iter().enumerate() {
            for higher in &versions[i..] {
                assert!(VersionChecker::new(higher).meets_version(lower), "{higher} >= {lower}");
            }
        }
    }

    #[test]
    fn test_capability_table() {
        let checker = VersionChecker::new("3.2.6");
        assert!(checker.meet_requirement(Capability::RelocateOrigin));
        assert!(checker.meet_requirement(Capability::Backlash));

        let old = VersionChecker::new("1.4.0");
        assert!(!old.meet_requirement(Capability::CloseFan));
        assert!(old.meet_requirement(Capability::OperateDuringPause));
    }

    #[test]
    fn test_garbage_version_is_lowest() {
        let checker = VersionChecker::new("");
        assert!(!checker.meet_requirement(Capability::ScanCalibration));
    }
}
