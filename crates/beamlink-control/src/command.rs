//! Command taxonomy for control sessions
//!
//! Every operation a session can perform is a [`Command`] variant. The
//! session worker matches on it exhaustively to pick the wire text and the
//! response strategy.

use beamlink_core::{FcodeVersion, Report};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ControlError;
use crate::linecheck::StreamOutcome;
use crate::transport::Incoming;

/// Default feed rate for raw moves, mm/min
pub const DEFAULT_FEEDRATE: f64 = 6000.0;

/// Operating mode of a control session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Normal,
    Maintain,
    Raw,
}

/// Transfer progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
}

impl Progress {
    pub fn new(completed: u64, total: u64) -> Self {
        Self { completed, total }
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

/// Callback invoked with transfer progress
#[derive(Clone)]
pub struct ProgressFn(Arc<dyn Fn(Progress) + Send + Sync>);

impl ProgressFn {
    pub fn new(f: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, progress: Progress) {
        (self.0)(progress)
    }
}

impl fmt::Debug for ProgressFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressFn")
    }
}

/// Which board a firmware image is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareTarget {
    Firmware,
    Mainboard,
    Headboard,
}

impl FirmwareTarget {
    fn verb(&self) -> &'static str {
        match self {
            Self::Firmware => "update_fw",
            Self::Mainboard => "update_mbfw",
            Self::Headboard => "update_hbfw",
        }
    }
}

/// What `raw home` homes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HomeTarget {
    #[default]
    Axes,
    Camera,
    ZAxis,
}

/// Linear move in raw mode
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RawMove {
    pub f: Option<f64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub a: Option<f64>,
}

impl RawMove {
    pub fn to(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    /// `G1F6000X10Y20.5`
    pub fn gcode(&self) -> String {
        let mut gcode = format!("G1F{}", fmt_coord(self.f.unwrap_or(DEFAULT_FEEDRATE)));
        for (axis, value) in [('X', self.x), ('Y', self.y), ('Z', self.z), ('A', self.a)] {
            if let Some(value) = value {
                gcode.push(axis);
                gcode.push_str(&fmt_coord(value));
            }
        }
        gcode
    }
}

fn fmt_coord(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    format!("{rounded}")
}

/// A unit of work for a control session
#[derive(Debug, Clone)]
pub enum Command {
    // Job control
    Report,
    Select { path: String },
    Start,
    Pause,
    Resume,
    Restart,
    Abort,
    Quit,
    Kick,
    PlayInfo,

    // Files
    Ls { path: String },
    LsUsb,
    FileInfo { path: String },
    DeleteFile { path: String },
    Upload {
        data: Bytes,
        /// `(directory, file name)`; `None` uploads the job to the player
        destination: Option<(String, String)>,
        progress: Option<ProgressFn>,
    },
    DownloadFile { path: String, progress: Option<ProgressFn> },
    DownloadLog { name: String, progress: Option<ProgressFn> },

    // Settings and info
    GetDeviceSetting { key: String },
    SetDeviceSetting { key: String, value: String },
    DeleteDeviceSetting { key: String },
    DeviceInfo,
    GetLaserPower,
    SetLaserPower(f64),
    GetLaserSpeed,
    SetLaserSpeed(f64),
    GetFan,
    SetFan(f64),
    SetOriginX(f64),
    SetOriginY(f64),
    UpdateFirmware {
        target: FirmwareTarget,
        data: Bytes,
        progress: Option<ProgressFn>,
    },

    // Mode transitions
    EnterMaintainMode,
    EndMaintainMode,
    EnterRawMode,
    EndRawMode,
    QuitTask,

    // Maintain mode
    MaintainMove { f: f64, x: f64, y: f64, z: Option<f64> },
    MaintainHome,
    MaintainCloseFan,
    HeadInfo,
    UpdateToolhead { data: Bytes, progress: Option<ProgressFn> },

    // Raw mode
    RawHome(HomeTarget),
    RawUnlock,
    RawMove(RawMove),
    RawSetWaterPump { on: bool, fcode: FcodeVersion },
    RawSetAirPump { on: bool, fcode: FcodeVersion },
    RawSetFan { on: bool, fcode: FcodeVersion },
    RawSetRotary { on: bool, fcode: FcodeVersion },
    RawLooseMotor { fcode: FcodeVersion },
    RawSetLaser { on: bool, power: Option<f64> },
    RawSetOrigin { fcode: FcodeVersion },
    RawStartLineCheckMode,
    RawEndLineCheckMode,
    RawStreamGcode {
        lines: Vec<String>,
        progress: Option<ProgressFn>,
        stop: CancellationToken,
    },
}

impl Command {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Select { .. } => "select",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Restart => "restart",
            Self::Abort => "abort",
            Self::Quit => "quit",
            Self::Kick => "kick",
            Self::PlayInfo => "play_info",
            Self::Ls { .. } => "ls",
            Self::LsUsb => "lsusb",
            Self::FileInfo { .. } => "file_info",
            Self::DeleteFile { .. } => "delete_file",
            Self::Upload { .. } => "upload",
            Self::DownloadFile { .. } => "download_file",
            Self::DownloadLog { .. } => "download_log",
            Self::GetDeviceSetting { .. } => "get_device_setting",
            Self::SetDeviceSetting { .. } => "set_device_setting",
            Self::DeleteDeviceSetting { .. } => "delete_device_setting",
            Self::DeviceInfo => "device_info",
            Self::GetLaserPower => "get_laser_power",
            Self::SetLaserPower(_) => "set_laser_power",
            Self::GetLaserSpeed => "get_laser_speed",
            Self::SetLaserSpeed(_) => "set_laser_speed",
            Self::GetFan => "get_fan",
            Self::SetFan(_) => "set_fan",
            Self::SetOriginX(_) => "set_origin_x",
            Self::SetOriginY(_) => "set_origin_y",
            Self::UpdateFirmware { .. } => "update_firmware",
            Self::EnterMaintainMode => "enter_maintain_mode",
            Self::EndMaintainMode => "end_maintain_mode",
            Self::EnterRawMode => "enter_raw_mode",
            Self::EndRawMode => "end_raw_mode",
            Self::QuitTask => "quit_task",
            Self::MaintainMove { .. } => "maintain_move",
            Self::MaintainHome => "maintain_home",
            Self::MaintainCloseFan => "maintain_close_fan",
            Self::HeadInfo => "head_info",
            Self::UpdateToolhead { .. } => "update_toolhead",
            Self::RawHome(_) => "raw_home",
            Self::RawUnlock => "raw_unlock",
            Self::RawMove(_) => "raw_move",
            Self::RawSetWaterPump { .. } => "raw_set_water_pump",
            Self::RawSetAirPump { .. } => "raw_set_air_pump",
            Self::RawSetFan { .. } => "raw_set_fan",
            Self::RawSetRotary { .. } => "raw_set_rotary",
            Self::RawLooseMotor { .. } => "raw_loose_motor",
            Self::RawSetLaser { .. } => "raw_set_laser",
            Self::RawSetOrigin { .. } => "raw_set_origin",
            Self::RawStartLineCheckMode => "raw_start_line_check_mode",
            Self::RawEndLineCheckMode => "raw_end_line_check_mode",
            Self::RawStreamGcode { .. } => "raw_stream_gcode",
        }
    }

    /// Mode the session must be in for this command, if any
    pub fn required_mode(&self) -> Option<Mode> {
        match self {
            Self::DeviceInfo | Self::EnterMaintainMode | Self::EnterRawMode => Some(Mode::Normal),
            Self::EndMaintainMode
            | Self::MaintainMove { .. }
            | Self::MaintainHome
            | Self::MaintainCloseFan
            | Self::HeadInfo
            | Self::UpdateToolhead { .. } => Some(Mode::Maintain),
            Self::EndRawMode
            | Self::RawHome(_)
            | Self::RawUnlock
            | Self::RawMove(_)
            | Self::RawSetWaterPump { .. }
            | Self::RawSetAirPump { .. }
            | Self::RawSetFan { .. }
            | Self::RawSetRotary { .. }
            | Self::RawLooseMotor { .. }
            | Self::RawSetLaser { .. }
            | Self::RawSetOrigin { .. }
            | Self::RawStartLineCheckMode
            | Self::RawEndLineCheckMode
            | Self::RawStreamGcode { .. } => Some(Mode::Raw),
            _ => None,
        }
    }

    /// Wire text for commands answered by a single frame or an `ok` frame
    pub fn wire(&self) -> Option<String> {
        let text = match self {
            Self::Select { path } => format!("play select {path}"),
            Self::Start => "play start".to_string(),
            Self::Pause => "play pause".to_string(),
            Self::Resume => "play resume".to_string(),
            Self::Restart => "play restart".to_string(),
            Self::Kick => "kick".to_string(),
            Self::PlayInfo => "play info".to_string(),
            Self::Ls { path } => format!("file ls {path}"),
            Self::LsUsb => "file lsusb".to_string(),
            Self::FileInfo { path } => format!("file fileinfo {path}"),
            Self::DeleteFile { path } => format!("file rmfile {path}"),
            Self::GetDeviceSetting { key } => format!("config get {key}"),
            Self::SetDeviceSetting { key, value } => format!("config set {key} {value}"),
            Self::DeleteDeviceSetting { key } => format!("config del {key}"),
            Self::DeviceInfo => "deviceinfo".to_string(),
            Self::GetLaserPower => "play get_laser_power".to_string(),
            Self::SetLaserPower(power) => format!("play set_laser_power {power}"),
            Self::GetLaserSpeed => "play get_laser_speed".to_string(),
            Self::SetLaserSpeed(speed) => format!("play set_laser_speed {speed}"),
            Self::GetFan => "play get_fan".to_string(),
            Self::SetFan(speed) => format!("play set_fan {speed}"),
            Self::SetOriginX(x) => format!("play set_origin_x {x}"),
            Self::SetOriginY(y) => format!("play set_origin_y {y}"),
            Self::EnterMaintainMode => "task maintain".to_string(),
            Self::EnterRawMode => "task raw".to_string(),
            Self::EndMaintainMode | Self::EndRawMode | Self::QuitTask => "task quit".to_string(),
            Self::MaintainMove { f, x, y, z } => match z {
                Some(z) => format!("maintain move f:{f} x:{x} y:{y} z:{z}"),
                None => format!("maintain move f:{f} x:{x} y:{y}"),
            },
            Self::MaintainHome => "maintain home".to_string(),
            Self::MaintainCloseFan => "maintain close_fan".to_string(),
            Self::HeadInfo => "maintain headinfo".to_string(),
            Self::RawHome(HomeTarget::Axes) => "raw home".to_string(),
            Self::RawHome(HomeTarget::Camera) => "$HCAM".to_string(),
            Self::RawHome(HomeTarget::ZAxis) => "$HZ".to_string(),
            Self::RawUnlock => "$X".to_string(),
            Self::RawMove(movement) => movement.gcode(),
            Self::RawSetWaterPump { on, fcode } => fcode_switch(*fcode, *on, ("B1", "B2"), ("M136P1", "M136P2")),
            Self::RawSetAirPump { on, fcode } => fcode_switch(*fcode, *on, ("B3", "B4"), ("M136P3", "M136P4")),
            Self::RawSetFan { on, fcode } => fcode_switch(*fcode, *on, ("B5", "B6"), ("M136P5", "M136P6")),
            Self::RawSetRotary { on, fcode } => fcode_switch(*fcode, *on, ("R1", "R0"), ("M137P35", "M137P36")),
            Self::RawLooseMotor { fcode } => fcode_switch(*fcode, true, ("B34", ""), ("M137P34", "")),
            Self::RawSetOrigin { fcode } => fcode_switch(*fcode, true, ("B47", ""), ("M137P186", "")),
            Self::RawSetLaser { on, power } => {
                let base = if *on { "M3" } else { "M5" };
                match power {
                    Some(power) => format!("{base}S{power}"),
                    None => base.to_string(),
                }
            }
            Self::RawStartLineCheckMode => "$@".to_string(),
            Self::RawEndLineCheckMode => "M172".to_string(),
            Self::Report => "play report".to_string(),
            Self::Abort => "play abort".to_string(),
            Self::Quit => "play quit".to_string(),
            Self::Upload { .. }
            | Self::DownloadFile { .. }
            | Self::DownloadLog { .. }
            | Self::UpdateFirmware { .. }
            | Self::UpdateToolhead { .. }
            | Self::RawStreamGcode { .. } => return None,
        };
        Some(text)
    }
}

fn fcode_switch(fcode: FcodeVersion, on: bool, v1: (&str, &str), v2: (&str, &str)) -> String {
    let (on_code, off_code) = match fcode {
        FcodeVersion::V1 => v1,
        FcodeVersion::V2 => v2,
    };
    let code = if on { on_code } else { off_code };
    code.to_string()
}

/// Header announcing an upload of `size` bytes
pub fn upload_header(size: usize, destination: Option<&(String, String)>) -> Result<String, ControlError> {
    if size == 0 {
        return Err(ControlError::InvalidArgument("file is empty".to_string()));
    }

    let Some((directory, file_name)) = destination else {
        return Ok(format!("file upload application/fcode {size}"));
    };

    let file_name = file_name.replace(' ', "_");
    let (stem, ext) = file_name
        .rsplit_once('.')
        .ok_or_else(|| ControlError::InvalidArgument(format!("no file extension in {file_name}")))?;

    let (mime, name) = match ext {
        "gcode" => ("text/gcode", format!("{stem}.fc")),
        "fc" => ("application/fcode", file_name.clone()),
        "jpg" => ("image/jpeg", file_name.clone()),
        "json" => ("application/json", file_name.clone()),
        "png" => ("image/png", file_name.clone()),
        other => {
            return Err(ControlError::InvalidArgument(format!("unsupported file type {other}")));
        }
    };

    Ok(format!("upload {mime} {size} {directory}/{name}"))
}

/// Header for firmware images
pub fn firmware_header(target: FirmwareTarget, size: usize) -> String {
    format!("{} binary/flux-firmware {size}", target.verb())
}

/// Header for toolhead firmware images
pub fn toolhead_header(size: usize) -> String {
    format!("maintain update_hbfw binary/fireware {size}")
}

/// Result of a command
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The frame that completed the command
    Ack(Value),
    /// Everything received until the closing `ok` frame
    Collected { data: Vec<Incoming>, response: Value },
    Report(Report),
    /// Accumulated raw-mode text
    Raw(String),
    Download { metadata: Value, data: Bytes },
    Stream(StreamOutcome),
}

impl Reply {
    /// The completing JSON frame
    pub fn into_value(self) -> Result<Value, ControlError> {
        match self {
            Self::Ack(value) | Self::Collected { response: value, .. } => Ok(value),
            Self::Raw(text) => Ok(Value::String(text)),
            other => Err(unexpected("a JSON frame", &other)),
        }
    }

    pub fn into_report(self) -> Result<Report, ControlError> {
        match self {
            Self::Report(report) => Ok(report),
            other => Err(unexpected("a report", &other)),
        }
    }

    pub fn into_raw(self) -> Result<String, ControlError> {
        match self {
            Self::Raw(text) => Ok(text),
            other => Err(unexpected("raw text", &other)),
        }
    }

    pub fn into_collected(self) -> Result<(Vec<Incoming>, Value), ControlError> {
        match self {
            Self::Collected { data, response } => Ok((data, response)),
            other => Err(unexpected("collected frames", &other)),
        }
    }

    pub fn into_download(self) -> Result<(Value, Bytes), ControlError> {
        match self {
            Self::Download { metadata, data } => Ok((metadata, data)),
            other => Err(unexpected("a download", &other)),
        }
    }

    pub fn into_stream(self) -> Result<StreamOutcome, ControlError> {
        match self {
            Self::Stream(outcome) => Ok(outcome),
            other => Err(unexpected("a stream outcome", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Reply) -> ControlError {
    ControlError::Protocol(format!("expected {wanted}, got {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_move_gcode() {
        assert_eq!(RawMove::to(10.0, 20.5).gcode(), "G1F6000X10Y20.5");
        let movement = RawMove {
            f: Some(1200.0),
            z: Some(3.14159),
            a: Some(-1.0),
            ..RawMove::default()
        };
        assert_eq!(movement.gcode(), "G1F1200Z3.142A-1");
    }

    #[test]
    fn test_fcode_dialects() {
        let v1 = Command::RawSetWaterPump { on: true, fcode: FcodeVersion::V1 };
        let v2 = Command::RawSetWaterPump { on: false, fcode: FcodeVersion::V2 };
        assert_eq!(v1.wire().as_deref(), Some("B1"));
        assert_eq!(v2.wire().as_deref(), Some("M136P2"));

        let rotary = Command::RawSetRotary { on: false, fcode: FcodeVersion::V1 };
        assert_eq!(rotary.wire().as_deref(), Some("R0"));
        let loose = Command::RawLooseMotor { fcode: FcodeVersion::V2 };
        assert_eq!(loose.wire().as_deref(), Some("M137P34"));
    }

    #[test]
    fn test_required_modes() {
        assert_eq!(Command::MaintainHome.required_mode(), Some(Mode::Maintain));
        assert_eq!(Command::RawUnlock.required_mode(), Some(Mode::Raw));
        assert_eq!(Command::EnterRawMode.required_mode(), Some(Mode::Normal));
        assert_eq!(Command::Report.required_mode(), None);
    }

    #[test]
    fn test_upload_header() {
        assert_eq!(upload_header(10, None).unwrap(), "file upload application/fcode 10");

        let dest = ("/SD".to_string(), "my job.gcode".to_string());
        assert_eq!(upload_header(10, Some(&dest)).unwrap(), "upload text/gcode 10 /SD/my_job.fc");

        let png = ("/SD".to_string(), "a.png".to_string());
        assert_eq!(upload_header(5, Some(&png)).unwrap(), "upload image/png 5 /SD/a.png");

        let bad = ("/SD".to_string(), "a.exe".to_string());
        assert!(matches!(upload_header(5, Some(&bad)), Err(ControlError::InvalidArgument(_))));
        assert!(matches!(upload_header(0, None), Err(ControlError::InvalidArgument(_))));
    }

    #[test]
    fn test_firmware_headers() {
        assert_eq!(firmware_header(FirmwareTarget::Firmware, 42), "update_fw binary/flux-firmware 42");
        assert_eq!(firmware_header(FirmwareTarget::Mainboard, 1), "update_mbfw binary/flux-firmware 1");
        assert_eq!(toolhead_header(7), "maintain update_hbfw binary/fireware 7");
    }
}
