//! Device commands routed to the selected device's control session

use beamlink_control::command::HomeTarget;
use beamlink_control::{Command, FirmwareTarget, Incoming, ProgressFn, RawMove, Reply, StreamOutcome};
use beamlink_core::camera_offset::needs_flip;
use beamlink_core::status::code;
use beamlink_core::{translate, Capability, DeviceDescriptor, Report, VersionChecker};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{lock, DeviceMaster};
use crate::error::MasterError;

const COMPLETION_POLL: Duration = Duration::from_secs(1);
const DISCOVERY_POLL: Duration = Duration::from_millis(500);

/// Metadata of a stored file plus its embedded previews
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileInfo {
    pub info: Value,
    #[serde(skip)]
    pub previews: Vec<Bytes>,
}

impl DeviceMaster {
    async fn run(&self, command: Command) -> Result<Reply, MasterError> {
        let control = self.get_control().await?;
        debug!(uuid = %control.uuid(), command = command.name(), "Dispatching");
        Ok(control.add_task(command).await?)
    }

    async fn run_value(&self, command: Command) -> Result<Value, MasterError> {
        Ok(self.run(command).await?.into_value()?)
    }

    async fn current_info(&self) -> Result<DeviceDescriptor, MasterError> {
        self.current_device().await.ok_or(MasterError::NoDeviceSelected)
    }

    async fn require(&self, capability: Capability) -> Result<DeviceDescriptor, MasterError> {
        let info = self.current_info().await?;
        if VersionChecker::new(&info.firmware_version).meet_requirement(capability) {
            Ok(info)
        } else {
            Err(MasterError::Unsupported {
                capability,
                version: info.firmware_version,
            })
        }
    }

    // Job control

    /// Upload a job to the player and start it
    pub async fn go(&self, data: Bytes, progress: Option<ProgressFn>) -> Result<Value, MasterError> {
        self.run(Command::Upload {
            data,
            destination: None,
            progress,
        })
        .await?;
        self.run_value(Command::Start).await
    }

    /// Start a job already stored on the device
    pub async fn go_from_file(&self, path: &str) -> Result<Value, MasterError> {
        self.run(Command::Select { path: path.to_string() }).await?;
        self.run_value(Command::Start).await
    }

    pub async fn resume(&self) -> Result<Value, MasterError> {
        self.run_value(Command::Resume).await
    }

    pub async fn pause(&self) -> Result<Value, MasterError> {
        self.run_value(Command::Pause).await
    }

    pub async fn stop(&self) -> Result<Value, MasterError> {
        self.run_value(Command::Abort).await
    }

    pub async fn restart(&self) -> Result<Value, MasterError> {
        self.run_value(Command::Restart).await
    }

    pub async fn quit(&self) -> Result<Value, MasterError> {
        self.run_value(Command::Quit).await
    }

    pub async fn kick(&self) -> Result<Value, MasterError> {
        self.run_value(Command::Kick).await
    }

    pub async fn quit_task(&self) -> Result<Value, MasterError> {
        self.run_value(Command::QuitTask).await
    }

    // Files

    pub async fn ls(&self, path: &str) -> Result<Value, MasterError> {
        self.run_value(Command::Ls { path: path.to_string() }).await
    }

    pub async fn lsusb(&self) -> Result<Value, MasterError> {
        self.run_value(Command::LsUsb).await
    }

    pub async fn file_info(&self, path: &str) -> Result<FileInfo, MasterError> {
        let (data, info) = self
            .run(Command::FileInfo { path: path.to_string() })
            .await?
            .into_collected()?;
        let previews = data
            .into_iter()
            .filter_map(|frame| match frame {
                Incoming::Binary(bytes) => Some(bytes),
                _ => None,
            })
            .collect();
        Ok(FileInfo { info, previews })
    }

    pub async fn delete_file(&self, path: &str) -> Result<Value, MasterError> {
        self.run_value(Command::DeleteFile { path: path.to_string() }).await
    }

    pub async fn upload_to_directory(
        &self,
        data: Bytes,
        directory: &str,
        file_name: &str,
        progress: Option<ProgressFn>,
    ) -> Result<Value, MasterError> {
        self.run_value(Command::Upload {
            data,
            destination: Some((directory.to_string(), file_name.to_string())),
            progress,
        })
        .await
    }

    pub async fn download_file(&self, path: &str, progress: Option<ProgressFn>) -> Result<(Value, Bytes), MasterError> {
        Ok(self
            .run(Command::DownloadFile {
                path: path.to_string(),
                progress,
            })
            .await?
            .into_download()?)
    }

    pub async fn download_log(&self, name: &str, progress: Option<ProgressFn>) -> Result<(Value, Bytes), MasterError> {
        Ok(self
            .run(Command::DownloadLog {
                name: name.to_string(),
                progress,
            })
            .await?
            .into_download()?)
    }

    // Status

    /// Current status; also refreshes the record's status and error codes
    pub async fn get_report(&self) -> Result<Report, MasterError> {
        let (_, slot) = self.current_slot()?;
        let control = self.get_control().await?;
        let report = control.report().await?;

        let mut conn = slot.lock().await;
        conn.info
            .apply_status(report.st_id, Some(report.st_label.clone()), report.error_label());
        conn.errors = report.error.clone();
        Ok(report)
    }

    /// Periodic status poll: one reconnect on timeout, a second timeout is final
    pub async fn poll_report(&self) -> Result<Report, MasterError> {
        let report = match self.get_report().await {
            Err(e) if e.is_timeout() => {
                warn!(error = %e, "Report timed out, reconnecting once");
                self.reconnect().await?;
                self.get_report().await.inspect_err(|e| {
                    error!(error = %e, "Report failed after reconnect");
                })?
            }
            other => other?,
        };

        if let Some(uuid) = self.current_uuid() {
            if lock(&self.retry_gate).should_prompt(&uuid, &report) {
                self.spawn_retry_prompt(&report);
            }
        }
        Ok(report)
    }

    fn spawn_retry_prompt(&self, report: &Report) {
        let Some(master) = self.me.upgrade() else {
            return;
        };
        let caption = format!("{} Resume the job?", translate(&report.error));
        tokio::spawn(async move {
            if master.collab.prompt.confirm_retry(&caption).await {
                info!("Resuming after firmware error");
                if let Err(e) = master.resume().await {
                    warn!(error = %e, "Resume failed");
                }
            }
            lock(&master.retry_gate).dismissed();
        });
    }

    /// Poll until the job finishes; quits the player on completion
    pub async fn wait_till_completed(&self, on_progress: impl Fn(&Report)) -> Result<(), MasterError> {
        let mut changed = false;
        loop {
            let report = self.get_report().await?;
            match report.st_id {
                code::COMPLETED => {
                    sleep(COMPLETION_POLL).await;
                    self.quit().await?;
                    info!("Job completed");
                    return Ok(());
                }
                code::PAUSED_FROM_STARTING | code::PAUSED_FROM_RUNNING | code::ABORTED
                    if report.has_error() || report.st_id == code::ABORTED =>
                {
                    warn!(st_id = report.st_id, error = ?report.error, "Job stopped");
                    return Err(MasterError::JobFailed {
                        st_id: report.st_id,
                        error: report.error,
                    });
                }
                code::IDLE if changed => return Ok(()),
                code::IDLE => {}
                _ => {
                    changed = true;
                    on_progress(&report);
                }
            }
            sleep(COMPLETION_POLL).await;
        }
    }

    pub async fn get_preview_info(&self) -> Result<Value, MasterError> {
        self.run_value(Command::PlayInfo).await
    }

    pub async fn get_device_info(&self) -> Result<Value, MasterError> {
        self.run_value(Command::DeviceInfo).await
    }

    // Settings

    pub async fn get_device_setting(&self, key: &str) -> Result<Value, MasterError> {
        let (_, slot) = self.current_slot()?;
        let value = self
            .run_value(Command::GetDeviceSetting { key: key.to_string() })
            .await?;

        if key == "camera_offset" || key == "camera_offset_borderless" {
            let mut conn = slot.lock().await;
            if conn.camera_needs_flip.is_none() && !conn.info.is_delta() {
                let flip = value.get("value").and_then(Value::as_str).is_some_and(needs_flip);
                debug!(uuid = %conn.info.uuid, flip, "Camera orientation read");
                conn.camera_needs_flip = Some(flip);
            }
        }
        Ok(value)
    }

    /// `key -> value` for each key, `null` where unset
    pub async fn get_device_settings(&self, keys: &[&str]) -> Result<Map<String, Value>, MasterError> {
        let mut values = Map::new();
        for key in keys {
            let reply = self.get_device_setting(key).await?;
            values.insert(key.to_string(), reply.get("value").cloned().unwrap_or(Value::Null));
        }
        Ok(values)
    }

    /// Store a setting; the value `delete` removes it
    pub async fn set_device_setting(&self, key: &str, value: &str) -> Result<Value, MasterError> {
        let command = if value == "delete" {
            Command::DeleteDeviceSetting { key: key.to_string() }
        } else {
            Command::SetDeviceSetting {
                key: key.to_string(),
                value: value.to_string(),
            }
        };
        self.run_value(command).await
    }

    // Maintain mode

    pub async fn enter_maintain_mode(&self) -> Result<Value, MasterError> {
        let info = self.current_info().await?;
        if VersionChecker::new(&info.firmware_version).meet_requirement(Capability::RelocateOrigin) {
            self.run(Command::SetOriginX(0.0)).await?;
            self.run(Command::SetOriginY(0.0)).await?;
        }
        self.run_value(Command::EnterMaintainMode).await
    }

    pub async fn end_maintain_mode(&self) -> Result<Value, MasterError> {
        self.run_value(Command::EndMaintainMode).await
    }

    pub async fn maintain_move(&self, f: f64, x: f64, y: f64, z: Option<f64>) -> Result<Value, MasterError> {
        self.run_value(Command::MaintainMove { f, x, y, z }).await
    }

    pub async fn maintain_home(&self) -> Result<Value, MasterError> {
        self.run_value(Command::MaintainHome).await
    }

    pub async fn maintain_close_fan(&self) -> Result<Value, MasterError> {
        self.require(Capability::CloseFan).await?;
        self.run_value(Command::MaintainCloseFan).await
    }

    pub async fn head_info(&self) -> Result<Value, MasterError> {
        self.run_value(Command::HeadInfo).await
    }

    // Raw mode

    pub async fn enter_raw_mode(&self) -> Result<Value, MasterError> {
        self.run_value(Command::EnterRawMode).await
    }

    pub async fn end_raw_mode(&self) -> Result<Value, MasterError> {
        self.run_value(Command::EndRawMode).await
    }

    pub async fn raw_home(&self, target: HomeTarget) -> Result<Value, MasterError> {
        self.run_value(Command::RawHome(target)).await
    }

    pub async fn raw_unlock(&self) -> Result<Value, MasterError> {
        self.run_value(Command::RawUnlock).await
    }

    pub async fn raw_move(&self, movement: RawMove) -> Result<Value, MasterError> {
        self.run_value(Command::RawMove(movement)).await
    }

    pub async fn raw_set_water_pump(&self, on: bool) -> Result<Value, MasterError> {
        let fcode = self.current_info().await?.fcode_version();
        self.run_value(Command::RawSetWaterPump { on, fcode }).await
    }

    pub async fn raw_set_air_pump(&self, on: bool) -> Result<Value, MasterError> {
        let fcode = self.current_info().await?.fcode_version();
        self.run_value(Command::RawSetAirPump { on, fcode }).await
    }

    pub async fn raw_set_fan(&self, on: bool) -> Result<Value, MasterError> {
        let fcode = self.current_info().await?.fcode_version();
        self.run_value(Command::RawSetFan { on, fcode }).await
    }

    pub async fn raw_set_rotary(&self, on: bool) -> Result<Value, MasterError> {
        let fcode = self.current_info().await?.fcode_version();
        self.run_value(Command::RawSetRotary { on, fcode }).await
    }

    pub async fn raw_loose_motor(&self) -> Result<Value, MasterError> {
        let fcode = self.current_info().await?.fcode_version();
        self.run_value(Command::RawLooseMotor { fcode }).await
    }

    pub async fn raw_set_laser(&self, on: bool, power: Option<f64>) -> Result<Value, MasterError> {
        self.run_value(Command::RawSetLaser { on, power }).await
    }

    pub async fn raw_set_origin(&self) -> Result<Value, MasterError> {
        let fcode = self.current_info().await?.fcode_version();
        self.run_value(Command::RawSetOrigin { fcode }).await
    }

    pub async fn raw_start_line_check_mode(&self) -> Result<Value, MasterError> {
        self.run_value(Command::RawStartLineCheckMode).await
    }

    pub async fn raw_end_line_check_mode(&self) -> Result<Value, MasterError> {
        self.run_value(Command::RawEndLineCheckMode).await
    }

    /// Replay G-code under line-check; `stop` ends the stream early
    pub async fn stream_gcode(
        &self,
        lines: Vec<String>,
        progress: Option<ProgressFn>,
        stop: CancellationToken,
    ) -> Result<StreamOutcome, MasterError> {
        Ok(self
            .run(Command::RawStreamGcode { lines, progress, stop })
            .await?
            .into_stream()?)
    }

    // Origin and laser

    pub async fn set_origin_x(&self, x: f64) -> Result<Value, MasterError> {
        self.require(Capability::RelocateOrigin).await?;
        self.run_value(Command::SetOriginX(x)).await
    }

    pub async fn set_origin_y(&self, y: f64) -> Result<Value, MasterError> {
        self.require(Capability::RelocateOrigin).await?;
        self.run_value(Command::SetOriginY(y)).await
    }

    pub async fn get_laser_power(&self) -> Result<Value, MasterError> {
        self.run_value(Command::GetLaserPower).await
    }

    pub async fn set_laser_power(&self, power: f64) -> Result<Value, MasterError> {
        self.run_value(Command::SetLaserPower(power)).await
    }

    pub async fn get_laser_speed(&self) -> Result<Value, MasterError> {
        self.run_value(Command::GetLaserSpeed).await
    }

    pub async fn set_laser_speed(&self, speed: f64) -> Result<Value, MasterError> {
        self.run_value(Command::SetLaserSpeed(speed)).await
    }

    pub async fn get_fan(&self) -> Result<Value, MasterError> {
        self.run_value(Command::GetFan).await
    }

    pub async fn set_fan(&self, speed: f64) -> Result<Value, MasterError> {
        self.run_value(Command::SetFan(speed)).await
    }

    // Firmware

    pub async fn update_firmware(
        &self,
        target: FirmwareTarget,
        data: Bytes,
        progress: Option<ProgressFn>,
    ) -> Result<Value, MasterError> {
        info!(?target, bytes = data.len(), "Updating firmware");
        self.run_value(Command::UpdateFirmware { target, data, progress }).await
    }

    pub async fn update_toolhead(&self, data: Bytes, progress: Option<ProgressFn>) -> Result<Value, MasterError> {
        info!(bytes = data.len(), "Updating toolhead firmware");
        self.run_value(Command::UpdateToolhead { data, progress }).await
    }

    // Discovery lookups

    /// Wait up to `timeout` for `uuid` to show up in discovery
    pub async fn get_discovered_device(&self, uuid: &str, timeout: Duration) -> Result<DeviceDescriptor, MasterError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(device) = self.discovered(uuid) {
                return Ok(device);
            }
            if Instant::now() >= deadline {
                return Err(MasterError::NotDiscovered(uuid.to_string()));
            }
            sleep(DISCOVERY_POLL).await;
        }
    }

    pub fn exist_device(&self, serial: &str) -> bool {
        lock(&self.discovered).iter().any(|d| d.serial == serial)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{descriptor, harness, harness_with, selected, ScriptedPrompt};
    use super::*;
    use beamlink_control::mock::{MockBackend, MockDevice};
    use beamlink_control::Progress;
    use beamlink_core::ConnectionError;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_go_uploads_then_starts() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = ProgressFn::new(move |p: Progress| sink.lock().unwrap().push(p));

        h.master.go(Bytes::from(vec![7u8; 5000]), Some(progress)).await.unwrap();

        assert_eq!(h.backend.uploaded("abc"), Some(5000));
        let commands = h.backend.commands("abc");
        assert_eq!(commands.first().map(String::as_str), Some("file upload application/fcode 5000"));
        assert_eq!(commands.last().map(String::as_str), Some("play start"));
        assert_eq!(seen.lock().unwrap().last(), Some(&Progress::new(5000, 5000)));
    }

    #[tokio::test]
    async fn test_go_from_file() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        h.master.go_from_file("/SD/job.fc").await.unwrap();
        assert_eq!(h.backend.commands("abc"), vec!["play select /SD/job.fc", "play start"]);
    }

    #[tokio::test]
    async fn test_stop_waits_for_abort() {
        let h = selected(vec![MockDevice::new("abc").with_status(16, "RUNNING")]).await;
        h.master.stop().await.unwrap();
        assert_eq!(h.master.get_report().await.unwrap().st_id, code::ABORTED);
    }

    #[tokio::test]
    async fn test_firmware_error_is_surfaced() {
        let h = selected(vec![MockDevice::new("abc").with_error("play pause", &["RESOURCE_BUSY"])]).await;
        let err = h.master.pause().await.unwrap_err();
        match err {
            MasterError::Control(e) => assert_eq!(e.codes(), ["RESOURCE_BUSY"]),
            other => panic!("unexpected {other:?}"),
        }
        // The queue keeps working after a rejection
        h.master.resume().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_listing_and_download() {
        let h = selected(vec![MockDevice::new("abc").with_file("/SD/a.fc", &b"hello"[..])]).await;

        let listing = h.master.ls("/SD").await.unwrap();
        assert_eq!(listing["files"], serde_json::json!(["/SD/a.fc"]));

        let (_, data) = h.master.download_file("/SD/a.fc", None).await.unwrap();
        assert_eq!(&data[..], b"hello");

        assert!(h.master.download_file("/SD/missing.fc", None).await.is_err());
    }

    #[tokio::test]
    async fn test_upload_to_directory() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        h.master
            .upload_to_directory(Bytes::from_static(b"G1X1\n"), "/SD", "my job.gcode", None)
            .await
            .unwrap();
        assert_eq!(h.backend.commands("abc")[0], "upload text/gcode 5 /SD/my_job.fc");
        assert_eq!(h.backend.uploaded("abc"), Some(5));
    }

    #[tokio::test]
    async fn test_settings_set_get_delete() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        h.master.set_device_setting("player_speed", "120").await.unwrap();
        assert_eq!(h.backend.setting("abc", "player_speed").as_deref(), Some("120"));

        let values = h.master.get_device_settings(&["player_speed", "unset"]).await.unwrap();
        assert_eq!(values["player_speed"], "120");
        assert_eq!(values["unset"], Value::Null);

        h.master.set_device_setting("player_speed", "delete").await.unwrap();
        assert_eq!(h.backend.setting("abc", "player_speed"), None);
    }

    #[tokio::test]
    async fn test_camera_offset_sets_flip_once() {
        let h = selected(vec![MockDevice::new("abc").with_setting("camera_offset", "Y:30 X:15 R:0 S:1.6 F:1")]).await;
        h.master.get_device_setting("camera_offset").await.unwrap();
        assert_eq!(h.master.slot("abc").lock().await.camera_needs_flip, Some(true));
    }

    #[tokio::test]
    async fn test_delta_models_never_flip() {
        let device = MockDevice::new("abc")
            .with_model("delta-1")
            .with_setting("camera_offset", "F:1");
        let h = harness(vec![device.clone()]);
        h.master.select_device(&device.descriptor).await.unwrap();

        h.master.get_device_setting("camera_offset").await.unwrap();
        assert_eq!(h.master.slot("abc").lock().await.camera_needs_flip, None);
    }

    #[tokio::test]
    async fn test_maintain_mode_relocates_origin() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        h.master.enter_maintain_mode().await.unwrap();
        h.master.maintain_move(6000.0, 10.0, 20.0, None).await.unwrap();
        h.master.end_maintain_mode().await.unwrap();

        assert_eq!(
            h.backend.commands("abc"),
            vec![
                "play set_origin_x 0",
                "play set_origin_y 0",
                "task maintain",
                "maintain move f:6000 x:10 y:20",
                "task quit",
            ]
        );
    }

    #[tokio::test]
    async fn test_old_firmware_skips_origin() {
        let device = MockDevice::new("abc").with_version("1.4.0");
        let h = harness(vec![device.clone()]);
        h.master.select_device(&device.descriptor).await.unwrap();

        h.master.enter_maintain_mode().await.unwrap();
        assert_eq!(h.backend.commands("abc"), vec!["task maintain"]);

        assert!(matches!(
            h.master.set_origin_x(5.0).await,
            Err(MasterError::Unsupported {
                capability: Capability::RelocateOrigin,
                ..
            })
        ));
        assert!(matches!(
            h.master.maintain_close_fan().await,
            Err(MasterError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_raw_commands_follow_model_dialect() {
        let device = MockDevice::new("abc").with_model("ado1");
        let h = harness(vec![device.clone()]);
        h.master.select_device(&device.descriptor).await.unwrap();

        h.master.enter_raw_mode().await.unwrap();
        h.master.raw_set_air_pump(true).await.unwrap();
        h.master.raw_set_laser(true, Some(0.5)).await.unwrap();
        h.master.end_raw_mode().await.unwrap();

        assert_eq!(
            h.backend.commands("abc"),
            vec!["task raw", "M136P3", "M3S0.5", "task quit"]
        );
    }

    #[tokio::test]
    async fn test_raw_command_outside_raw_mode() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        let err = h.master.raw_unlock().await.unwrap_err();
        assert!(matches!(err, MasterError::Control(beamlink_control::ControlError::ModeMismatch { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_till_completed() {
        let h = selected(vec![MockDevice::new("abc").with_status(16, "RUNNING")]).await;
        let backend = h.backend.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            backend.set_status("abc", 64, "COMPLETED", &[]);
        });

        let polls = Mutex::new(0);
        h.master
            .wait_till_completed(|_| *polls.lock().unwrap() += 1)
            .await
            .unwrap();

        assert!(*polls.lock().unwrap() >= 2);
        assert!(h.backend.commands("abc").iter().any(|c| c == "play quit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_till_completed_rejects_paused_error() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        h.backend.set_status("abc", 48, "PAUSED", &["HEAD_ERROR"]);

        let err = h.master.wait_till_completed(|_| {}).await.unwrap_err();
        assert_eq!(
            err,
            MasterError::JobFailed {
                st_id: 48,
                error: vec!["HEAD_ERROR".to_string()],
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_report_reconnects_once() {
        let h = harness(vec![MockDevice::new("abc").with_delay("play report", Duration::from_secs(60))]);
        h.master.select_device(&descriptor("abc")).await.unwrap();

        let err = h.master.poll_report().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(h.backend.opened(), vec!["control/abc", "control/abc"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_report_prompts_retry_once() {
        let backend = MockBackend::new();
        backend.add_device(MockDevice::new("abc"));
        let h = harness_with(backend, ScriptedPrompt::retrying());
        h.master.select_device(&descriptor("abc")).await.unwrap();
        h.backend.set_status("abc", 48, "PAUSED", &["HEAD_ERROR"]);

        h.master.poll_report().await.unwrap();
        h.master.poll_report().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(h.prompt.asked.lock().unwrap().len(), 1);
        assert!(h.backend.commands("abc").iter().any(|c| c == "play resume"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_discovered_device_times_out() {
        let h = harness(vec![]);
        let err = h
            .master
            .get_discovered_device("abc", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, MasterError::NotDiscovered("abc".to_string()));

        h.master.on_discovery(&[descriptor("abc")]);
        let found = h.master.get_discovered_device("abc", Duration::from_secs(2)).await.unwrap();
        assert_eq!(found.serial, "SN-abc");
        assert!(h.master.exist_device("SN-abc"));
        assert!(!h.master.exist_device("SN-other"));
    }

    #[tokio::test]
    async fn test_selection_error_codes_pass_through() {
        let h = harness(vec![]);
        let err = h.master.select_device(&descriptor("abc")).await.unwrap_err();
        assert_eq!(err, ConnectionError::NotFound);
        assert_eq!(h.master.ls("/").await.unwrap_err(), MasterError::NoDeviceSelected);
    }
}
