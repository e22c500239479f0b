//! Response strategies for control session commands

use beamlink_core::status::code;
use beamlink_core::{classify_firmware_response, ConnectionError, Report};
use bytes::Bytes;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::command::{
    firmware_header, toolhead_header, upload_header, Command, Mode, Progress, ProgressFn, Reply,
};
use crate::error::ControlError;
use crate::linecheck::{frame_line, parse_line, raw_text, GcodeStreamer, LineAck, RawLines};
use crate::session::{SessionSnapshot, Worker};
use crate::transport::{Incoming, Outgoing};

const CHUNK_SIZE: usize = 4096;
const REPORT_RETRIES: u32 = 3;
const STOP_RETRIES: u32 = 3;
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const TOGGLE_TIMEOUT: Duration = Duration::from_secs(10);
const TOGGLE_RETRIES: u32 = 5;
const TOGGLE_RETRY_DELAY: Duration = Duration::from_millis(200);
const HOME_TIMEOUT: Duration = Duration::from_secs(10);
const HOME_RETRIES: u32 = 5;
const HOME_RETRY_DELAY: Duration = Duration::from_secs(1);

fn firmware_error(value: &Value) -> ControlError {
    ControlError::Firmware(classify_firmware_response(value))
}

/// Error for a raw-mode text line such as `error: Alarm lock`
fn raw_line_error(line: &str) -> ControlError {
    firmware_error(&json!({"status": "error", "error": [line]}))
}

fn wire(command: &Command) -> Result<String, ControlError> {
    command
        .wire()
        .ok_or_else(|| ControlError::Protocol(format!("{} has no wire form", command.name())))
}

impl Worker {
    pub(crate) async fn dispatch(&mut self, command: Command) -> Result<Reply, ControlError> {
        let line_check = self.shared.state().line_check_enabled;

        match command {
            Command::Report => self.report().await.map(Reply::Report),
            Command::Abort => self.stop_job("play abort", &[code::IDLE, code::ABORTED], true).await,
            Command::Quit => self.stop_job("play quit", &[code::IDLE], false).await,

            ref c @ (Command::Select { .. }
            | Command::Start
            | Command::Pause
            | Command::Resume
            | Command::Restart
            | Command::Kick
            | Command::LsUsb
            | Command::DeleteFile { .. }
            | Command::GetDeviceSetting { .. }
            | Command::SetDeviceSetting { .. }
            | Command::DeleteDeviceSetting { .. }
            | Command::DeviceInfo) => self.wait_any(&wire(c)?).await,

            ref c @ (Command::PlayInfo
            | Command::Ls { .. }
            | Command::FileInfo { .. }
            | Command::GetLaserPower
            | Command::SetLaserPower(_)
            | Command::GetLaserSpeed
            | Command::SetLaserSpeed(_)
            | Command::GetFan
            | Command::SetFan(_)
            | Command::SetOriginX(_)
            | Command::SetOriginY(_)
            | Command::MaintainMove { .. }
            | Command::MaintainHome
            | Command::MaintainCloseFan
            | Command::HeadInfo) => self.wait_ok(&wire(c)?).await,

            Command::EnterMaintainMode => self.enter_mode(Mode::Maintain, "task maintain").await,
            Command::EnterRawMode => self.enter_mode(Mode::Raw, "task raw").await,
            Command::EndMaintainMode | Command::EndRawMode | Command::QuitTask => {
                *self.shared.state() = SessionSnapshot::default();
                info!(uuid = %self.uuid, "Back to normal mode");
                self.wait_any("task quit").await
            }

            Command::Upload {
                data,
                destination,
                progress,
            } => {
                let header = upload_header(data.len(), destination.as_ref())?;
                self.transfer(&header, data, progress).await
            }
            Command::UpdateFirmware { target, data, progress } => {
                self.transfer(&firmware_header(target, data.len()), data, progress).await
            }
            Command::UpdateToolhead { data, progress } => {
                self.transfer(&toolhead_header(data.len()), data, progress).await
            }
            Command::DownloadFile { path, progress } => self.download(&format!("file download {path}"), progress).await,
            Command::DownloadLog { name, progress } => self.download(&format!("fetch_log {name}"), progress).await,

            ref c @ Command::RawHome(_) => self.raw_home(&wire(c)?).await,
            ref c @ Command::RawUnlock => self.raw_wait_ok(&wire(c)?).await,
            ref c @ (Command::RawMove(_)
            | Command::RawSetWaterPump { .. }
            | Command::RawSetAirPump { .. }
            | Command::RawSetFan { .. }
            | Command::RawSetRotary { .. }
            | Command::RawLooseMotor { .. }) => {
                if line_check {
                    self.line_checked(&wire(c)?).await
                } else {
                    self.wait_any(&wire(c)?).await
                }
            }
            ref c @ (Command::RawSetLaser { .. } | Command::RawSetOrigin { .. }) => {
                if line_check {
                    self.line_checked(&wire(c)?).await
                } else {
                    self.raw_wait_ok(&wire(c)?).await
                }
            }
            Command::RawStartLineCheckMode => self.toggle_line_check(true).await,
            Command::RawEndLineCheckMode => self.toggle_line_check(false).await,
            Command::RawStreamGcode { lines, progress, stop } => self.stream(&lines, progress, &stop).await,
        }
    }

    async fn send(&mut self, frame: impl Into<Outgoing>) -> Result<(), ControlError> {
        if self.link.send(frame).await.is_err() {
            self.lost = true;
            return Err(ControlError::Disconnected);
        }
        Ok(())
    }

    /// Next frame before `deadline`; fatal frames end the session
    async fn recv_until(&mut self, command: &str, deadline: Instant) -> Result<Incoming, ControlError> {
        match timeout_at(deadline, self.link.recv()).await {
            Err(_) => Err(ControlError::Timeout {
                command: command.to_string(),
            }),
            Ok(None) => {
                self.lost = true;
                Err(ControlError::Disconnected)
            }
            Ok(Some(Incoming::Fatal(value))) => {
                warn!(uuid = %self.uuid, command, frame = %value, "Fatal frame");
                self.lost = true;
                let classified = classify_firmware_response(&value);
                Err(ControlError::Connection(ConnectionError::from_codes(&classified.error)))
            }
            Ok(Some(frame)) => Ok(frame),
        }
    }

    fn progress_or_default(&self, progress: Option<ProgressFn>) -> Option<ProgressFn> {
        progress.or_else(|| self.shared.progress())
    }

    /// First frame answers the command
    async fn wait_any(&mut self, command: &str) -> Result<Reply, ControlError> {
        self.send(command).await?;
        let deadline = Instant::now() + self.config.command_timeout;

        match self.recv_until(command, deadline).await? {
            Incoming::Error(value) => Err(firmware_error(&value)),
            Incoming::Message(value) => Ok(Reply::Ack(value)),
            Incoming::Text(text) => Ok(Reply::Ack(Value::String(text))),
            Incoming::Binary(_) | Incoming::Fatal(_) => Ok(Reply::Ack(Value::Null)),
        }
    }

    /// Collect frames until `status: ok`
    async fn wait_ok(&mut self, command: &str) -> Result<Reply, ControlError> {
        self.send(command).await?;
        let deadline = Instant::now() + self.config.command_timeout;
        let mut data = Vec::new();

        loop {
            let frame = self.recv_until(command, deadline).await?;
            if let Incoming::Error(value) = &frame {
                return Err(firmware_error(value));
            }
            let done = frame.status() == Some("ok");
            data.push(frame.clone());
            if done {
                let Incoming::Message(response) = frame else {
                    return Err(ControlError::Protocol("ok frame without body".to_string()));
                };
                return Ok(Reply::Collected { data, response });
            }
        }
    }

    async fn report(&mut self) -> Result<Report, ControlError> {
        self.send("play report").await?;
        let deadline = Instant::now() + self.config.report_timeout;
        let mut retries = 0;

        loop {
            match self.recv_until("play report", deadline).await? {
                Incoming::Error(value) => return Err(firmware_error(&value)),
                Incoming::Message(value) if value.get("status").and_then(Value::as_str) == Some("ok") => {
                    return Report::from_response(&value).map_err(|e| ControlError::Protocol(e.to_string()));
                }
                other if retries < REPORT_RETRIES => {
                    retries += 1;
                    debug!(uuid = %self.uuid, retries, frame = ?other, "Retrying report");
                    self.send("play report").await?;
                }
                other => return Err(ControlError::Protocol(format!("unexpected report reply {other:?}"))),
            }
        }
    }

    /// `play abort` / `play quit`, retried until the status settles
    async fn stop_job(&mut self, command: &str, accept: &[i32], is_abort: bool) -> Result<Reply, ControlError> {
        self.send(command).await?;
        let mut deadline = Instant::now() + STOP_TIMEOUT;
        let mut retries = 0;

        loop {
            let (value, is_error) = match self.recv_until(command, deadline).await? {
                Incoming::Message(value) => (value, false),
                Incoming::Error(value) => (value, true),
                _ => continue,
            };
            let st_id = value
                .pointer("/device_status/st_id")
                .and_then(Value::as_i64)
                .map(|id| id as i32);

            if retries >= STOP_RETRIES {
                if !is_error && value.get("cmd").and_then(Value::as_str) == Some("play report") {
                    if st_id == Some(code::IDLE) {
                        return Ok(Reply::Ack(value));
                    }
                    if is_abort && st_id == Some(code::COMPLETED) {
                        self.send("play quit").await?;
                    }
                }
                warn!(uuid = %self.uuid, command, "Gave up after {} retries", STOP_RETRIES);
                return Err(firmware_error(&value));
            }

            if !is_error && st_id.is_some_and(|id| accept.contains(&id)) {
                return Ok(Reply::Ack(value));
            }

            let resend = !is_error && value.get("status").and_then(Value::as_str) != Some("ok");
            retries += 1;
            sleep(self.config.retry_interval).await;
            self.send(if resend { command } else { "play report" }).await?;
            deadline = Instant::now() + STOP_TIMEOUT;
        }
    }

    async fn enter_mode(&mut self, mode: Mode, command: &str) -> Result<Reply, ControlError> {
        let reply = self.wait_any(command).await?;
        if !self.config.mode_settle.is_zero() {
            sleep(self.config.mode_settle).await;
        }
        *self.shared.state() = SessionSnapshot {
            mode,
            ..SessionSnapshot::default()
        };
        info!(uuid = %self.uuid, mode = ?mode, "Entered mode");
        Ok(reply)
    }

    /// Header, `continue`, binary chunks, `uploading` progress, `ok`
    async fn transfer(&mut self, header: &str, data: Bytes, progress: Option<ProgressFn>) -> Result<Reply, ControlError> {
        let progress = self.progress_or_default(progress);
        let total = data.len() as u64;
        self.send(header).await?;

        loop {
            let deadline = Instant::now() + self.config.command_timeout;
            let value = match self.recv_until(header, deadline).await? {
                Incoming::Error(value) => return Err(firmware_error(&value)),
                Incoming::Message(value) => value,
                _ => continue,
            };

            match value.get("status").and_then(Value::as_str) {
                Some("continue") => {
                    for start in (0..data.len()).step_by(CHUNK_SIZE) {
                        let end = (start + CHUNK_SIZE).min(data.len());
                        self.send(Outgoing::Binary(data.slice(start..end))).await?;
                    }
                    trace!(uuid = %self.uuid, bytes = total, "Payload sent");
                }
                Some("uploading") => {
                    let completed = value
                        .get("sent")
                        .or_else(|| value.get("written"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    if let Some(progress) = &progress {
                        progress.call(Progress::new(completed, total));
                    }
                }
                Some("ok") => return Ok(Reply::Ack(value)),
                _ => trace!(uuid = %self.uuid, frame = %value, "Transfer frame"),
            }
        }
    }

    /// Progress frames, a metadata frame, then the binary payload
    async fn download(&mut self, command: &str, progress: Option<ProgressFn>) -> Result<Reply, ControlError> {
        let progress = self.progress_or_default(progress);
        self.send(command).await?;
        let mut metadata = Value::Null;

        loop {
            let deadline = Instant::now() + self.config.command_timeout;
            match self.recv_until(command, deadline).await? {
                Incoming::Binary(data) => return Ok(Reply::Download { metadata, data }),
                Incoming::Error(value) => return Err(firmware_error(&value)),
                Incoming::Message(value) => {
                    let field = |name: &str| value.get(name).and_then(Value::as_u64);
                    let update = match value.get("status").and_then(Value::as_str) {
                        Some("continue") => field("size").map(|size| (size - field("left").unwrap_or(0).min(size), size)),
                        Some("transfer") => field("size").map(|size| (field("completed").unwrap_or(0), size)),
                        _ => {
                            metadata = value.clone();
                            None
                        }
                    };
                    if let (Some((completed, total)), Some(progress)) = (update, &progress) {
                        progress.call(Progress::new(completed, total));
                    }
                }
                _ => {}
            }
        }
    }

    /// Accumulate raw text until a line reads `ok`
    async fn raw_wait_ok(&mut self, command: &str) -> Result<Reply, ControlError> {
        self.send(command).await?;
        let deadline = Instant::now() + self.config.command_timeout;
        let mut raw = RawLines::default();
        let mut text = String::new();

        loop {
            let frame = self.recv_until(command, deadline).await?;
            if let Incoming::Error(value) = &frame {
                return Err(firmware_error(value));
            }
            let Some(chunk) = raw_text(&frame) else {
                continue;
            };
            text.push_str(chunk);
            for line in raw.push_with_pending(chunk) {
                if line.starts_with("error:") {
                    return Err(raw_line_error(&line));
                }
                if line == "ok" {
                    return Ok(Reply::Raw(text));
                }
            }
        }
    }

    /// Send one framed command and wait for its `L<n> 0`
    async fn line_checked(&mut self, command: &str) -> Result<Reply, ControlError> {
        let mut line = self.shared.state().line_number;
        self.send(frame_line(line, command)).await?;
        let mut raw = RawLines::default();
        let mut text = String::new();

        loop {
            let deadline = Instant::now() + self.config.command_timeout;
            let frame = self.recv_until(command, deadline).await?;
            if let Incoming::Error(value) = &frame {
                return Err(firmware_error(value));
            }
            let Some(chunk) = raw_text(&frame) else {
                continue;
            };
            text.push_str(chunk);

            let mut resend = false;
            for response in raw.push(chunk) {
                match parse_line(&response) {
                    Some(LineAck::Ack { line: acked, pending: 0 }) if acked == line => {
                        self.shared.state().line_number = line + 1;
                        return Ok(Reply::Raw(text));
                    }
                    Some(LineAck::Fatal(message)) => return Err(raw_line_error(&message)),
                    Some(LineAck::Rewind(expected)) => {
                        debug!(uuid = %self.uuid, from = line, to = expected, "Line number corrected");
                        line = expected;
                        resend = true;
                    }
                    Some(LineAck::Error(_)) => resend = true,
                    _ => {}
                }
            }

            if resend {
                self.shared.state().line_number = line;
                raw = RawLines::default();
                self.send(frame_line(line, command)).await?;
            }
        }
    }

    /// `$@` enables line-check, `M172` disables it
    async fn toggle_line_check(&mut self, enable: bool) -> Result<Reply, ControlError> {
        let (command, expected) = if enable {
            ("$@", "CTRL LINECHECK_ENABLED")
        } else {
            ("M172", "CTRL LINECHECK_DISABLED")
        };
        let mut retries = 0;

        'attempt: loop {
            self.send(command).await?;
            let deadline = Instant::now() + TOGGLE_TIMEOUT;
            let mut raw = RawLines::default();

            loop {
                let frame = self.recv_until(command, deadline).await?;
                if let Incoming::Error(value) = &frame {
                    return Err(firmware_error(value));
                }
                let Some(chunk) = raw_text(&frame) else {
                    continue;
                };

                for line in raw.push_with_pending(chunk) {
                    if line == expected || line == "ok" {
                        let mut state = self.shared.state();
                        state.line_check_enabled = enable;
                        state.line_number = if enable { 1 } else { 0 };
                        drop(state);
                        info!(uuid = %self.uuid, enable, "Line-check mode toggled");
                        return Ok(Reply::Raw(line));
                    }
                    if line.contains("ER:RESET") || line.starts_with("error:") {
                        if retries >= TOGGLE_RETRIES {
                            return Err(raw_line_error(&line));
                        }
                        retries += 1;
                        sleep(TOGGLE_RETRY_DELAY).await;
                        continue 'attempt;
                    }
                }
            }
        }
    }

    async fn raw_home(&mut self, command: &str) -> Result<Reply, ControlError> {
        let mut retries = 0;

        'attempt: loop {
            self.send(command).await?;
            let mut raw = RawLines::default();

            loop {
                let deadline = Instant::now() + HOME_TIMEOUT;
                let frame = self.recv_until(command, deadline).await?;
                if let Incoming::Error(value) = &frame {
                    return Err(firmware_error(value));
                }
                let Some(chunk) = raw_text(&frame) else {
                    continue;
                };

                for line in raw.push_with_pending(chunk) {
                    if line == "ok" {
                        return Ok(Reply::Raw(line));
                    }
                    if line.contains("ER:RESET") || line.contains("DEBUG: RESET") || line.contains("error:") {
                        if retries > HOME_RETRIES {
                            return Err(raw_line_error(&line));
                        }
                        retries += 1;
                        warn!(uuid = %self.uuid, retries, "Homing failed, retrying");
                        sleep(HOME_RETRY_DELAY).await;
                        continue 'attempt;
                    }
                }
            }
        }
    }

    async fn stream(
        &mut self,
        lines: &[String],
        progress: Option<ProgressFn>,
        stop: &CancellationToken,
    ) -> Result<Reply, ControlError> {
        let snapshot = *self.shared.state();
        if !snapshot.line_check_enabled {
            return Err(ControlError::InvalidArgument("line-check mode is not enabled".to_string()));
        }
        let progress = self.progress_or_default(progress);

        let result = GcodeStreamer::new(&mut self.link, snapshot.line_number)
            .with_idle_timeout(self.config.line_check_idle)
            .run(lines, progress.as_ref(), stop)
            .await;

        match result {
            Ok((outcome, next_line)) => {
                self.shared.state().line_number = next_line;
                Ok(Reply::Stream(outcome))
            }
            Err(ControlError::Disconnected) => {
                self.lost = true;
                Err(ControlError::Disconnected)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::command::{Command, Progress, ProgressFn, RawMove, Reply};
    use crate::linecheck::{frame_line, StreamOutcome};
    use crate::mock::{MockBackend, MockDevice};
    use crate::session::{ControlSession, SessionConfig};
    use beamlink_core::DeviceDescriptor;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn session_for(device: MockDevice) -> (MockBackend, ControlSession) {
        let backend = MockBackend::new();
        let descriptor = DeviceDescriptor::new(device.descriptor.uuid.clone(), "", "fbm1");
        backend.add_device(device);
        let config = SessionConfig {
            mode_settle: Duration::ZERO,
            retry_interval: Duration::from_millis(10),
            ..SessionConfig::default()
        };
        let session = ControlSession::connect(&backend, &descriptor, config).await.unwrap();
        (backend, session)
    }

    async fn raw_line_check(session: &ControlSession) {
        session.add_task(Command::EnterRawMode).await.unwrap();
        session.add_task(Command::RawStartLineCheckMode).await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_polls_until_aborted() {
        let (backend, session) = session_for(MockDevice::new("abc").with_status(16, "RUNNING")).await;

        let reply = session.add_task(Command::Abort).await.unwrap();
        let value = reply.into_value().unwrap();
        assert_eq!(value["device_status"]["st_id"], 128);
        assert_eq!(backend.commands("abc"), vec!["play abort", "play report"]);
    }

    #[tokio::test]
    async fn test_quit_gives_up_after_retries() {
        let device = MockDevice::new("abc")
            .with_status(16, "RUNNING")
            .with_error("play quit", &["OPERATION_ERROR"]);
        let (backend, session) = session_for(device).await;

        assert!(session.add_task(Command::Quit).await.is_err());
        assert_eq!(
            backend.commands("abc"),
            vec!["play quit", "play report", "play report", "play report"]
        );
    }

    #[tokio::test]
    async fn test_wait_ok_collects_listing() {
        let (_backend, session) = session_for(MockDevice::new("abc").with_file("/a.fc", &b"x"[..])).await;

        let (data, response) = session
            .add_task(Command::Ls { path: "/".into() })
            .await
            .unwrap()
            .into_collected()
            .unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(response["files"][0], "/a.fc");
    }

    #[tokio::test]
    async fn test_download_reports_progress() {
        let (_backend, session) = session_for(MockDevice::new("abc").with_file("/a.fc", &b"hello"[..])).await;

        let seen = Arc::new(Mutex::new(Vec::<Progress>::new()));
        let progress = {
            let seen = seen.clone();
            ProgressFn::new(move |p| seen.lock().unwrap().push(p))
        };
        let (metadata, data) = session
            .add_task(Command::DownloadFile {
                path: "/a.fc".into(),
                progress: Some(progress),
            })
            .await
            .unwrap()
            .into_download()
            .unwrap();

        assert_eq!(&data[..], b"hello");
        assert_eq!(metadata["status"], "binary");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.iter().map(|p| p.completed).collect::<Vec<_>>(), vec![0, 5]);
    }

    #[tokio::test]
    async fn test_settings_round_trip_through_device() {
        let (backend, session) = session_for(MockDevice::new("abc")).await;

        session
            .add_task(Command::SetDeviceSetting {
                key: "camera_offset".into(),
                value: "X:1 Y:2 F:1".into(),
            })
            .await
            .unwrap();
        assert_eq!(backend.setting("abc", "camera_offset").as_deref(), Some("X:1 Y:2 F:1"));

        let value = session
            .add_task(Command::GetDeviceSetting { key: "camera_offset".into() })
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value["value"], "X:1 Y:2 F:1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_home_retries_after_reset() {
        let device = MockDevice::new("abc").with_raw_replies("raw home", &["ER:RESET\n", "ok\n"]);
        let (backend, session) = session_for(device).await;
        session.add_task(Command::EnterRawMode).await.unwrap();

        let reply = session
            .add_task(Command::RawHome(crate::command::HomeTarget::Axes))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Raw("ok".to_string()));
        let homes = backend.commands("abc").iter().filter(|c| *c == "raw home").count();
        assert_eq!(homes, 2);
    }

    #[tokio::test]
    async fn test_raw_unlock_rejects_error_line() {
        let device = MockDevice::new("abc").with_raw_replies("$X", &["error: ALARM_LOCK\n"]);
        let (_backend, session) = session_for(device).await;
        session.add_task(Command::EnterRawMode).await.unwrap();

        let err = session.add_task(Command::RawUnlock).await.unwrap_err();
        assert_eq!(err.codes(), ["ALARM_LOCK"]);
    }

    #[tokio::test]
    async fn test_line_check_rewind_resends() {
        let command = "G1F6000X1Y2";
        let device = MockDevice::new("abc").with_raw_replies(&frame_line(1, command), &["ERL5\n"]);
        let (backend, session) = session_for(device).await;
        raw_line_check(&session).await;

        session.add_task(Command::RawMove(RawMove::to(1.0, 2.0))).await.unwrap();
        assert_eq!(session.snapshot().line_number, 6);
        assert_eq!(
            backend.commands("abc").last().map(String::as_str),
            Some(frame_line(5, command).as_str())
        );
    }

    #[tokio::test]
    async fn test_line_check_waits_for_complete_rewind() {
        let command = "G1F6000X1Y2";
        let device = MockDevice::new("abc").with_fragmented_raw_reply(&frame_line(1, command), &["ERL1", "2\n"]);
        let (backend, session) = session_for(device).await;
        raw_line_check(&session).await;

        session.add_task(Command::RawMove(RawMove::to(1.0, 2.0))).await.unwrap();
        assert_eq!(session.snapshot().line_number, 13);
        assert_eq!(
            backend.commands("abc").last().map(String::as_str),
            Some(frame_line(12, command).as_str())
        );
        let first = frame_line(1, command);
        assert_eq!(backend.commands("abc").iter().filter(|c| **c == first).count(), 1);
    }

    #[tokio::test]
    async fn test_stream_requires_line_check() {
        let (_backend, session) = session_for(MockDevice::new("abc")).await;
        session.add_task(Command::EnterRawMode).await.unwrap();

        let result = session
            .add_task(Command::RawStreamGcode {
                lines: vec!["G1X1".into()],
                progress: None,
                stop: CancellationToken::new(),
            })
            .await;
        assert!(matches!(result, Err(crate::error::ControlError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_stream_skips_non_motion_lines() {
        let (backend, session) = session_for(MockDevice::new("abc")).await;
        raw_line_check(&session).await;

        let outcome = session
            .add_task(Command::RawStreamGcode {
                lines: vec!["G1X1".into(), "M3".into(), "G1X2".into()],
                progress: None,
                stop: CancellationToken::new(),
            })
            .await
            .unwrap()
            .into_stream()
            .unwrap();

        assert_eq!(outcome, StreamOutcome::Completed { lines: 2 });
        assert_eq!(session.snapshot().line_number, 3);
        let commands = backend.commands("abc");
        assert_eq!(&commands[commands.len() - 2..], [frame_line(1, "G1X1"), frame_line(2, "G1X2")]);
    }
}
