//! In-memory backend for tests
//!
//! [`MockBackend`] implements [`Connector`] and plays the firmware side of
//! the control, camera, touch and discover sockets, so sessions can be driven
//! end to end without a network.

use async_trait::async_trait;
use beamlink_core::DeviceDescriptor;
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::TransportError;
use crate::transport::{Connector, Incoming, Link, Outgoing, RemoteEnd};

const STREAM_INTERVAL: Duration = Duration::from_millis(20);

/// Scripted behaviour for one device
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub descriptor: DeviceDescriptor,
    password: Option<String>,
    delays: HashMap<String, Duration>,
    errors: HashMap<String, Vec<String>>,
    raw_replies: HashMap<String, Vec<Vec<String>>>,
    files: HashMap<String, Bytes>,
    settings: HashMap<String, String>,
    frames: Vec<Bytes>,
    report: Value,
}

impl MockDevice {
    pub fn new(uuid: &str) -> Self {
        let mut descriptor = DeviceDescriptor::new(uuid, "192.168.1.50", "fbm1").with_version("3.2.0");
        descriptor.name = format!("mock-{uuid}");
        descriptor.serial = format!("SN-{uuid}");
        descriptor.st_label = Some("IDLE".to_string());

        Self {
            descriptor,
            password: None,
            delays: HashMap::new(),
            errors: HashMap::new(),
            raw_replies: HashMap::new(),
            files: HashMap::new(),
            settings: HashMap::new(),
            frames: Vec::new(),
            report: json!({"st_id": 0, "st_label": "IDLE", "error": []}),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.descriptor.model = model.to_string();
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.descriptor.firmware_version = version.to_string();
        self
    }

    pub fn with_ip(mut self, ipaddr: &str) -> Self {
        self.descriptor.ipaddr = ipaddr.to_string();
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self.descriptor.is_password_protected = true;
        self
    }

    /// Hold the reply to `command` for `delay`
    pub fn with_delay(mut self, command: &str, delay: Duration) -> Self {
        self.delays.insert(command.to_string(), delay);
        self
    }

    /// Answer `command` with an error frame carrying `codes`
    pub fn with_error(mut self, command: &str, codes: &[&str]) -> Self {
        self.errors
            .insert(command.to_string(), codes.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Answer successive sends of a raw `command` with these texts; the last repeats
    pub fn with_raw_replies(mut self, command: &str, replies: &[&str]) -> Self {
        self.raw_replies.insert(
            command.to_string(),
            replies.iter().map(|r| vec![r.to_string()]).collect(),
        );
        self
    }

    /// Answer every send of a raw `command` with `fragments`, one frame each
    pub fn with_fragmented_raw_reply(mut self, command: &str, fragments: &[&str]) -> Self {
        let reply = fragments.iter().map(|f| f.to_string()).collect();
        self.raw_replies.insert(command.to_string(), vec![reply]);
        self
    }

    pub fn with_file(mut self, path: &str, data: impl Into<Bytes>) -> Self {
        self.files.insert(path.to_string(), data.into());
        self
    }

    pub fn with_setting(mut self, key: &str, value: &str) -> Self {
        self.settings.insert(key.to_string(), value.to_string());
        self
    }

    /// Camera payloads, served in rotation
    pub fn with_frames(mut self, frames: Vec<Bytes>) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_status(mut self, st_id: i32, st_label: &str) -> Self {
        self.set_status(st_id, st_label, &[]);
        self
    }

    fn set_status(&mut self, st_id: i32, st_label: &str, error: &[&str]) {
        self.report = json!({"st_id": st_id, "st_label": st_label, "error": error});
        self.descriptor.st_id = st_id;
        self.descriptor.st_label = Some(st_label.to_string());
        self.descriptor.error_label = (!error.is_empty()).then(|| error.join("_"));
    }
}

/// A solid PNG of the given size
pub fn png_frame(width: u32, height: u32) -> Bytes {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([40, 40, 40]));
    let mut out = Cursor::new(Vec::new());
    // Encoding into memory cannot fail for a well-formed RGB buffer
    let _ = image.write_to(&mut out, image::ImageFormat::Png);
    Bytes::from(out.into_inner())
}

struct DeviceState {
    device: MockDevice,
    commands: Vec<String>,
    client_key: Option<String>,
    uploaded: Option<usize>,
    authorized: bool,
    sockets: Vec<CancellationToken>,
    frames_served: usize,
    raw_sent: HashMap<String, usize>,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<String, DeviceState>,
    discover: Vec<(mpsc::Sender<Incoming>, CancellationToken)>,
    probes: Vec<Value>,
    opened: Vec<String>,
    offline: bool,
}

/// Per-socket firmware state
#[derive(Default)]
struct ControlEmulator {
    raw: bool,
    upload: Option<(usize, usize)>,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a device and announce it on open discover sockets
    pub fn add_device(&self, device: MockDevice) {
        let announcement = serde_json::to_value(&device.descriptor).unwrap_or(Value::Null);
        let uuid = device.descriptor.uuid.clone();
        self.lock().devices.insert(
            uuid,
            DeviceState {
                device,
                commands: Vec::new(),
                client_key: None,
                uploaded: None,
                authorized: false,
                sockets: Vec::new(),
                frames_served: 0,
                raw_sent: HashMap::new(),
            },
        );
        self.announce(announcement);
    }

    /// Forget a device and announce `alive: false`
    pub fn remove_device(&self, uuid: &str) {
        if let Some(state) = self.lock().devices.remove(uuid) {
            state.sockets.iter().for_each(CancellationToken::cancel);
        }
        self.announce(json!({"uuid": uuid, "alive": false}));
    }

    /// Push a raw discovery message to every discover socket
    pub fn announce(&self, message: Value) {
        let mut inner = self.lock();
        inner.discover.retain(|(tx, cancel)| !cancel.is_cancelled() && !tx.is_closed());
        for (tx, _) in &inner.discover {
            let _ = tx.try_send(Incoming::Message(message.clone()));
        }
    }

    /// Change what `play report` and discovery say about a device
    pub fn set_status(&self, uuid: &str, st_id: i32, st_label: &str, error: &[&str]) {
        let announcement = {
            let mut inner = self.lock();
            let Some(state) = inner.devices.get_mut(uuid) else {
                return;
            };
            state.device.set_status(st_id, st_label, error);
            serde_json::to_value(&state.device.descriptor).unwrap_or(Value::Null)
        };
        self.announce(announcement);
    }

    /// Text commands received after the handshake, in order
    pub fn commands(&self, uuid: &str) -> Vec<String> {
        self.lock()
            .devices
            .get(uuid)
            .map(|s| s.commands.clone())
            .unwrap_or_default()
    }

    pub fn last_client_key(&self, uuid: &str) -> Option<String> {
        self.lock().devices.get(uuid).and_then(|s| s.client_key.clone())
    }

    /// Size of the last completed upload
    pub fn uploaded(&self, uuid: &str) -> Option<usize> {
        self.lock().devices.get(uuid).and_then(|s| s.uploaded)
    }

    pub fn setting(&self, uuid: &str, key: &str) -> Option<String> {
        self.lock()
            .devices
            .get(uuid)
            .and_then(|s| s.device.settings.get(key).cloned())
    }

    pub fn frames_served(&self, uuid: &str) -> usize {
        self.lock().devices.get(uuid).map_or(0, |s| s.frames_served)
    }

    /// Close every socket open to `uuid`, as if the device went away
    pub fn drop_connection(&self, uuid: &str) {
        if let Some(state) = self.lock().devices.get_mut(uuid) {
            state.sockets.drain(..).for_each(|s| s.cancel());
        }
    }

    pub fn drop_discover(&self) {
        for (_, cancel) in self.lock().discover.drain(..) {
            cancel.cancel();
        }
    }

    /// Probe commands received on discover sockets
    pub fn probes(&self) -> Vec<Value> {
        self.lock().probes.clone()
    }

    /// Methods opened so far, e.g. `control/abc`
    pub fn opened(&self) -> Vec<String> {
        self.lock().opened.clone()
    }

    /// Refuse new sockets while offline
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    fn track(&self, uuid: &str, cancel: &CancellationToken) {
        if let Some(state) = self.lock().devices.get_mut(uuid) {
            state.sockets.push(cancel.clone());
        }
    }

    async fn serve_control(self, uuid: String, mut remote: RemoteEnd, cancel: CancellationToken) {
        if !self.admit(&uuid, &mut remote, &cancel).await {
            return;
        }

        let mut emulator = ControlEmulator::default();
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = remote.rx.recv() => frame,
            };
            let replies = match frame {
                None => return,
                Some(Outgoing::Text(command)) => {
                    let delay = {
                        let mut inner = self.lock();
                        let Some(state) = inner.devices.get_mut(&uuid) else {
                            return;
                        };
                        state.commands.push(command.clone());
                        state.device.delays.get(&command).copied()
                    };
                    if let Some(delay) = delay {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    self.control_reply(&uuid, &mut emulator, &command)
                }
                Some(Outgoing::Binary(chunk)) => self.receive_chunk(&uuid, &mut emulator, chunk.len()),
            };
            for reply in replies {
                if remote.tx.send(reply).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Key exchange shared by control and camera sockets
    async fn admit(&self, uuid: &str, remote: &mut RemoteEnd, cancel: &CancellationToken) -> bool {
        let key = tokio::select! {
            _ = cancel.cancelled() => return false,
            frame = remote.rx.recv() => match frame {
                Some(Outgoing::Text(key)) => key,
                _ => return false,
            },
        };

        let verdict = {
            let mut inner = self.lock();
            match inner.devices.get_mut(uuid) {
                None => Err("NOT_FOUND"),
                Some(state) => {
                    state.client_key = Some(key);
                    if state.device.password.is_some() && !state.authorized {
                        Err("AUTH_ERROR")
                    } else {
                        Ok(())
                    }
                }
            }
        };

        let _ = remote.tx.send(Incoming::Message(json!({"status": "connecting"}))).await;
        match verdict {
            Ok(()) => remote
                .tx
                .send(Incoming::Message(json!({"status": "connected"})))
                .await
                .is_ok(),
            Err(code) => {
                let _ = remote
                    .tx
                    .send(Incoming::Error(json!({"status": "error", "error": [code]})))
                    .await;
                false
            }
        }
    }

    fn control_reply(&self, uuid: &str, emulator: &mut ControlEmulator, command: &str) -> Vec<Incoming> {
        let mut inner = self.lock();
        let Some(state) = inner.devices.get_mut(uuid) else {
            return Vec::new();
        };
        let device = &mut state.device;

        if let Some(codes) = device.errors.get(command) {
            return vec![Incoming::Error(json!({"status": "error", "error": codes}))];
        }
        if let Some(replies) = device.raw_replies.get(command) {
            let sent = state.raw_sent.entry(command.to_string()).or_default();
            let texts = replies.get(*sent).or(replies.last()).cloned().unwrap_or_default();
            *sent += 1;
            return texts.iter().map(|text| raw(text)).collect();
        }

        let words: Vec<&str> = command.split_whitespace().collect();
        match words.as_slice() {
            ["play", "report"] => vec![ok(json!({"cmd": command, "device_status": device.report}))],
            ["play", "abort"] => {
                device.set_status(128, "ABORTED", &[]);
                vec![ok(json!({"cmd": command}))]
            }
            ["play", "quit"] => {
                device.set_status(0, "IDLE", &[]);
                vec![ok(json!({"cmd": command}))]
            }
            ["task", "raw"] => {
                emulator.raw = true;
                vec![ok(json!({"task": "raw"}))]
            }
            ["task", "quit"] => {
                emulator.raw = false;
                vec![ok(json!({"task": ""}))]
            }
            ["config", "get", key] => {
                let value = device.settings.get(*key).cloned();
                vec![ok(json!({"key": key, "value": value}))]
            }
            ["config", "set", key, value @ ..] => {
                device.settings.insert(key.to_string(), value.join(" "));
                vec![ok(json!({}))]
            }
            ["config", "del", key] => {
                device.settings.remove(*key);
                vec![ok(json!({}))]
            }
            ["file", "ls", ..] => {
                let files: Vec<&String> = device.files.keys().collect();
                vec![ok(json!({"directories": [], "files": files}))]
            }
            ["file", "download", path] => match device.files.get(*path) {
                Some(data) => {
                    let size = data.len();
                    vec![
                        Incoming::Message(json!({"status": "continue", "size": size, "left": size})),
                        Incoming::Message(json!({"status": "continue", "size": size, "left": 0})),
                        Incoming::Message(json!({"status": "binary", "mimetype": "binary", "size": size})),
                        Incoming::Binary(data.clone()),
                    ]
                }
                None => vec![Incoming::Error(json!({"status": "error", "error": ["NOT_EXIST"]}))],
            },
            ["fetch_log", name] => match device.files.get(*name) {
                Some(data) => {
                    let size = data.len();
                    vec![
                        Incoming::Message(json!({"status": "transfer", "completed": size, "size": size})),
                        Incoming::Message(json!({"status": "binary", "mimetype": "text/plain", "size": size})),
                        Incoming::Binary(data.clone()),
                    ]
                }
                None => vec![Incoming::Error(json!({"status": "error", "error": ["NOT_EXIST"]}))],
            },
            ["file", "upload", .., size]
            | ["upload", _, size, _]
            | ["update_fw", _, size]
            | ["update_mbfw", _, size]
            | ["maintain", "update_hbfw", _, size] => {
                let size = size.parse().unwrap_or(0);
                emulator.upload = Some((size, 0));
                vec![Incoming::Message(json!({"status": "continue"}))]
            }
            ["deviceinfo"] => vec![ok(json!({
                "model": device.descriptor.model,
                "version": device.descriptor.firmware_version,
                "serial": device.descriptor.serial,
            }))],
            ["kick"] => Vec::new(),
            _ if emulator.raw => vec![raw_reply(command)],
            _ => vec![ok(json!({"cmd": command}))],
        }
    }

    fn receive_chunk(&self, uuid: &str, emulator: &mut ControlEmulator, len: usize) -> Vec<Incoming> {
        let Some((size, received)) = emulator.upload.as_mut() else {
            return Vec::new();
        };
        *received += len;
        let mut replies = vec![Incoming::Message(json!({"status": "uploading", "sent": *received}))];
        if *received >= *size {
            let total = *received;
            emulator.upload = None;
            if let Some(state) = self.lock().devices.get_mut(uuid) {
                state.uploaded = Some(total);
            }
            replies.push(ok(json!({})));
        }
        replies
    }

    fn next_frame(&self, uuid: &str) -> Option<Bytes> {
        let mut inner = self.lock();
        let state = inner.devices.get_mut(uuid)?;
        let frame = if state.device.frames.is_empty() {
            png_frame(640, 480)
        } else {
            state.device.frames[state.frames_served % state.device.frames.len()].clone()
        };
        state.frames_served += 1;
        Some(frame)
    }

    async fn serve_camera(self, uuid: String, mut remote: RemoteEnd, cancel: CancellationToken) {
        if !self.admit(&uuid, &mut remote, &cancel).await {
            return;
        }

        let mut streaming = false;
        let mut ticker = tokio::time::interval(STREAM_INTERVAL);
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick(), if streaming => {
                    match self.next_frame(&uuid) {
                        Some(frame) => frame,
                        None => return,
                    }
                }
                request = remote.rx.recv() => match request {
                    None => return,
                    Some(Outgoing::Text(command)) if command == "enable_streaming" => {
                        streaming = true;
                        continue;
                    }
                    Some(Outgoing::Text(command)) if command == "require_frame" => match self.next_frame(&uuid) {
                        Some(frame) => frame,
                        None => return,
                    },
                    Some(other) => {
                        trace!(?other, "Ignoring camera request");
                        continue;
                    }
                },
            };
            if remote.tx.send(Incoming::Binary(frame)).await.is_err() {
                return;
            }
        }
    }

    async fn serve_touch(self, mut remote: RemoteEnd, cancel: CancellationToken) {
        let request = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = remote.rx.recv() => match frame {
                Some(Outgoing::Text(text)) => serde_json::from_str::<Value>(&text).unwrap_or(Value::Null),
                _ => return,
            },
        };
        let uuid = request.get("uuid").and_then(Value::as_str).unwrap_or_default();
        let password = request.get("password").and_then(Value::as_str);

        let reply = {
            let mut inner = self.lock();
            match inner.devices.get_mut(uuid) {
                None => json!({"uuid": uuid, "has_response": false, "reachable": false, "auth": false}),
                Some(state) => {
                    let auth = state.device.password.as_deref().is_none_or(|p| Some(p) == password);
                    state.authorized |= auth;
                    json!({
                        "uuid": uuid,
                        "serial": state.device.descriptor.serial,
                        "name": state.device.descriptor.name,
                        "has_response": true,
                        "reachable": true,
                        "auth": auth,
                    })
                }
            }
        };
        if remote.tx.send(Incoming::Message(reply)).await.is_err() {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = async { while remote.rx.recv().await.is_some() {} } => {}
        }
    }

    async fn serve_discover(self, mut remote: RemoteEnd, cancel: CancellationToken) {
        let current: Vec<Value> = {
            let mut inner = self.lock();
            inner.discover.push((remote.tx.clone(), cancel.clone()));
            inner
                .devices
                .values()
                .filter_map(|s| serde_json::to_value(&s.device.descriptor).ok())
                .collect()
        };
        for announcement in current {
            if remote.tx.send(Incoming::Message(announcement)).await.is_err() {
                return;
            }
        }

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = remote.rx.recv() => frame,
            };
            let Some(Outgoing::Text(text)) = frame else {
                if frame.is_none() {
                    return;
                }
                continue;
            };
            let Ok(probe) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            let ipaddr = probe.get("ipaddr").and_then(Value::as_str).unwrap_or_default().to_string();
            let cmd = probe.get("cmd").and_then(Value::as_str).unwrap_or_default().to_string();

            let found = {
                let mut inner = self.lock();
                inner.probes.push(probe);
                inner
                    .devices
                    .values()
                    .find(|s| s.device.descriptor.ipaddr == ipaddr)
                    .and_then(|s| serde_json::to_value(&s.device.descriptor).ok())
            };
            let reply = match (cmd.as_str(), found) {
                ("testtcp", found) => Some(json!({"cmd": "testtcp", "ipaddr": ipaddr, "status": if found.is_some() { "ok" } else { "error" }})),
                (_, found) => found,
            };
            if let Some(reply) = reply {
                if remote.tx.send(Incoming::Message(reply)).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn ok(mut body: Value) -> Incoming {
    if let Value::Object(map) = &mut body {
        map.insert("status".to_string(), json!("ok"));
    }
    Incoming::Message(body)
}

fn raw(text: &str) -> Incoming {
    Incoming::Message(json!({"status": "raw", "text": text}))
}

/// Firmware answer to a raw-mode command
fn raw_reply(command: &str) -> Incoming {
    match command {
        "$@" => raw("CTRL LINECHECK_ENABLED\n"),
        "M172" => raw("CTRL LINECHECK_DISABLED\n"),
        _ => match framed_line(command) {
            Some(line) => raw(&format!("L{line} 0\n")),
            None => raw("ok\n"),
        },
    }
}

/// Line number of an `N<n> ... *<crc>` frame
fn framed_line(command: &str) -> Option<u32> {
    let rest = command.strip_prefix('N')?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[async_trait]
impl Connector for MockBackend {
    async fn open(&self, method: &str) -> Result<Link, TransportError> {
        if self.lock().offline {
            return Err(TransportError::Connect {
                url: method.to_string(),
                reason: "backend offline".to_string(),
            });
        }

        let (link, remote) = Link::pair();
        let cancel = CancellationToken::new();
        self.lock().opened.push(method.to_string());

        let backend = self.clone();
        match method.split_once('/') {
            None if method == "discover" => {
                tokio::spawn(backend.serve_discover(remote, cancel));
            }
            None if method == "touch" => {
                tokio::spawn(backend.serve_touch(remote, cancel));
            }
            Some((kind @ ("control" | "camera"), target)) => {
                let uuid = target.rsplit('/').next().unwrap_or(target).to_string();
                self.track(&uuid, &cancel);
                if kind == "control" {
                    tokio::spawn(backend.serve_control(uuid, remote, cancel));
                } else {
                    tokio::spawn(backend.serve_camera(uuid, remote, cancel));
                }
            }
            _ => {
                return Err(TransportError::Connect {
                    url: method.to_string(),
                    reason: "unknown method".to_string(),
                })
            }
        }

        Ok(link)
    }
}
