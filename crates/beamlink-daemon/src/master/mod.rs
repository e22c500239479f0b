//! Device registry: one connection record per UUID and the current selection
//!
//! `DeviceMaster` owns every control and camera session. Selecting a device
//! opens (or revalidates) its control session, running the password flow
//! when the backend asks for it. A control session that drops on its own is
//! rebuilt in the same mode, with line-check counters and the camera restored.
//! Records are never removed, so cached credentials survive reconnects.

mod camera;
mod commands;

use beamlink_control::{
    authenticate, CameraConfig, CameraSession, CloseReason, Connector, ControlSession, Mode, SessionConfig,
    SessionSnapshot,
};
use beamlink_core::{ConnectionError, DeviceDescriptor};
use beamlink_discovery::DiscoveryFeed;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::collab::{Notifier, Prompt, SettingsStore};
use crate::error::MasterError;
use crate::notify::{NotificationTracker, RetryPromptGate};

pub use commands::FileInfo;

/// Attempts at the password flow before giving up on a selection
const MAX_AUTH_ROUNDS: u32 = 3;

/// Subscriber id on the discovery feed
const SUBSCRIBER_ID: &str = "device-master";

/// The user-facing side the registry talks to
#[derive(Clone)]
pub struct Collaborators {
    pub prompt: Arc<dyn Prompt>,
    pub notifier: Arc<dyn Notifier>,
    pub settings: Arc<dyn SettingsStore>,
}

#[derive(Debug, Clone, Default)]
pub struct MasterConfig {
    pub session: SessionConfig,
    pub camera: CameraConfig,
}

/// Per-UUID record, kept for the life of the process
struct DeviceConnection {
    info: DeviceDescriptor,
    control: Option<Arc<ControlSession>>,
    camera: Option<Arc<CameraSession>>,
    camera_crop: bool,
    password: Option<String>,
    /// Unknown until `camera_offset` has been read
    camera_needs_flip: Option<bool>,
    /// Firmware error codes from the last report
    errors: Vec<String>,
}

impl DeviceConnection {
    fn new(uuid: &str) -> Self {
        Self {
            info: DeviceDescriptor::new(uuid, "", ""),
            control: None,
            camera: None,
            camera_crop: true,
            password: None,
            camera_needs_flip: None,
            errors: Vec::new(),
        }
    }

    fn display_name(&self) -> &str {
        if self.info.name.is_empty() {
            &self.info.uuid
        } else {
            &self.info.name
        }
    }
}

type Slot = Arc<Mutex<DeviceConnection>>;

pub struct DeviceMaster {
    me: Weak<DeviceMaster>,
    connector: Arc<dyn Connector>,
    feed: Arc<DiscoveryFeed>,
    collab: Collaborators,
    config: MasterConfig,
    connections: StdMutex<HashMap<String, Slot>>,
    current: StdMutex<Option<String>>,
    discovered: StdMutex<Vec<DeviceDescriptor>>,
    notifications: StdMutex<NotificationTracker>,
    retry_gate: StdMutex<RetryPromptGate>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceMaster {
    pub fn new(
        connector: Arc<dyn Connector>,
        feed: Arc<DiscoveryFeed>,
        collab: Collaborators,
        config: MasterConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connector,
            feed,
            collab,
            config,
            connections: StdMutex::new(HashMap::new()),
            current: StdMutex::new(None),
            discovered: StdMutex::new(Vec::new()),
            notifications: StdMutex::new(NotificationTracker::new()),
            retry_gate: StdMutex::new(RetryPromptGate::new()),
        })
    }

    /// Start receiving discovery snapshots
    pub async fn attach(&self) {
        let me = self.me.clone();
        self.feed
            .subscribe(
                SUBSCRIBER_ID,
                Arc::new(move |devices: &[DeviceDescriptor]| {
                    if let Some(master) = me.upgrade() {
                        master.on_discovery(devices);
                    }
                }),
            )
            .await;
    }

    fn on_discovery(&self, devices: &[DeviceDescriptor]) {
        *lock(&self.discovered) = devices.to_vec();

        let notifications = lock(&self.notifications).scan(devices);
        if notifications.is_empty() {
            return;
        }
        let enabled = self.collab.settings.read_setting("notification").as_deref() == Some("1");
        for notification in notifications {
            if notification.notice.is_alert() || enabled {
                self.collab.notifier.notify(&notification.name, &notification.notice.message());
            } else {
                debug!(uuid = %notification.uuid, notice = ?notification.notice, "Notification disabled");
            }
        }
    }

    /// Devices from the latest discovery snapshot
    pub fn available_devices(&self) -> Vec<DeviceDescriptor> {
        lock(&self.discovered).clone()
    }

    fn discovered(&self, uuid: &str) -> Option<DeviceDescriptor> {
        lock(&self.discovered).iter().find(|d| d.uuid == uuid).cloned()
    }

    pub fn feed(&self) -> &Arc<DiscoveryFeed> {
        &self.feed
    }

    pub fn current_uuid(&self) -> Option<String> {
        lock(&self.current).clone()
    }

    fn set_current(&self, uuid: &str) {
        *lock(&self.current) = Some(uuid.to_string());
    }

    fn slot(&self, uuid: &str) -> Slot {
        lock(&self.connections)
            .entry(uuid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceConnection::new(uuid))))
            .clone()
    }

    fn current_slot(&self) -> Result<(String, Slot), MasterError> {
        let uuid = self.current_uuid().ok_or(MasterError::NoDeviceSelected)?;
        let slot = self.slot(&uuid);
        Ok((uuid, slot))
    }

    /// Descriptor of the selected device as last seen
    pub async fn current_device(&self) -> Option<DeviceDescriptor> {
        let (_, slot) = self.current_slot().ok()?;
        let info = slot.lock().await.info.clone();
        Some(info)
    }

    pub async fn current_control_mode(&self) -> Option<Mode> {
        let (_, slot) = self.current_slot().ok()?;
        let conn = slot.lock().await;
        conn.control.as_ref().map(|c| c.mode())
    }

    /// Mode and line-check counters of the selected device's session
    pub async fn control_snapshot(&self) -> Option<SessionSnapshot> {
        let (_, slot) = self.current_slot().ok()?;
        let conn = slot.lock().await;
        conn.control.as_ref().map(|c| c.snapshot())
    }

    /// Make `descriptor` the current device, connecting if needed
    pub async fn select_device(&self, descriptor: &DeviceDescriptor) -> Result<(), ConnectionError> {
        let uuid = descriptor.uuid.clone();
        info!(uuid = %uuid, name = %descriptor.name, "Selecting device");

        if self.current_uuid().as_deref() != Some(uuid.as_str()) {
            self.disconnect_camera().await;
        }

        let slot = self.slot(&uuid);
        let mut conn = slot.lock().await;
        conn.info = descriptor.clone();

        if let Some(control) = conn.control.take() {
            if control.is_connected() {
                let refreshed = if control.mode() == Mode::Raw {
                    Ok(None)
                } else {
                    control.report().await.map(Some)
                };
                match refreshed {
                    Ok(report) => {
                        if let Some(report) = report {
                            conn.info
                                .apply_status(report.st_id, Some(report.st_label.clone()), report.error_label());
                        }
                        conn.control = Some(control);
                        self.set_current(&uuid);
                        debug!(uuid = %uuid, "Reusing control session");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(uuid = %uuid, error = %e, "Existing session is unresponsive, reconnecting");
                        control.kill();
                    }
                }
            } else {
                control.close();
            }
        }

        let session = self.open_control(&mut conn).await.map_err(|e| {
            error!(uuid = %uuid, error = %e, "Failed to select device");
            e
        })?;
        self.install(&mut conn, session);
        self.set_current(&uuid);
        info!(uuid = %uuid, "Device selected");
        Ok(())
    }

    /// Drop the current device's session and select it again
    pub async fn reconnect(&self) -> Result<(), MasterError> {
        let (uuid, slot) = self.current_slot()?;
        let info = {
            let mut conn = slot.lock().await;
            if let Some(control) = conn.control.take() {
                control.kill();
            }
            conn.info.clone()
        };
        let info = self.discovered(&uuid).unwrap_or(info);
        info!(uuid = %uuid, "Reconnecting");
        self.select_device(&info).await?;
        Ok(())
    }

    /// Close the current device's sessions and clear the selection
    pub async fn close_connection(&self) {
        let Ok((uuid, slot)) = self.current_slot() else {
            return;
        };
        let mut conn = slot.lock().await;
        if let Some(control) = conn.control.take() {
            control.close();
        }
        if let Some(camera) = conn.camera.take() {
            camera.close();
        }
        *lock(&self.current) = None;
        info!(uuid = %uuid, "Connection closed");
    }

    /// Live control session of the current device, reconnecting when there is none
    pub async fn get_control(&self) -> Result<Arc<ControlSession>, MasterError> {
        let (uuid, slot) = self.current_slot()?;

        let stale = {
            let conn = slot.lock().await;
            match &conn.control {
                Some(control) if control.is_connected() => return Ok(control.clone()),
                other => other.clone(),
            }
        };

        match stale {
            Some(lost) => {
                let mut conn = slot.lock().await;
                let still_lost = conn.control.as_ref().is_some_and(|c| Arc::ptr_eq(c, &lost));
                if still_lost {
                    self.restore_connection(&mut conn, lost.snapshot()).await?;
                }
            }
            None => self.reconnect().await?,
        }

        let conn = slot.lock().await;
        conn.control.clone().ok_or_else(|| {
            warn!(uuid = %uuid, "No control session after reconnect");
            MasterError::Connection(ConnectionError::Disconnected)
        })
    }

    /// Open a control session, authenticating through `touch` when refused
    async fn open_control(&self, conn: &mut DeviceConnection) -> Result<ControlSession, ConnectionError> {
        let mut rounds = 0;
        loop {
            let refused = match ControlSession::connect(self.connector.as_ref(), &conn.info, self.config.session.clone()).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_auth() && rounds < MAX_AUTH_ROUNDS => e,
                Err(e) => return Err(e),
            };
            rounds += 1;

            let password = match conn.password.take() {
                Some(cached) if rounds == 1 => cached,
                _ if rounds == 1 && !conn.info.is_password_protected => String::new(),
                _ => {
                    let caption = format!("Password for {}", conn.display_name());
                    match self.collab.prompt.password(&caption).await {
                        Some(password) => password,
                        None => {
                            info!(uuid = %conn.info.uuid, "Password prompt cancelled");
                            return Err(refused);
                        }
                    }
                }
            };

            let result = authenticate(self.connector.as_ref(), &conn.info.uuid, &password, &self.config.session.client_key).await?;
            if result.is_success() {
                debug!(uuid = %conn.info.uuid, "Authenticated");
                conn.password = (!password.is_empty()).then_some(password);
                continue;
            }

            warn!(uuid = %conn.info.uuid, reachable = result.reachable, "Authentication failed");
            conn.info.is_password_protected = true;
            let message = if result.reachable {
                "Authentication failed"
            } else {
                "Unable to connect to the machine"
            };
            self.collab.notifier.notify(conn.display_name(), message);
        }
    }

    /// Store `session` on the record and watch it for unexpected closes
    fn install(&self, conn: &mut DeviceConnection, session: ControlSession) {
        let session = Arc::new(session);
        conn.control = Some(session.clone());

        let me = self.me.clone();
        let uuid = conn.info.uuid.clone();
        tokio::spawn(async move {
            let event = session.closed().await;
            if event.reason != CloseReason::Lost {
                return;
            }
            if let Some(master) = me.upgrade() {
                master.recover(&uuid, &session, event.snapshot).await;
            }
        });
    }

    async fn recover(&self, uuid: &str, lost: &Arc<ControlSession>, snapshot: SessionSnapshot) {
        let slot = self.slot(uuid);
        let mut conn = slot.lock().await;
        if !conn.control.as_ref().is_some_and(|c| Arc::ptr_eq(c, lost)) {
            return;
        }
        warn!(uuid, mode = ?snapshot.mode, "Control session lost, reconnecting");
        let restored = self.restore_connection(&mut conn, snapshot).await;
        if let Err(e) = restored {
            error!(uuid, error = %e, "Reconnect failed");
            if let Some(camera) = conn.camera.take() {
                camera.close();
            }
            conn.control = None;
            {
                let mut current = lock(&self.current);
                if current.as_deref() == Some(uuid) {
                    *current = None;
                }
            }
            let message = match &e {
                MasterError::Connection(cause) => self.connection_error_message(uuid, cause),
                other => other.to_string(),
            };
            self.collab.notifier.notify(conn.display_name(), &message);
        }
    }

    /// Replace the record's session with a fresh one in the same state
    async fn restore_connection(&self, conn: &mut DeviceConnection, snapshot: SessionSnapshot) -> Result<(), MasterError> {
        if let Some(old) = conn.control.take() {
            old.close();
        }
        let had_camera = conn.camera.take().map(|camera| camera.close()).is_some();

        let session = self.open_control(conn).await?;
        if let Err(e) = session.restore(snapshot).await {
            session.close();
            return Err(e.into());
        }
        self.install(conn, session);

        if had_camera {
            match self.open_camera(conn).await {
                Ok(camera) => conn.camera = Some(Arc::new(camera)),
                Err(e) => warn!(uuid = %conn.info.uuid, error = %e, "Camera did not come back"),
            }
        }
        info!(uuid = %conn.info.uuid, mode = ?snapshot.mode, "Reconnected");
        Ok(())
    }

    /// User-facing message for a failed selection
    pub fn connection_error_message(&self, uuid: &str, error: &ConnectionError) -> String {
        match error {
            ConnectionError::Timeout => "connectionTimeout".to_string(),
            ConnectionError::NotFound => "unable_to_find_machine".to_string(),
            ConnectionError::Disconnected if self.discovered(uuid).is_some() => "#892 disconnected".to_string(),
            ConnectionError::Disconnected => "#891 disconnected".to_string(),
            ConnectionError::UnknownDevice => "unknown_device".to_string(),
            other => format!("unknown_error {}", other.code()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use beamlink_control::mock::{MockBackend, MockDevice};
    use beamlink_discovery::FeedConfig;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Answers password prompts from a script; `None` means cancel
    #[derive(Default)]
    pub(crate) struct ScriptedPrompt {
        passwords: StdMutex<VecDeque<Option<String>>>,
        pub(crate) asked: StdMutex<Vec<String>>,
        retry: bool,
    }

    impl ScriptedPrompt {
        pub(crate) fn answering(answers: &[Option<&str>]) -> Self {
            Self {
                passwords: StdMutex::new(answers.iter().map(|a| a.map(str::to_string)).collect()),
                ..Self::default()
            }
        }

        pub(crate) fn retrying() -> Self {
            Self {
                retry: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Prompt for ScriptedPrompt {
        async fn password(&self, caption: &str) -> Option<String> {
            lock(&self.asked).push(caption.to_string());
            lock(&self.passwords).pop_front().flatten()
        }

        async fn confirm_retry(&self, caption: &str) -> bool {
            lock(&self.asked).push(caption.to_string());
            self.retry
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingNotifier(pub(crate) StdMutex<Vec<(String, String)>>);

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, message: &str) {
            lock(&self.0).push((title.to_string(), message.to_string()));
        }
    }

    pub(crate) struct FixedSettings(pub(crate) Option<&'static str>);

    impl SettingsStore for FixedSettings {
        fn read_setting(&self, key: &str) -> Option<String> {
            (key == "notification").then(|| self.0.map(str::to_string)).flatten()
        }
    }

    pub(crate) struct Harness {
        pub(crate) backend: MockBackend,
        pub(crate) master: Arc<DeviceMaster>,
        pub(crate) prompt: Arc<ScriptedPrompt>,
        pub(crate) notifier: Arc<RecordingNotifier>,
    }

    pub(crate) fn harness_with(backend: MockBackend, prompt: ScriptedPrompt) -> Harness {
        let prompt = Arc::new(prompt);
        let notifier = Arc::new(RecordingNotifier::default());
        let collab = Collaborators {
            prompt: prompt.clone(),
            notifier: notifier.clone(),
            settings: Arc::new(FixedSettings(Some("1"))),
        };
        let config = MasterConfig {
            session: SessionConfig {
                client_key: "desk".to_string(),
                mode_settle: Duration::from_millis(10),
                retry_interval: Duration::from_millis(10),
                ..SessionConfig::default()
            },
            camera: CameraConfig::default(),
        };
        let feed = Arc::new(DiscoveryFeed::new(FeedConfig::default()));
        let master = DeviceMaster::new(Arc::new(backend.clone()), feed, collab, config);
        Harness {
            backend,
            master,
            prompt,
            notifier,
        }
    }

    pub(crate) fn harness(devices: Vec<MockDevice>) -> Harness {
        let backend = MockBackend::new();
        for device in devices {
            backend.add_device(device);
        }
        harness_with(backend, ScriptedPrompt::default())
    }

    pub(crate) fn descriptor(uuid: &str) -> DeviceDescriptor {
        MockDevice::new(uuid).descriptor
    }

    fn protected(uuid: &str) -> DeviceDescriptor {
        descriptor(uuid).with_password(true)
    }

    pub(crate) async fn selected(devices: Vec<MockDevice>) -> Harness {
        let device = devices[0].descriptor.clone();
        let h = harness(devices);
        h.master.select_device(&device).await.unwrap();
        h
    }

    fn count(commands: &[String], wanted: &str) -> usize {
        commands.iter().filter(|c| *c == wanted).count()
    }

    #[tokio::test]
    async fn test_select_then_report() {
        let h = harness(vec![MockDevice::new("abc").with_status(128, "ABORTING")]);
        h.master.select_device(&descriptor("abc")).await.unwrap();
        assert_eq!(h.master.current_uuid().as_deref(), Some("abc"));

        let report = h.master.get_report().await.unwrap();
        assert_eq!(report.st_id, 128);
        assert_eq!(report.st_label, "ABORTED");
        assert_eq!(h.backend.last_client_key("abc").as_deref(), Some("desk"));
    }

    #[tokio::test]
    async fn test_select_is_idempotent() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        h.master.select_device(&descriptor("abc")).await.unwrap();

        assert_eq!(h.backend.opened(), vec!["control/abc"]);
        assert_eq!(count(&h.backend.commands("abc"), "play report"), 1);
    }

    #[tokio::test]
    async fn test_select_unknown_device() {
        let h = harness(vec![]);
        let err = h.master.select_device(&descriptor("ghost")).await.unwrap_err();
        assert_eq!(err, ConnectionError::NotFound);
        assert_eq!(h.master.current_uuid(), None);
        assert_eq!(h.master.connection_error_message("ghost", &err), "unable_to_find_machine");
    }

    #[tokio::test]
    async fn test_commands_need_a_selection() {
        let h = harness(vec![MockDevice::new("abc")]);
        assert_eq!(h.master.pause().await.unwrap_err(), MasterError::NoDeviceSelected);
        assert_eq!(h.master.get_report().await.unwrap_err(), MasterError::NoDeviceSelected);
        assert_eq!(h.master.reconnect().await.unwrap_err(), MasterError::NoDeviceSelected);
    }

    #[tokio::test]
    async fn test_protected_device_prompts() {
        let backend = MockBackend::new();
        backend.add_device(MockDevice::new("abc").with_password("secret"));
        let h = harness_with(backend, ScriptedPrompt::answering(&[Some("secret")]));

        h.master.select_device(&protected("abc")).await.unwrap();
        assert_eq!(lock(&h.prompt.asked).len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_prompt_ends_selection() {
        let backend = MockBackend::new();
        backend.add_device(MockDevice::new("abc").with_password("secret"));
        let h = harness_with(backend, ScriptedPrompt::answering(&[Some("wrong"), None]));

        let err = h.master.select_device(&protected("abc")).await.unwrap_err();
        assert_eq!(err, ConnectionError::AuthError);
        assert_eq!(lock(&h.prompt.asked).len(), 2);
        assert_eq!(lock(&h.notifier.0).len(), 1);
    }

    #[tokio::test]
    async fn test_unflagged_device_tries_blank_password_first() {
        let backend = MockBackend::new();
        backend.add_device(MockDevice::new("abc").with_password("secret"));
        let h = harness_with(backend, ScriptedPrompt::answering(&[Some("secret")]));

        let unflagged = DeviceDescriptor::new("abc", "192.168.1.50", "fbm1");
        h.master.select_device(&unflagged).await.unwrap();
        assert_eq!(lock(&h.prompt.asked).len(), 1);
        assert_eq!(h.backend.opened().iter().filter(|m| *m == "touch").count(), 2);
    }

    #[tokio::test]
    async fn test_auth_rounds_are_bounded() {
        let backend = MockBackend::new();
        backend.add_device(MockDevice::new("abc").with_password("secret"));
        let h = harness_with(backend, ScriptedPrompt::answering(&[Some("a"), Some("b"), Some("c"), Some("d")]));

        let err = h.master.select_device(&protected("abc")).await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(lock(&h.prompt.asked).len(), MAX_AUTH_ROUNDS as usize);
    }

    #[tokio::test]
    async fn test_reconnect_reuses_cached_password() {
        let backend = MockBackend::new();
        backend.add_device(MockDevice::new("abc").with_password("secret"));
        let h = harness_with(backend, ScriptedPrompt::answering(&[Some("secret")]));
        h.master.select_device(&descriptor("abc")).await.unwrap();

        h.master.reconnect().await.unwrap();
        assert_eq!(lock(&h.prompt.asked).len(), 1);
        // Each connect is refused once, then accepted after touch
        assert_eq!(h.backend.opened().iter().filter(|m| *m == "control/abc").count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_comes_back_in_raw_mode() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        h.master.enter_raw_mode().await.unwrap();
        h.master.raw_start_line_check_mode().await.unwrap();
        for x in [1.0, 2.0, 3.0] {
            h.master.raw_move(beamlink_control::RawMove::to(x, 0.0)).await.unwrap();
        }
        let before = h.master.control_snapshot().await.unwrap();
        assert!(before.line_check_enabled);
        assert_eq!(before.line_number, 4);

        h.backend.drop_connection("abc");
        tokio::time::sleep(Duration::from_secs(1)).await;

        let after = h.master.control_snapshot().await.unwrap();
        assert_eq!(after, SessionSnapshot { mode: Mode::Raw, ..before });
        assert_eq!(count(&h.backend.commands("abc"), "task raw"), 2);
        assert_eq!(h.backend.opened(), vec!["control/abc", "control/abc"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recovery_drops_selection() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        h.master.enter_raw_mode().await.unwrap();

        h.backend.set_offline(true);
        h.backend.drop_connection("abc");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.master.current_uuid(), None);
        assert!(h.master.slot("abc").lock().await.control.is_none());
        assert_eq!(
            *lock(&h.notifier.0),
            vec![("mock-abc".to_string(), "#891 disconnected".to_string())]
        );

        h.backend.set_offline(false);
        assert_eq!(
            h.master.raw_move(beamlink_control::RawMove::to(1.0, 0.0)).await.unwrap_err(),
            MasterError::NoDeviceSelected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_close_does_not_reconnect() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        h.master.close_connection().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.backend.opened(), vec!["control/abc"]);
        assert_eq!(h.master.current_uuid(), None);
    }

    #[tokio::test]
    async fn test_get_control_reconnects_missing_session() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        {
            let slot = h.master.slot("abc");
            let mut conn = slot.lock().await;
            if let Some(control) = conn.control.take() {
                control.close();
            }
        }

        h.master.get_report().await.unwrap();
        assert_eq!(h.backend.opened().len(), 2);
    }

    #[tokio::test]
    async fn test_discovery_notifications() {
        let h = harness(vec![]);
        let mut device = descriptor("abc");
        device.apply_status(16, None, None);
        h.master.on_discovery(&[device.clone()]);
        device.apply_status(64, None, None);
        h.master.on_discovery(&[device.clone()]);
        h.master.on_discovery(&[device]);

        assert_eq!(
            *lock(&h.notifier.0),
            vec![("mock-abc".to_string(), "Job completed".to_string())]
        );
        assert_eq!(h.master.available_devices().len(), 1);
    }

    #[test]
    fn test_connection_error_messages() {
        let h = harness(vec![]);
        h.master.on_discovery(&[descriptor("seen")]);
        let msg = |uuid: &str, e: ConnectionError| h.master.connection_error_message(uuid, &e);

        assert_eq!(msg("x", ConnectionError::Timeout), "connectionTimeout");
        assert_eq!(msg("x", ConnectionError::Disconnected), "#891 disconnected");
        assert_eq!(msg("seen", ConnectionError::Disconnected), "#892 disconnected");
        assert_eq!(msg("x", ConnectionError::UnknownDevice), "unknown_device");
        assert_eq!(msg("x", ConnectionError::ResourceBusy), "unknown_error RESOURCE_BUSY");
    }
}
