//! Control session: one serialized command channel per device
//!
//! Commands are queued as tasks and executed by a single worker that owns
//! the socket, so at most one request is outstanding and replies come back
//! in submission order. A failed task does not affect the ones after it.
//! When the socket goes away every task still waiting in the queue is
//! rejected with [`ControlError::Disconnected`].

use beamlink_core::{classify_firmware_response, ConnectionError, DeviceDescriptor, Report};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::command::{Command, Mode, ProgressFn, Reply};
use crate::error::ControlError;
use crate::transport::{Connector, Endpoint, Incoming, Link};

/// Timeouts and limits for a control session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identity sent as the first frame on every socket
    pub client_key: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub report_timeout: Duration,
    /// Pause after `task maintain` / `task raw` before the mode is usable
    pub mode_settle: Duration,
    /// Delay between abort/quit retries
    pub retry_interval: Duration,
    /// Line-check streams give up after this long without an acknowledgement
    pub line_check_idle: Duration,
    pub max_task_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_key: String::new(),
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            report_timeout: Duration::from_secs(3),
            mode_settle: Duration::from_secs(3),
            retry_interval: Duration::from_secs(2),
            line_check_idle: crate::linecheck::DEFAULT_IDLE_TIMEOUT,
            max_task_queue: 30,
        }
    }
}

/// Mode and line-check counters, as needed to rebuild a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionSnapshot {
    pub mode: Mode,
    pub line_check_enabled: bool,
    pub line_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `close()` or `kill()` was called
    Requested,
    /// The socket dropped or the backend reported a fatal error
    Lost,
}

/// Published once when a session ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CloseEvent {
    pub reason: CloseReason,
    pub snapshot: SessionSnapshot,
}

struct Task {
    command: Command,
    reply: oneshot::Sender<Result<Reply, ControlError>>,
}

pub(crate) struct Shared {
    state: Mutex<SessionSnapshot>,
    progress: Mutex<Option<ProgressFn>>,
    connected: AtomicBool,
    kick_on_close: AtomicBool,
}

impl Shared {
    pub(crate) fn state(&self) -> MutexGuard<'_, SessionSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn progress(&self) -> Option<ProgressFn> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Handle to a live control session
pub struct ControlSession {
    uuid: String,
    queue: mpsc::Sender<Task>,
    shared: Arc<Shared>,
    closed: watch::Receiver<Option<CloseEvent>>,
    shutdown: CancellationToken,
    max_task_queue: usize,
}

impl ControlSession {
    /// Open the control socket for `device` and complete the handshake
    pub async fn connect(
        connector: &dyn Connector,
        device: &DeviceDescriptor,
        config: SessionConfig,
    ) -> Result<Self, ConnectionError> {
        let method = Endpoint::control(device);
        let mut link = connector.open(&method).await.map_err(|e| {
            warn!(uuid = %device.uuid, error = %e, "Failed to open control socket");
            ConnectionError::Disconnected
        })?;

        handshake(&mut link, &config.client_key, config.connect_timeout).await?;
        info!(uuid = %device.uuid, "Control session connected");

        Ok(Self::spawn(device.uuid.clone(), link, config))
    }

    /// Start the worker on an already authenticated link
    pub(crate) fn spawn(uuid: String, link: Link, config: SessionConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.max_task_queue.max(1));
        let (closed_tx, closed_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionSnapshot::default()),
            progress: Mutex::new(None),
            connected: AtomicBool::new(true),
            kick_on_close: AtomicBool::new(false),
        });

        let max_task_queue = config.max_task_queue;
        let worker = Worker {
            uuid: uuid.clone(),
            link,
            shared: shared.clone(),
            config,
            lost: false,
        };
        tokio::spawn(worker.run(queue_rx, shutdown.clone(), closed_tx));

        Self {
            uuid,
            queue: queue_tx,
            shared,
            closed: closed_rx,
            shutdown,
            max_task_queue,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        *self.shared.state()
    }

    pub fn mode(&self) -> Mode {
        self.snapshot().mode
    }

    /// Default progress callback for transfers that don't bring their own
    pub fn set_progress_listener(&self, listener: Option<ProgressFn>) {
        *self.shared.progress.lock().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    /// Queue a command and wait for its reply
    pub async fn add_task(&self, command: Command) -> Result<Reply, ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let name = command.name();
        self.queue
            .try_send(Task {
                command,
                reply: reply_tx,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(uuid = %self.uuid, command = name, "Task queue full");
                    ControlError::QueueFull(self.max_task_queue)
                }
                mpsc::error::TrySendError::Closed(_) => ControlError::Disconnected,
            })?;

        reply_rx.await.map_err(|_| ControlError::Disconnected)?
    }

    pub async fn report(&self) -> Result<Report, ControlError> {
        self.add_task(Command::Report).await?.into_report()
    }

    /// Bring a fresh session back to the mode a previous one was in
    pub async fn restore(&self, snapshot: SessionSnapshot) -> Result<(), ControlError> {
        match snapshot.mode {
            Mode::Normal => {}
            Mode::Maintain => {
                self.add_task(Command::EnterMaintainMode).await?;
            }
            Mode::Raw => {
                self.add_task(Command::EnterRawMode).await?;
                let mut state = self.shared.state();
                state.line_check_enabled = snapshot.line_check_enabled;
                state.line_number = snapshot.line_number;
            }
        }
        info!(uuid = %self.uuid, mode = ?snapshot.mode, line = snapshot.line_number, "Session state restored");
        Ok(())
    }

    /// Resolves once, when the session ends
    pub async fn closed(&self) -> CloseEvent {
        let mut rx = self.closed.clone();
        loop {
            if let Some(event) = *rx.borrow_and_update() {
                return event;
            }
            if rx.changed().await.is_err() {
                return CloseEvent {
                    reason: CloseReason::Lost,
                    snapshot: self.snapshot(),
                };
            }
        }
    }

    /// Close the socket without telling the device
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Send `kick` so the device drops our task, then close
    pub fn kill(&self) {
        self.shared.kick_on_close.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Send the client key and wait for `connected`
pub(crate) async fn handshake(link: &mut Link, client_key: &str, connect_timeout: Duration) -> Result<(), ConnectionError> {
    link.send(client_key).await.map_err(|_| ConnectionError::Disconnected)?;

    let mut deadline = Instant::now() + connect_timeout;
    loop {
        let frame = timeout_at(deadline, link.recv())
            .await
            .map_err(|_| ConnectionError::Timeout)?;

        match frame {
            None => return Err(ConnectionError::Disconnected),
            Some(Incoming::Error(value)) | Some(Incoming::Fatal(value)) => {
                let classified = classify_firmware_response(&value);
                return Err(ConnectionError::from_codes(&classified.error));
            }
            Some(frame) => match frame.status() {
                Some("connecting") => {
                    debug!("Backend is connecting to device");
                    deadline = Instant::now() + connect_timeout;
                }
                Some("connected") => return Ok(()),
                _ => trace!(?frame, "Handshake frame"),
            },
        }
    }
}

/// Owns the link and executes tasks one at a time
pub(crate) struct Worker {
    pub(crate) uuid: String,
    pub(crate) link: Link,
    pub(crate) shared: Arc<Shared>,
    pub(crate) config: SessionConfig,
    /// Set when the socket is known to be unusable
    pub(crate) lost: bool,
}

impl Worker {
    async fn run(
        mut self,
        mut queue: mpsc::Receiver<Task>,
        shutdown: CancellationToken,
        closed: watch::Sender<Option<CloseEvent>>,
    ) {
        let reason = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break CloseReason::Requested,
                task = queue.recv() => {
                    let Some(task) = task else {
                        break CloseReason::Requested;
                    };
                    let name = task.command.name();
                    trace!(uuid = %self.uuid, command = name, "Executing task");

                    let result = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => Err(ControlError::Disconnected),
                        result = self.execute(task.command) => result,
                    };
                    if let Err(e) = &result {
                        debug!(uuid = %self.uuid, command = name, error = %e, "Task failed");
                    }
                    let _ = task.reply.send(result);

                    if shutdown.is_cancelled() {
                        break CloseReason::Requested;
                    }
                    if self.lost {
                        break CloseReason::Lost;
                    }
                }
                frame = self.link.recv() => match frame {
                    None => break CloseReason::Lost,
                    Some(Incoming::Fatal(value)) => {
                        warn!(uuid = %self.uuid, frame = %value, "Fatal frame while idle");
                        break CloseReason::Lost;
                    }
                    Some(frame) => trace!(uuid = %self.uuid, ?frame, "Unsolicited frame"),
                },
            }
        };

        self.shared.connected.store(false, Ordering::SeqCst);

        queue.close();
        let mut rejected = 0;
        while let Ok(task) = queue.try_recv() {
            let _ = task.reply.send(Err(ControlError::Disconnected));
            rejected += 1;
        }

        if reason == CloseReason::Requested && self.shared.kick_on_close.load(Ordering::SeqCst) {
            let _ = self.link.send("kick").await;
        }

        let snapshot = *self.shared.state();
        info!(uuid = %self.uuid, reason = ?reason, rejected, "Control session closed");
        self.link.close();
        closed.send_replace(Some(CloseEvent { reason, snapshot }));
    }

    pub(crate) fn mode(&self) -> Mode {
        self.shared.state().mode
    }

    async fn execute(&mut self, command: Command) -> Result<Reply, ControlError> {
        if let Some(expected) = command.required_mode() {
            let actual = self.mode();
            if actual != expected {
                return Err(ControlError::ModeMismatch { expected, actual });
            }
        }
        self.dispatch(command).await
    }
}
