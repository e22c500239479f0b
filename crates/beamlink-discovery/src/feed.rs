//! Discovery feed: latest descriptor per UUID, debounced delivery

use beamlink_core::DeviceDescriptor;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::DiscoveryError;
use crate::link::{Probe, ReconnectConfig};

const PROBE_QUEUE: usize = 64;
const TEST_TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback receiving the full device list on every delivery
pub type Subscriber = Arc<dyn Fn(&[DeviceDescriptor]) + Send + Sync>;

/// Feed configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Minimum spacing between deliveries
    pub buffer: Duration,
    /// Deliver the current snapshot at least this often
    pub redeliver: Duration,
    /// Addresses poked on every interval, for devices broadcast can't reach
    pub poke_ips: Vec<String>,
    pub poke_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            buffer: Duration::from_millis(100),
            redeliver: Duration::from_secs(5),
            poke_ips: Vec::new(),
            poke_interval: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Live set of discovered devices
pub struct DiscoveryFeed {
    pub(crate) config: FeedConfig,
    devices: RwLock<HashMap<String, DeviceDescriptor>>,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    changes: watch::Sender<u64>,
    snapshots: broadcast::Sender<Vec<DeviceDescriptor>>,
    probes: mpsc::Sender<Probe>,
    pub(crate) probe_rx: Mutex<Option<mpsc::Receiver<Probe>>>,
    tcp_tests: Mutex<HashMap<IpAddr, Vec<oneshot::Sender<bool>>>>,
}

impl DiscoveryFeed {
    pub fn new(config: FeedConfig) -> Self {
        let (changes, _) = watch::channel(0);
        let (snapshots, _) = broadcast::channel(100);
        let (probes, probe_rx) = mpsc::channel(PROBE_QUEUE);
        Self {
            config,
            devices: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            changes,
            snapshots,
            probes,
            probe_rx: Mutex::new(Some(probe_rx)),
            tcp_tests: Mutex::new(HashMap::new()),
        }
    }

    fn tcp_tests(&self) -> MutexGuard<'_, HashMap<IpAddr, Vec<oneshot::Sender<bool>>>> {
        self.tcp_tests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_changed(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Apply one inbound discovery message
    pub async fn ingest(&self, message: &Value) {
        if message.get("cmd").and_then(Value::as_str) == Some("testtcp") {
            self.resolve_tcp_test(message);
            return;
        }

        let mut device: DeviceDescriptor = match serde_json::from_value(message.clone()) {
            Ok(device) => device,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed discovery message");
                return;
            }
        };
        device.normalize();
        if device.uuid.is_empty() {
            trace!(message = %message, "Discovery message without uuid");
            return;
        }

        let mut devices = self.devices.write().await;
        if !device.alive {
            if devices.remove(&device.uuid).is_some() {
                info!(uuid = %device.uuid, "Device gone");
            }
        } else {
            device.last_seen = Some(Utc::now());
            if !devices.contains_key(&device.uuid) {
                info!(uuid = %device.uuid, name = %device.name, ip = %device.ipaddr, "Device discovered");
            }
            devices.insert(device.uuid.clone(), device);
        }
        drop(devices);

        self.mark_changed();
    }

    fn resolve_tcp_test(&self, message: &Value) {
        let Some(ip) = message
            .get("ipaddr")
            .and_then(Value::as_str)
            .and_then(|ip| ip.parse::<IpAddr>().ok())
        else {
            return;
        };
        let reachable = message.get("status").and_then(Value::as_str) == Some("ok");
        info!(%ip, reachable, "TCP test finished");
        for waiter in self.tcp_tests().remove(&ip).unwrap_or_default() {
            let _ = waiter.send(reachable);
        }
    }

    /// Register `callback` under `id`, replacing any previous one.
    /// The subscriber receives the current list on the next delivery.
    pub async fn subscribe(&self, id: &str, callback: Subscriber) {
        self.subscribers.write().await.insert(id.to_string(), callback);
        debug!(id, "Discovery subscriber added");
        self.mark_changed();
    }

    pub async fn unsubscribe(&self, id: &str) -> bool {
        self.subscribers.write().await.remove(id).is_some()
    }

    /// Snapshot lists as they are delivered
    pub fn events(&self) -> broadcast::Receiver<Vec<DeviceDescriptor>> {
        self.snapshots.subscribe()
    }

    pub async fn count_devices(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Current devices, ordered by name then UUID
    pub async fn snapshot(&self) -> Vec<DeviceDescriptor> {
        let mut list: Vec<DeviceDescriptor> = self.devices.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.uuid.cmp(&b.uuid)));
        list
    }

    pub async fn get(&self, uuid: &str) -> Option<DeviceDescriptor> {
        self.devices.read().await.get(uuid).cloned()
    }

    pub async fn find_by_serial(&self, serial: &str) -> Option<DeviceDescriptor> {
        self.devices
            .read()
            .await
            .values()
            .find(|d| d.serial == serial)
            .cloned()
    }

    fn queue_probe(&self, probe: Probe) -> Result<(), DiscoveryError> {
        debug!(?probe, "Queueing probe");
        self.probes.try_send(probe).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DiscoveryError::ProbeQueueFull,
            mpsc::error::TrySendError::Closed(_) => DiscoveryError::Stopped,
        })
    }

    /// Ask the backend to probe `ip` over UDP
    pub fn poke(&self, ip: &str) -> Result<(), DiscoveryError> {
        self.queue_probe(Probe::Poke(parse_ip(ip)?))
    }

    /// Ask the backend to probe `ip` over TCP
    pub fn poke_tcp(&self, ip: &str) -> Result<(), DiscoveryError> {
        self.queue_probe(Probe::PokeTcp(parse_ip(ip)?))
    }

    /// Check whether the backend can open a TCP connection to `ip`
    pub async fn test_tcp(&self, ip: &str) -> Result<bool, DiscoveryError> {
        let ip = parse_ip(ip)?;
        let (tx, rx) = oneshot::channel();
        self.tcp_tests().entry(ip).or_default().push(tx);
        self.queue_probe(Probe::TestTcp(ip))?;

        match timeout(TEST_TCP_TIMEOUT, rx).await {
            Ok(Ok(reachable)) => Ok(reachable),
            Ok(Err(_)) => Err(DiscoveryError::Stopped),
            Err(_) => {
                self.tcp_tests().remove(&ip);
                Err(DiscoveryError::Timeout(format!("testtcp {ip}")))
            }
        }
    }

    async fn deliver(&self) {
        let snapshot = self.snapshot().await;
        let subscribers: Vec<Subscriber> = self.subscribers.read().await.values().cloned().collect();
        trace!(devices = snapshot.len(), subscribers = subscribers.len(), "Delivering snapshot");
        for subscriber in subscribers {
            subscriber(&snapshot);
        }
        let _ = self.snapshots.send(snapshot);
    }

    /// Deliver snapshots on change, at most once per buffer interval, and
    /// periodically regardless of change
    pub(crate) async fn dispatch_loop(&self, cancel: &CancellationToken) {
        let mut changes = self.changes.subscribe();
        let mut redeliver = interval_at(Instant::now() + self.config.redeliver, self.config.redeliver);
        redeliver.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(wait) = last.and_then(|at| self.config.buffer.checked_sub(at.elapsed())) {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep(wait) => {}
                        }
                    }
                    changes.borrow_and_update();
                    self.deliver().await;
                    last = Some(Instant::now());
                }
                _ = redeliver.tick() => {
                    self.deliver().await;
                    last = Some(Instant::now());
                }
            }
        }
        debug!("Discovery dispatcher stopped");
    }
}

fn parse_ip(ip: &str) -> Result<IpAddr, DiscoveryError> {
    ip.trim().parse().map_err(|_| {
        warn!(ip, "Refusing to probe invalid address");
        DiscoveryError::InvalidAddress(ip.to_string())
    })
}
