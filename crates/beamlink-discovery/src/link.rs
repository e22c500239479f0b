//! The backend `discover` socket and its reconnect loop

use beamlink_control::{Connector, Endpoint, Incoming, Link};
use serde_json::json;
use std::net::IpAddr;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;
use crate::feed::DiscoveryFeed;

/// Reconnect backoff for the discover socket
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (zero-based), doubling up to `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// A request for the backend to look at one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Poke(IpAddr),
    PokeTcp(IpAddr),
    TestTcp(IpAddr),
}

impl Probe {
    pub fn to_json(&self) -> String {
        let (cmd, ip) = match self {
            Self::Poke(ip) => ("poke", ip),
            Self::PokeTcp(ip) => ("poketcp", ip),
            Self::TestTcp(ip) => ("testtcp", ip),
        };
        json!({"cmd": cmd, "ipaddr": ip.to_string()}).to_string()
    }
}

impl DiscoveryFeed {
    /// Keep the discover socket open and deliver snapshots until `cancel` fires
    pub async fn run(&self, connector: &dyn Connector, cancel: &CancellationToken) {
        let probes = self
            .probe_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut probes) = probes else {
            warn!("Discovery feed is already running");
            return;
        };

        info!("Starting discovery");
        tokio::join!(self.dispatch_loop(cancel), self.link_loop(connector, &mut probes, cancel));
        info!("Discovery stopped");
    }

    async fn link_loop(&self, connector: &dyn Connector, probes: &mut mpsc::Receiver<Probe>, cancel: &CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.connect_and_read(connector, probes, cancel) => {
                    match result {
                        Ok(()) => {
                            info!("Discover socket closed, reconnecting");
                            attempt = 0;
                        }
                        Err(e) => {
                            let delay = self.config.reconnect.backoff(attempt);
                            warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Discover socket failed");
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => break,
                                _ = sleep(delay) => {}
                            }
                            attempt = attempt.saturating_add(1);
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_read(
        &self,
        connector: &dyn Connector,
        probes: &mut mpsc::Receiver<Probe>,
        cancel: &CancellationToken,
    ) -> Result<(), DiscoveryError> {
        let mut link = connector.open(Endpoint::DISCOVER).await?;
        debug!("Discover socket open");

        let mut poke_timer = interval(self.config.poke_interval);
        poke_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = poke_timer.tick(), if !self.config.poke_ips.is_empty() => {
                    for ip in &self.config.poke_ips {
                        match ip.parse() {
                            Ok(ip) => send_probe(&link, Probe::Poke(ip)).await?,
                            Err(_) => debug!(ip = %ip, "Skipping invalid poke address"),
                        }
                    }
                }
                Some(probe) = probes.recv() => send_probe(&link, probe).await?,
                frame = link.recv() => match frame {
                    Some(Incoming::Message(message)) => self.ingest(&message).await,
                    Some(Incoming::Error(message)) => {
                        warn!(message = %message, "Discovery backend error");
                    }
                    Some(Incoming::Fatal(message)) => {
                        return Err(DiscoveryError::Backend(message.to_string()));
                    }
                    Some(Incoming::Binary(_)) | Some(Incoming::Text(_)) => {}
                    None => return Ok(()),
                },
            }
        }
    }
}

async fn send_probe(link: &Link, probe: Probe) -> Result<(), DiscoveryError> {
    debug!(?probe, "Sending probe");
    link.send(probe.to_json()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedConfig;
    use beamlink_control::mock::{MockBackend, MockDevice};
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::sync::Arc;

    async fn running(backend: &MockBackend, config: FeedConfig) -> (Arc<DiscoveryFeed>, CancellationToken) {
        let feed = Arc::new(DiscoveryFeed::new(config));
        let cancel = CancellationToken::new();
        {
            let (feed, backend, cancel) = (feed.clone(), backend.clone(), cancel.clone());
            tokio::spawn(async move { feed.run(&backend, &cancel).await });
        }
        sleep(Duration::from_millis(10)).await;
        (feed, cancel)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ReconnectConfig::default();
        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(16));
        assert_eq!(config.backoff(5), Duration::from_secs(30));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_probe_json() {
        let probe = Probe::PokeTcp("10.0.0.3".parse().unwrap());
        let value: Value = serde_json::from_str(&probe.to_json()).unwrap();
        assert_eq!(value, json!({"cmd": "poketcp", "ipaddr": "10.0.0.3"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_devices_appear_and_leave() {
        let backend = MockBackend::new();
        backend.add_device(MockDevice::new("early"));
        let (feed, cancel) = running(&backend, FeedConfig::default()).await;

        assert!(feed.get("early").await.is_some());

        backend.add_device(MockDevice::new("late"));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(feed.count_devices().await, 2);

        backend.remove_device("early");
        sleep(Duration::from_millis(10)).await;
        assert!(feed.get("early").await.is_none());

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_ips_are_poked() {
        let backend = MockBackend::new();
        let config = FeedConfig {
            poke_ips: vec!["192.168.1.77".to_string(), "bogus".to_string()],
            ..FeedConfig::default()
        };
        let (feed, cancel) = running(&backend, config).await;

        assert_eq!(backend.probes(), vec![json!({"cmd": "poke", "ipaddr": "192.168.1.77"})]);

        feed.poke_tcp("192.168.1.78").unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.probes().len(), 2);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_reachability() {
        let backend = MockBackend::new();
        backend.add_device(MockDevice::new("abc").with_ip("10.0.0.5"));
        let (feed, cancel) = running(&backend, FeedConfig::default()).await;

        assert_eq!(feed.test_tcp("10.0.0.5").await, Ok(true));
        assert_eq!(feed.test_tcp("10.0.0.6").await, Ok(false));

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_drop() {
        let backend = MockBackend::new();
        backend.set_offline(true);
        let (feed, cancel) = running(&backend, FeedConfig::default()).await;
        assert!(backend.opened().is_empty());

        backend.set_offline(false);
        backend.add_device(MockDevice::new("abc"));
        sleep(Duration::from_millis(1100)).await;
        assert!(feed.get("abc").await.is_some());

        backend.drop_discover();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.opened(), vec!["discover", "discover"]);

        cancel.cancel();
    }
}
