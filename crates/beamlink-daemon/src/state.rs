//! Application state management

use beamlink_control::Connector;
use beamlink_core::DeviceDescriptor;
use beamlink_discovery::DiscoveryFeed;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::master::{Collaborators, DeviceMaster, MasterConfig};

/// Shared application state
pub struct AppState {
    pub config: Config,
    /// Discovery feed, shared with the registry
    pub feed: Arc<DiscoveryFeed>,
    pub master: Arc<DeviceMaster>,
}

impl AppState {
    /// Build the feed and registry and attach them
    pub async fn new(config: Config, connector: Arc<dyn Connector>, collab: Collaborators) -> Arc<Self> {
        let feed = Arc::new(DiscoveryFeed::new(config.feed_config()));
        let master_config = MasterConfig {
            session: config.session_config(),
            camera: config.camera_config(),
        };
        let master = DeviceMaster::new(connector, feed.clone(), collab, master_config);
        master.attach().await;

        Arc::new(Self { config, feed, master })
    }

    /// Discovery snapshots for WebSocket clients
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<DeviceDescriptor>> {
        self.feed.events()
    }
}
