//! Beamlink Discovery - The live set of reachable devices
//!
//! A [`DiscoveryFeed`] listens on the backend's `discover` socket, keeps the
//! latest descriptor per UUID and hands debounced snapshots to subscribers.
//! Specific addresses can be probed with `poke`, `poketcp` and `testtcp`.

pub mod error;
pub mod feed;
pub mod link;

pub use error::DiscoveryError;
pub use feed::{DiscoveryFeed, FeedConfig, Subscriber};
pub use link::{Probe, ReconnectConfig};
