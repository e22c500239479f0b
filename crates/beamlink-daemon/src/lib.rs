//! Beamlink Daemon - device registry behind an HTTP and WebSocket API
//!
//! [`master::DeviceMaster`] tracks one connection per device and routes
//! commands to the selected one; the server exposes it together with the
//! discovery feed.

pub mod api;
pub mod collab;
pub mod config;
pub mod error;
pub mod master;
pub mod notify;
pub mod server;
pub mod state;
pub mod ws;
