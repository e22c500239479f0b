//! Transport abstraction shared by control, camera, touch and discovery sockets
//!
//! A [`Link`] is one open duplex socket, already decoded into [`Incoming`]
//! frames. [`Connector`] opens links by backend method name
//! (`control/<uuid>`, `camera/<uuid>`, `discover`, `touch`).

use async_trait::async_trait;
use beamlink_core::DeviceDescriptor;
use bytes::Bytes;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::TransportError;

/// Channel depth between a link and its pump task
pub const LINK_BUFFER: usize = 256;

static BARE_NAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bNaN\b").expect("valid regex"));

/// A decoded frame received from the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Any JSON frame that is not an error
    Message(Value),
    /// `status: error`, recoverable at the session level
    Error(Value),
    /// `status: fatal`, the socket is unusable
    Fatal(Value),
    /// Binary payload (downloads, thumbnails, camera frames)
    Binary(Bytes),
    /// Text that is not JSON
    Text(String),
}

impl Incoming {
    /// `status` field of a JSON frame
    pub fn status(&self) -> Option<&str> {
        match self {
            Self::Message(v) | Self::Error(v) | Self::Fatal(v) => v.get("status").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// A frame to send to the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    Binary(Bytes),
}

impl From<&str> for Outgoing {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Outgoing {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Decode a text frame. Returns `None` for keep-alive and debug chatter.
pub fn decode_text(text: &str) -> Option<Incoming> {
    let scrubbed = BARE_NAN.replace_all(text, "null");
    let value: Value = match serde_json::from_str(&scrubbed) {
        Ok(value) => value,
        Err(_) => return Some(Incoming::Text(text.to_string())),
    };

    match value.get("status").and_then(Value::as_str) {
        Some("pong") | Some("debug") => {
            trace!(frame = %text, "Ignoring frame");
            None
        }
        Some("error") => Some(Incoming::Error(value)),
        Some("fatal") => Some(Incoming::Fatal(value)),
        _ => Some(Incoming::Message(value)),
    }
}

/// One open socket
pub struct Link {
    tx: mpsc::Sender<Outgoing>,
    rx: mpsc::Receiver<Incoming>,
}

/// The far end of an in-memory [`Link`], held by the pump task or a test
pub struct RemoteEnd {
    pub tx: mpsc::Sender<Incoming>,
    pub rx: mpsc::Receiver<Outgoing>,
}

impl Link {
    /// Create a connected link and the handle that feeds it
    pub fn pair() -> (Link, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);
        (
            Link { tx: out_tx, rx: in_rx },
            RemoteEnd { tx: in_tx, rx: out_rx },
        )
    }

    pub async fn send(&self, frame: impl Into<Outgoing>) -> Result<(), TransportError> {
        self.tx.send(frame.into()).await.map_err(|_| TransportError::Closed)
    }

    /// Next frame, `None` once the socket is gone
    pub async fn recv(&mut self) -> Option<Incoming> {
        self.rx.recv().await
    }

    /// Drop our sending half; the pump closes the socket once it drains
    pub fn close(self) {
        drop(self);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Opens links to the backend
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, method: &str) -> Result<Link, TransportError>;
}

/// Backend method names for a device
pub struct Endpoint;

impl Endpoint {
    pub fn control(device: &DeviceDescriptor) -> String {
        Self::device_method("control", device)
    }

    pub fn camera(device: &DeviceDescriptor) -> String {
        Self::device_method("camera", device)
    }

    pub const DISCOVER: &'static str = "discover";
    pub const TOUCH: &'static str = "touch";

    fn device_method(kind: &str, device: &DeviceDescriptor) -> String {
        match (device.is_usb(), device.addr) {
            (true, Some(addr)) => format!("{kind}/usb/{addr}"),
            _ => format!("{kind}/{}", device.uuid),
        }
    }
}
