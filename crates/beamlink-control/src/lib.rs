//! Beamlink Control - Sessions to Beambox-family devices
//!
//! Each device gets one [`ControlSession`], a serialized command channel
//! with a mode state machine (normal / maintain / raw, plus line-check
//! inside raw), and optionally one [`CameraSession`] streaming frames.
//! Both run over a [`Connector`], which the WebSocket backend implements
//! and tests replace with an in-memory one.

pub mod camera;
pub mod command;
pub mod error;
pub mod linecheck;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod protocol;
pub mod session;
pub mod touch;
pub mod transport;
pub mod ws;

pub use camera::{CameraConfig, CameraSession, Frame, HdCache};
pub use command::{Command, FirmwareTarget, Mode, Progress, ProgressFn, RawMove, Reply};
pub use error::{CameraError, ControlError, TransportError};
pub use linecheck::{checksum, frame_line, StreamOutcome};
pub use session::{CloseEvent, CloseReason, ControlSession, SessionConfig, SessionSnapshot};
pub use touch::{authenticate, TouchResult};
pub use transport::{Connector, Endpoint, Incoming, Link, Outgoing};
pub use ws::WsConnector;
