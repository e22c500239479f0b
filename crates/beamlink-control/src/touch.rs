//! Password authentication through the backend's `touch` method
//!
//! A successful touch leaves the backend holding the device's credentials,
//! after which control and camera sockets to that device are accepted.

use beamlink_core::{classify_firmware_response, ConnectionError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::transport::{Connector, Endpoint, Incoming};

pub const TOUCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Answer to a touch request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchResult {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub has_response: bool,
    #[serde(default)]
    pub reachable: bool,
    #[serde(default)]
    pub auth: bool,
}

impl TouchResult {
    pub fn is_success(&self) -> bool {
        self.has_response && self.reachable && self.auth
    }
}

/// Send `password` for `uuid` and wait for the verdict
pub async fn authenticate(
    connector: &dyn Connector,
    uuid: &str,
    password: &str,
    client_key: &str,
) -> Result<TouchResult, ConnectionError> {
    let mut link = connector
        .open(Endpoint::TOUCH)
        .await
        .map_err(|_| ConnectionError::Disconnected)?;

    let request = json!({"uuid": uuid, "password": password, "key": client_key});
    link.send(request.to_string())
        .await
        .map_err(|_| ConnectionError::Disconnected)?;

    let deadline = Instant::now() + TOUCH_TIMEOUT;
    let result = loop {
        let frame = timeout_at(deadline, link.recv())
            .await
            .map_err(|_| ConnectionError::Timeout)?;

        match frame {
            None => return Err(ConnectionError::Disconnected),
            Some(Incoming::Error(value)) | Some(Incoming::Fatal(value)) => {
                let classified = classify_firmware_response(&value);
                return Err(ConnectionError::from_codes(&classified.error));
            }
            Some(Incoming::Message(value)) => match parse_touch(&value) {
                Some(result) => break result,
                None => debug!(frame = %value, "Touch frame"),
            },
            Some(other) => debug!(?other, "Touch frame"),
        }
    };

    link.close();
    info!(uuid, success = result.is_success(), "Touch finished");
    Ok(result)
}

/// Extract a touch result from an arbitrary frame, if it is one
pub fn parse_touch(value: &Value) -> Option<TouchResult> {
    value.get("has_response")?;
    serde_json::from_value(value.clone()).ok()
}
