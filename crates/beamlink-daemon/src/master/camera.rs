//! Camera sessions of the selected device

use beamlink_control::{CameraConfig, CameraError, CameraSession, Frame, Mode};
use beamlink_core::FcodeVersion;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{DeviceConnection, DeviceMaster, Slot};
use crate::error::MasterError;

impl DeviceMaster {
    /// Open (or reopen) the camera of the selected device
    pub async fn connect_camera(&self, should_crop: bool) -> Result<(), MasterError> {
        let (uuid, slot) = self.current_slot()?;

        let read_offset = {
            let mut conn = slot.lock().await;
            conn.camera_crop = should_crop;
            if conn.info.fcode_version() == FcodeVersion::V2 {
                conn.camera_needs_flip = Some(false);
            }
            conn.camera_needs_flip.is_none()
                && conn.control.as_ref().is_some_and(|c| c.is_connected() && c.mode() == Mode::Normal)
        };

        // The slot lock is released here; the setting read takes it again
        if read_offset {
            if let Err(e) = self.get_device_setting("camera_offset").await {
                warn!(uuid = %uuid, error = %e, "Could not read camera offset");
            }
        }

        let mut conn = slot.lock().await;
        if let Some(old) = conn.camera.take() {
            old.close();
        }
        let camera = self.open_camera(&conn).await?;
        conn.camera = Some(Arc::new(camera));
        info!(uuid = %uuid, "Camera ready");
        Ok(())
    }

    pub(super) async fn open_camera(&self, conn: &DeviceConnection) -> Result<CameraSession, CameraError> {
        let config = CameraConfig {
            should_crop: conn.camera_crop,
            needs_flip: conn.camera_needs_flip.unwrap_or(false),
            ..self.config.camera.clone()
        };
        CameraSession::connect(self.connector.as_ref(), &conn.info, config).await
    }

    async fn camera(&self, slot: &Slot) -> Result<Arc<CameraSession>, MasterError> {
        let (existing, crop) = {
            let conn = slot.lock().await;
            (conn.camera.clone().filter(|c| !c.is_closed()), conn.camera_crop)
        };
        if let Some(camera) = existing {
            return Ok(camera);
        }
        self.connect_camera(crop).await?;
        slot.lock()
            .await
            .camera
            .clone()
            .ok_or(MasterError::Camera(CameraError::Closed))
    }

    /// One frame, reconnecting the camera once if the first attempt fails
    pub async fn take_one_picture(&self) -> Result<Frame, MasterError> {
        let (uuid, slot) = self.current_slot()?;
        let budget = self.config.camera.frame_timeout;

        let attempt = async {
            let camera = self.camera(&slot).await?;
            match camera.one_shot().await {
                Ok(frame) => Ok(frame),
                Err(e) => {
                    warn!(uuid = %uuid, error = %e, "Snapshot failed, reconnecting camera");
                    let crop = slot.lock().await.camera_crop;
                    self.connect_camera(crop).await?;
                    let camera = self.camera(&slot).await?;
                    Ok(camera.one_shot().await?)
                }
            }
        };

        match timeout(budget, attempt).await {
            Ok(result) => result,
            Err(_) => Err(MasterError::Camera(CameraError::Timeout)),
        }
    }

    /// Live frames from the selected device; ends when the camera closes
    pub async fn stream_camera(&self) -> Result<BoxStream<'static, Result<Frame, CameraError>>, MasterError> {
        let (_, slot) = self.current_slot()?;
        let camera = self.camera(&slot).await?;
        Ok(camera.live_stream().await?)
    }

    pub async fn disconnect_camera(&self) {
        let Ok((uuid, slot)) = self.current_slot() else {
            return;
        };
        let camera = slot.lock().await.camera.take();
        if let Some(camera) = camera {
            camera.close();
            debug!(uuid = %uuid, "Camera disconnected");
        }
    }
}
