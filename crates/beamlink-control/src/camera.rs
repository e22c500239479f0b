//! Camera session: a frame channel per device, independent of the control queue
//!
//! One reader task owns the socket. Snapshots (`require_frame`) and the live
//! stream (`enable_streaming`) are both fed from it; the live stream is a
//! broadcast, so any number of listeners share a single subscription on the
//! device. Socket errors reach listeners as a final `Err` item.

use beamlink_core::{classify_firmware_response, Capability, ConnectionError, DeviceDescriptor, FcodeVersion, VersionChecker};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::CameraError;
use crate::session::handshake;
use crate::transport::{Connector, Endpoint, Incoming, Link};

/// Models whose frames are cropped or resized before delivery
pub const PREPROCESSED_MODELS: &[&str] = &[
    "mozu1", "fbm1", "fbb1b", "fbb1p", "fhexa1", "laser-b1", "laser-b2", "darwin-dev",
];

/// Unreadable payloads tolerated before a snapshot fails
const FAIL_THRESHOLD: u32 = 20;
/// Unreadable payloads after which the user should check the cable
const CABLE_ALERT_THRESHOLD: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_millis(500);
/// Frames wider than this come from an HD camera
const HD_WIDTH: u32 = 720;
const FRAME_BUFFER: usize = 16;

/// HD classification per device serial, shared across sessions
#[derive(Debug, Clone, Default)]
pub struct HdCache(Arc<Mutex<HashMap<String, bool>>>);

impl HdCache {
    pub fn get(&self, serial: &str) -> Option<bool> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).get(serial).copied()
    }

    fn record(&self, serial: &str, width: u32) {
        let mut map = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(serial.to_string()).or_insert_with(|| {
            let hd = width > HD_WIDTH;
            info!(serial, width, hd, "Camera resolution detected");
            hd
        });
    }
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub client_key: String,
    pub connect_timeout: Duration,
    /// Budget for a single snapshot
    pub frame_timeout: Duration,
    pub should_crop: bool,
    /// Rotate frames by 180 degrees
    pub needs_flip: bool,
    pub hd_cache: HdCache,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            client_key: String::new(),
            connect_timeout: Duration::from_secs(120),
            frame_timeout: Duration::from_secs(30),
            should_crop: true,
            needs_flip: false,
            hd_cache: HdCache::default(),
        }
    }
}

/// One decoded camera frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Encoded image, JPEG when preprocessing applied
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// The device needed many retries to produce this frame
    pub needs_cable_alert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    AsIs,
    /// 640x480 cropped to the 640x280 working area
    Crop,
    /// 1280x720 scaled to 640x360, then cropped to 640x280
    Resize,
}

/// Per-device frame transformation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Preprocess {
    shape: Shape,
    flip: bool,
}

impl Preprocess {
    pub(crate) fn for_device(device: &DeviceDescriptor, should_crop: bool, flip: bool) -> Self {
        if device.fcode_version() == FcodeVersion::V2 || !PREPROCESSED_MODELS.contains(&device.model.as_str()) {
            return Self {
                shape: Shape::AsIs,
                flip: false,
            };
        }
        let shape = if !should_crop {
            Shape::AsIs
        } else if VersionChecker::new(&device.firmware_version).meet_requirement(Capability::BeamboxCameraSpeedUp) {
            Shape::Crop
        } else {
            Shape::Resize
        };
        Self { shape, flip }
    }

    fn is_identity(&self) -> bool {
        self.shape == Shape::AsIs && !self.flip
    }

    pub(crate) fn apply(&self, image: DynamicImage) -> DynamicImage {
        let image = if self.flip { image.rotate180() } else { image };
        match self.shape {
            Shape::AsIs => image,
            Shape::Crop => image.crop_imm(0, 100, 640, 280),
            Shape::Resize => image.resize_exact(640, 360, FilterType::Triangle).crop_imm(0, 40, 640, 280),
        }
    }
}

/// Dimensions of an encoded image, `None` if the payload is not one
fn image_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

enum Request {
    OneShot(oneshot::Sender<Result<Frame, CameraError>>),
    Stream,
}

/// Handle to a live camera session
pub struct CameraSession {
    uuid: String,
    serial: String,
    requests: mpsc::Sender<Request>,
    frames: broadcast::Receiver<Result<Frame, CameraError>>,
    frame_timeout: Duration,
    hd_cache: HdCache,
    shutdown: CancellationToken,
}

impl CameraSession {
    /// Open the camera socket for `device` and complete the handshake
    pub async fn connect(
        connector: &dyn Connector,
        device: &DeviceDescriptor,
        config: CameraConfig,
    ) -> Result<Self, CameraError> {
        let mut link = connector.open(&Endpoint::camera(device)).await?;
        handshake(&mut link, &config.client_key, config.connect_timeout).await?;
        info!(uuid = %device.uuid, flip = config.needs_flip, crop = config.should_crop, "Camera connected");

        let (requests_tx, requests_rx) = mpsc::channel(8);
        let (frames_tx, frames_rx) = broadcast::channel(FRAME_BUFFER);
        let shutdown = CancellationToken::new();

        let reader = Reader {
            uuid: device.uuid.clone(),
            serial: device.serial.clone(),
            link,
            preprocess: Preprocess::for_device(device, config.should_crop, config.needs_flip),
            hd_cache: config.hd_cache.clone(),
            frames: frames_tx,
            waiters: VecDeque::new(),
            streaming: false,
            failures: 0,
            retry_at: None,
        };
        tokio::spawn(reader.run(requests_rx, shutdown.clone()));

        Ok(Self {
            uuid: device.uuid.clone(),
            serial: device.serial.clone(),
            requests: requests_tx,
            frames: frames_rx,
            frame_timeout: config.frame_timeout,
            hd_cache: config.hd_cache,
            shutdown,
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Whether the device's camera is HD, once a frame has been seen
    pub fn is_hd(&self) -> Option<bool> {
        self.hd_cache.get(&self.serial)
    }

    /// Request a single frame
    pub async fn one_shot(&self) -> Result<Frame, CameraError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::OneShot(tx))
            .await
            .map_err(|_| CameraError::Closed)?;

        timeout(self.frame_timeout, rx)
            .await
            .map_err(|_| CameraError::Timeout)?
            .map_err(|_| CameraError::Closed)?
    }

    /// Live frames; ends after the socket goes away
    pub async fn live_stream(&self) -> Result<BoxStream<'static, Result<Frame, CameraError>>, CameraError> {
        let rx = self.frames.resubscribe();
        self.requests.send(Request::Stream).await.map_err(|_| CameraError::Closed)?;

        Ok(Box::pin(BroadcastStream::new(rx).filter_map(|item| match item {
            Ok(frame) => Some(frame),
            Err(lagged) => {
                debug!(error = %lagged, "Camera listener lagged");
                None
            }
        })))
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.requests.is_closed()
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Reader {
    uuid: String,
    serial: String,
    link: Link,
    preprocess: Preprocess,
    hd_cache: HdCache,
    frames: broadcast::Sender<Result<Frame, CameraError>>,
    waiters: VecDeque<oneshot::Sender<Result<Frame, CameraError>>>,
    streaming: bool,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Reader {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>, shutdown: CancellationToken) {
        let terminal = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break CameraError::Closed,
                request = requests.recv() => match request {
                    None => break CameraError::Closed,
                    Some(Request::OneShot(tx)) => {
                        self.waiters.push_back(tx);
                        if self.link.send("require_frame").await.is_err() {
                            break CameraError::Closed;
                        }
                    }
                    Some(Request::Stream) => {
                        if !self.streaming {
                            self.streaming = true;
                            if self.link.send("enable_streaming").await.is_err() {
                                break CameraError::Closed;
                            }
                        }
                    }
                },
                _ = sleep_until(self.retry_at.unwrap_or_else(Instant::now)), if self.retry_at.is_some() => {
                    self.retry_at = None;
                    if self.link.send("require_frame").await.is_err() {
                        break CameraError::Closed;
                    }
                }
                frame = self.link.recv() => match frame {
                    None => break CameraError::Closed,
                    Some(Incoming::Binary(data)) => self.on_payload(data),
                    Some(Incoming::Error(value)) | Some(Incoming::Fatal(value)) => {
                        let classified = classify_firmware_response(&value);
                        break CameraError::Connection(ConnectionError::from_codes(&classified.error));
                    }
                    Some(other) => trace!(uuid = %self.uuid, ?other, "Camera frame ignored"),
                },
            }
        };

        info!(uuid = %self.uuid, reason = %terminal, "Camera session closed");
        self.fail(terminal);
    }

    fn on_payload(&mut self, data: Bytes) {
        let Some((width, height)) = image_dimensions(&data) else {
            self.failures += 1;
            if self.failures == CABLE_ALERT_THRESHOLD {
                warn!(uuid = %self.uuid, "Camera keeps sending unreadable frames, check the cable");
            }
            if self.failures <= FAIL_THRESHOLD {
                self.retry_at = Some(Instant::now() + RETRY_DELAY);
            } else {
                warn!(uuid = %self.uuid, failures = self.failures, "Giving up on camera frame");
                let failures = std::mem::take(&mut self.failures);
                self.reject(CameraError::InvalidFrames(failures));
            }
            return;
        };

        let needs_cable_alert = self.failures >= CABLE_ALERT_THRESHOLD;
        self.failures = 0;
        self.hd_cache.record(&self.serial, width);

        let frame = self.build_frame(data, width, height, needs_cable_alert);
        if let Some(waiter) = self.waiters.pop_front() {
            let _ = waiter.send(frame.clone());
        }
        if self.streaming {
            let _ = self.frames.send(frame);
        }
    }

    fn build_frame(&self, data: Bytes, width: u32, height: u32, needs_cable_alert: bool) -> Result<Frame, CameraError> {
        if self.preprocess.is_identity() {
            return Ok(Frame {
                data,
                width,
                height,
                needs_cable_alert,
            });
        }

        let image = image::load_from_memory(&data).map_err(|e| CameraError::Image(e.to_string()))?;
        let image = DynamicImage::ImageRgb8(self.preprocess.apply(image).to_rgb8());
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Jpeg)
            .map_err(|e| CameraError::Image(e.to_string()))?;

        Ok(Frame {
            data: Bytes::from(out.into_inner()),
            width: image.width(),
            height: image.height(),
            needs_cable_alert,
        })
    }

    /// Reject the oldest snapshot request and tell stream listeners
    fn reject(&mut self, error: CameraError) {
        if let Some(waiter) = self.waiters.pop_front() {
            let _ = waiter.send(Err(error.clone()));
        }
        if self.streaming {
            let _ = self.frames.send(Err(error));
        }
    }

    fn fail(mut self, error: CameraError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        let _ = self.frames.send(Err(error));
        self.link.close();
    }
}
