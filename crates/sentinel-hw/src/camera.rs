//! Frame acquisition: the `FrameSource` seam and its V4L2 implementation.

use crate::frame::{self, Frame};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Fraction of near-black pixels above which a frame is discarded.
const DARK_FRAME_PCT: f32 = 0.95;
/// Raw dequeues allowed per delivered frame before a batch gives up on dark frames.
const DARK_ATTEMPTS_FACTOR: usize = 3;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// The camera could not be opened or initialised at all.
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    /// No frame arrived within the per-frame timeout. Not fatal.
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("capture failed: {0}")]
    Failed(String),
}

/// Acquires frames on demand from a camera-like device.
///
/// Implementations are driven from a single capture worker thread; `open`
/// is called before every capture batch and must be cheap when the device
/// is already open.
pub trait FrameSource: Send {
    /// Open and initialise the device. Fails with [`CaptureError::Unavailable`]
    /// when the camera cannot be brought up.
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Capture up to `max_count` frames, handing each slot's result to `sink`
    /// as soon as it is available. A slot that sees no frame within
    /// `per_frame_timeout` is reported as [`CaptureError::Timeout`] and the
    /// batch moves on. Capture stops early when `sink` returns `false`.
    fn capture(
        &mut self,
        max_count: usize,
        per_frame_timeout: Duration,
        sink: &mut dyn FnMut(Result<Frame, CaptureError>) -> bool,
    ) -> Result<(), CaptureError>;

    /// Release the device between motion episodes.
    fn release(&mut self);
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

/// How the V4L2 camera is opened.
#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    /// Open attempts before reporting the camera unavailable.
    pub open_retries: u32,
    pub retry_delay: Duration,
    /// Rotate frames 180° (camera mounted upside down).
    pub flip: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device_path: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            open_retries: 3,
            retry_delay: Duration::from_secs(2),
            flip: false,
        }
    }
}

struct OpenDevice {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

/// V4L2 camera, opened lazily and released after each motion episode.
pub struct Camera {
    settings: CameraSettings,
    open: Option<OpenDevice>,
}

impl Camera {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            settings,
            open: None,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.settings.device_path
    }

    fn open_device(&self) -> Result<OpenDevice, CaptureError> {
        let device_path = self.settings.device_path.as_str();
        if !Path::new(device_path).exists() {
            return Err(CaptureError::Unavailable(format!(
                "device not found: {device_path}"
            )));
        }

        let device = Device::with_path(device_path)
            .map_err(|e| CaptureError::Unavailable(format!("{device_path}: {e}")))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::Unavailable(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::Unavailable(format!(
                "{device_path} is not a video capture device"
            )));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CaptureError::Unavailable(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = self.settings.width;
        fmt.height = self.settings.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CaptureError::Unavailable(format!("failed to set format: {e}")))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            PixelFormat::Y16
        } else {
            return Err(CaptureError::Unavailable(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "camera opened"
        );

        Ok(OpenDevice {
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }
}

impl OpenDevice {
    fn to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CaptureError> {
        let pixels = (self.width * self.height) as usize;
        let converted = match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(CaptureError::Failed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height),
        };
        converted.map_err(|e| CaptureError::Failed(e.to_string()))
    }
}

impl FrameSource for Camera {
    fn open(&mut self) -> Result<(), CaptureError> {
        if self.open.is_some() {
            return Ok(());
        }

        let attempts = self.settings.open_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.open_device() {
                Ok(dev) => {
                    self.open = Some(dev);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "camera open failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        std::thread::sleep(self.settings.retry_delay);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            CaptureError::Unavailable(self.settings.device_path.clone())
        }))
    }

    fn capture(
        &mut self,
        max_count: usize,
        per_frame_timeout: Duration,
        sink: &mut dyn FnMut(Result<Frame, CaptureError>) -> bool,
    ) -> Result<(), CaptureError> {
        let Some(dev) = self.open.as_ref() else {
            return Err(CaptureError::Failed("capture on a closed camera".into()));
        };

        let result = capture_batch(dev, self.settings.flip, max_count, per_frame_timeout, sink);
        if matches!(result, Err(CaptureError::Failed(_))) {
            // Drop the device so the next episode reopens it from scratch.
            self.open = None;
        }
        result
    }

    fn release(&mut self) {
        if self.open.take().is_some() {
            tracing::debug!(device = %self.settings.device_path, "camera released");
        }
    }
}

fn capture_batch(
    dev: &OpenDevice,
    flip: bool,
    max_count: usize,
    per_frame_timeout: Duration,
    sink: &mut dyn FnMut(Result<Frame, CaptureError>) -> bool,
) -> Result<(), CaptureError> {
    let mut stream = MmapStream::with_buffers(&dev.device, BufType::VideoCapture, 4)
        .map_err(|e| CaptureError::Failed(format!("failed to create mmap stream: {e}")))?;
    stream.set_timeout(per_frame_timeout);

    let mut delivered = 0usize;
    let mut attempts = 0usize;
    while delivered < max_count && attempts < max_count * DARK_ATTEMPTS_FACTOR {
        attempts += 1;

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                delivered += 1;
                if !sink(Err(CaptureError::Timeout(per_frame_timeout))) {
                    break;
                }
                continue;
            }
            Err(e) => {
                return Err(CaptureError::Failed(format!("failed to dequeue buffer: {e}")));
            }
        };

        let mut gray = dev.to_grayscale(buf)?;
        if frame::is_dark_frame(&gray, DARK_FRAME_PCT) {
            tracing::debug!(seq = meta.sequence, "skipping dark frame");
            continue;
        }
        if flip {
            frame::rotate_180(&mut gray);
        }

        delivered += 1;
        let frame = Frame::new(gray, dev.width, dev.height, meta.sequence);
        if !sink(Ok(frame)) {
            break;
        }
    }

    Ok(())
}
