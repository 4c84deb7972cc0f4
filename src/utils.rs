use crate::capture::frame::PixelFormat;
use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use tracing::info;
use v4l::{capability::Flags, video::Capture, Device, FourCC};

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

impl FoundDevice {
    pub fn new(path: String, format: PixelFormat) -> Self {
        Self { path, format }
    }

    /// Synthetic devices never touch V4L2.
    pub fn is_stub(&self) -> bool {
        self.path.starts_with("stub://")
    }
}

impl Default for FoundDevice {
    fn default() -> Self {
        Self::new("/dev/video0".into(), PixelFormat::Mjpeg)
    }
}

/// Auto-detect best capture device
pub fn auto_detect_device() -> Result<FoundDevice, ScanError> {
    use std::path::Path;

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        // Metadata nodes share the driver but cannot stream frames
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        // Scanning wants luma; prefer YUYV (free luma plane) over MJPEG
        let mut best = None;
        for fmt in formats {
            if fmt.fourcc == FourCC::new(b"YUYV") {
                best = Some(PixelFormat::Yuyv4);
                break;
            } else if fmt.fourcc == FourCC::new(b"MJPG") {
                best = Some(PixelFormat::Mjpeg);
            }
        }

        if let Some(format) = best {
            info!("Found {:?} device: {} - {}", format, path, caps.card);
            return Ok(FoundDevice { path, format });
        }
    }

    Err(ScanError::device_unavailable(
        "auto",
        "no capture device with YUYV or MJPEG output found",
    ))
}
