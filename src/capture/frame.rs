use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Callback fired exactly once when a frame's buffer handle is closed.
pub type ReleaseHook = Box<dyn FnOnce(&FrameMetadata) + Send + Sync + 'static>;

/// Exclusively-owned captured frame.
///
/// Not `Clone`: a frame moves from the source into the slot and from the slot
/// to the decode path. Dropping it closes the underlying buffer handle, so the
/// release happens exactly once on whichever side holds it last.
pub struct Frame {
    /// Pixel data as delivered by the device
    data: Bytes,

    /// Frame metadata
    meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    timestamp: Instant,

    release: Option<ReleaseHook>,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row for packed formats
    pub stride: u32,
    pub format: PixelFormat,
    pub rotation: Rotation,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

/// Clockwise rotation needed to bring the sensor image upright.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
            release: None,
        }
    }

    /// Attach the hook that closes the device buffer backing this frame.
    pub fn with_release(
        mut self,
        hook: impl FnOnce(&FrameMetadata) + Send + Sync + 'static,
    ) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn meta(&self) -> &FrameMetadata {
        &self.meta
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Refcounted view for a blocking worker. The caller must await the worker
    /// before releasing the frame.
    pub(crate) fn shared(&self) -> (Bytes, Arc<FrameMetadata>) {
        (self.data.clone(), self.meta.clone())
    }

    /// Close the buffer handle now. Equivalent to dropping the frame.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        trace!(sequence = self.meta.sequence, "frame released");
        if let Some(hook) = self.release.take() {
            hook(&self.meta);
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("format", &self.meta.format)
            .field("rotation", &self.meta.rotation)
            .field("size", &self.data.len())
            .finish()
    }
}
