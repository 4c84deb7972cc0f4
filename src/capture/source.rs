//! Capture-side contracts injected into a scan session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::capture::frame::Frame;
use crate::error::ScanError;

/// Per-frame callback handed to a source. Invoked on the source's capture thread.
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync + 'static>;

/// Fatal capture failure after a successful `start`, such as an unplugged
/// device. Invoked at most once, on the capture thread, which then exits.
pub type ErrorCallback = Arc<dyn Fn(ScanError) + Send + Sync + 'static>;

/// A device that continuously produces frames.
pub trait FrameSource: Send {
    /// Begin continuous capture, delivering every frame to `on_frame`.
    ///
    /// Fails with `ScanError::DeviceUnavailable` when the device cannot be
    /// bound. Losing the device later is reported through `on_error` instead.
    /// Neither is retried by the caller.
    fn start(&mut self, on_frame: FrameCallback, on_error: ErrorCallback)
        -> Result<(), ScanError>;

    /// Halt capture and release the device. Idempotent.
    ///
    /// Frames already handed to the callback may still be in flight when this
    /// returns; no new frames are delivered afterwards.
    fn stop(&mut self);

    /// Human-readable device name for logs
    fn describe(&self) -> String;
}

/// Externally granted capture permission, consulted before `FrameSource::start`.
pub trait CapturePermission: Send + Sync {
    fn is_granted(&self) -> bool;
}

impl<F> CapturePermission for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_granted(&self) -> bool {
        self()
    }
}

/// Permission flag flipped by the host's permission prompt.
#[derive(Debug, Default)]
pub struct PermissionFlag(AtomicBool);

impl PermissionFlag {
    pub fn new(granted: bool) -> Self {
        Self(AtomicBool::new(granted))
    }

    pub fn set(&self, granted: bool) {
        self.0.store(granted, Ordering::Release);
    }
}

impl CapturePermission for PermissionFlag {
    fn is_granted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
