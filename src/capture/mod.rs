pub mod frame;
pub mod source;
pub mod synthetic;
pub mod v4l2;

use std::sync::Arc;

pub use frame::{Frame, FrameMetadata, PixelFormat, Rotation};
pub use source::{
    CapturePermission, ErrorCallback, FrameCallback, FrameSource, PermissionFlag,
};
pub use synthetic::SyntheticFrameSource;
pub use v4l2::{DevicePermission, V4l2FrameSource};

use crate::error::ScanError;
use crate::CaptureConfig;

/// Pick the frame source for the configured device.
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn FrameSource>, ScanError> {
    if config.device.is_stub() {
        Ok(Box::new(SyntheticFrameSource::from_config(config)?))
    } else {
        Ok(Box::new(V4l2FrameSource::new(config.clone())))
    }
}

/// Permission check matching `open_source`. Synthetic devices are always granted.
pub fn permission_for(config: &CaptureConfig) -> Arc<dyn CapturePermission> {
    if config.device.is_stub() {
        Arc::new(|| true)
    } else {
        Arc::new(DevicePermission::new(config.device.path.clone()))
    }
}
