pub mod capture;
pub mod decode;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::Rotation;
use serde::{Deserialize, Serialize};

use crate::utils::FoundDevice;

pub use capture::{CapturePermission, ErrorCallback, Frame, FrameCallback, FrameSource};
pub use decode::Decoder;
pub use error::{DecodeError, ScanError};
pub use pipeline::{
    ChannelSink, DecodedPayload, FrameSlot, ResultSink, ScanOutcome, ScanSession, ScanState,
    ScanStats,
};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub scanner: ScannerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node and its pixel format. An empty path triggers auto-detection,
    /// `stub://` paths select the synthetic source.
    pub device: FoundDevice,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
    /// Sensor mounting, stamped on every frame for the decoder
    pub rotation: Rotation,
    /// Pin the capture thread to this core
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Stop the frame source as soon as a payload commits
    pub stop_on_commit: bool,
    /// Tokio worker threads available to decode completions
    pub decode_workers: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: FoundDevice::default(),
            width: 1280,
            height: 720,
            fps: 30,
            buffer_count: 4,
            rotation: Rotation::Deg0,
            pin_core: None,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            stop_on_commit: true,
            decode_workers: 2,
        }
    }
}

/// Load configuration: defaults, then an optional TOML file, then
/// `OPTISCAN__SECTION__KEY` environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<Config, ScanError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }
    let config = builder
        .add_source(
            config::Environment::with_prefix("OPTISCAN")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    Ok(config)
}
