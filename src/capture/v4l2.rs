//! V4L2 frame source with memory-mapped buffers and a dedicated capture thread

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::unistd::{access, AccessFlags};
use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::{CapturePermission, ErrorCallback, FrameCallback, FrameSource};
use crate::error::ScanError;
use crate::CaptureConfig;

/// Consecutive dequeue failures before the capture thread reports the device lost
const MAX_CONSECUTIVE_ERRORS: u32 = 30;

/// V4L2 capture bound to one device node.
///
/// The device is opened on the capture thread itself; `start` waits for a
/// handshake so open and stream failures surface as `DeviceUnavailable`.
pub struct V4l2FrameSource {
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl V4l2FrameSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl FrameSource for V4l2FrameSource {
    #[instrument(skip(self, on_frame, on_error), fields(device = %self.config.device.path))]
    fn start(
        &mut self,
        on_frame: FrameCallback,
        on_error: ErrorCallback,
    ) -> Result<(), ScanError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = flume::bounded::<Result<(), ScanError>>(1);
        let config = self.config.clone();
        let running = self.running.clone();
        running.store(true, Ordering::Release);

        let worker = thread::Builder::new()
            .name("frame-capture".into())
            .spawn(move || capture_thread(config, running, on_frame, on_error, ready_tx))
            .map_err(|e| ScanError::device_unavailable(self.config.device.path.clone(), e))?;

        let handshake = ready_rx.recv().unwrap_or_else(|_| {
            Err(ScanError::device_unavailable(
                self.config.device.path.clone(),
                "capture thread exited during startup",
            ))
        });

        match handshake {
            Ok(()) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                let _ = worker.join();
                error!("Failed to bind capture device: {}", e);
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            // The thread notices the flag after its current dequeue returns
            if worker.join().is_err() {
                warn!("capture thread panicked");
            }
            info!("Capture stopped: {}", self.config.device.path);
        }
    }

    fn describe(&self) -> String {
        self.config.device.path.clone()
    }
}

impl Drop for V4l2FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    on_frame: FrameCallback,
    on_error: ErrorCallback,
    ready: flume::Sender<Result<(), ScanError>>,
) {
    if let Some(core) = config.pin_core {
        pin_to_core(core);
    }

    let path = config.device.path.clone();
    let (device, active) = match open_device(&config) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Buffer allocation is where a busy device usually reports EBUSY
    let mut stream =
        match MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready.send(Err(ScanError::device_unavailable(path, e)));
                return;
            }
        };

    info!(
        "Capture stream started with {} buffers ({}x{} {:?})",
        config.buffer_count, active.width, active.height, active.format
    );
    let _ = ready.send(Ok(()));

    let mut sequence = 0u64;
    let mut failures = 0u32;
    while running.load(Ordering::Acquire) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_ERRORS {
                    error!("Capture error on {}, giving up: {}", path, e);
                    // A stop in progress is not a device failure
                    if running.swap(false, Ordering::AcqRel) {
                        on_error(ScanError::device_unavailable(path.clone(), e));
                    }
                    break;
                }
                warn!("Capture error on {}: {}", path, e);
                thread::sleep(Duration::from_millis(10));
                continue;
            }
        };
        failures = 0;
        sequence += 1;

        // Copy out so the mmap buffer is requeued on the next dequeue
        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        let data = Bytes::copy_from_slice(&buf[..used]);

        let frame = Frame::new(
            data,
            FrameMetadata {
                sequence,
                device_timestamp: Some(
                    Duration::from_secs(meta.timestamp.sec as u64)
                        + Duration::from_micros(meta.timestamp.usec as u64),
                ),
                ..active.clone()
            },
        );
        on_frame(frame);
    }

    debug!("Capture thread exiting after {} frames", sequence);
}

/// Open the device and negotiate the format. Returns the metadata template
/// for frames produced under the negotiated format.
fn open_device(config: &CaptureConfig) -> Result<(Device, FrameMetadata), ScanError> {
    let path = config.device.path.as_str();
    info!("Initializing V4L2 capture: {:?}", config.device);

    let device = Device::with_path(path).map_err(|e| ScanError::device_unavailable(path, e))?;

    let caps = device
        .query_caps()
        .map_err(|e| ScanError::device_unavailable(path, e))?;
    info!("Device: {} ({})", caps.card, caps.driver);

    if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
        return Err(ScanError::device_unavailable(
            path,
            "device doesn't support video capture",
        ));
    }

    let mut fmt = device
        .format()
        .map_err(|e| ScanError::device_unavailable(path, e))?;
    fmt.width = config.width;
    fmt.height = config.height;
    fmt.fourcc = fourcc_for(config.device.format);
    let fmt = device
        .set_format(&fmt)
        .map_err(|e| ScanError::device_unavailable(path, e))?;

    if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
        warn!("Device refused {} fps: {}", config.fps, e);
    }

    // Drivers may substitute the nearest supported format
    let format = pixel_format_for(fmt.fourcc).ok_or_else(|| {
        ScanError::device_unavailable(path, format!("driver negotiated {}", fmt.fourcc))
    })?;

    let template = FrameMetadata {
        sequence: 0,
        width: fmt.width,
        height: fmt.height,
        stride: fmt.stride,
        format,
        rotation: config.rotation,
        device_timestamp: None,
    };
    Ok((device, template))
}

fn fourcc_for(format: PixelFormat) -> FourCC {
    let code = match format {
        PixelFormat::Gray8 => b"GREY",
        PixelFormat::Rgb24 => b"RGB3",
        PixelFormat::Bgr24 => b"BGR3",
        PixelFormat::Yuyv4 => b"YUYV",
        PixelFormat::Mjpeg => b"MJPG",
        PixelFormat::Nv12 => b"NV12",
    };
    FourCC::new(code)
}

fn pixel_format_for(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"GREY" => Some(PixelFormat::Gray8),
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        b"YUYV" => Some(PixelFormat::Yuyv4),
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"NV12" => Some(PixelFormat::Nv12),
        _ => None,
    }
}

fn pin_to_core(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);
    if pinned {
        debug!("Capture thread pinned to core {}", core);
    } else {
        warn!("Could not pin capture thread to core {}", core);
    }
}

/// Access check on the device node.
///
/// Only an explicit EACCES/EPERM counts as a denial; a missing node is left
/// for `start` to report as `DeviceUnavailable`.
pub struct DevicePermission {
    path: PathBuf,
}

impl DevicePermission {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CapturePermission for DevicePermission {
    fn is_granted(&self) -> bool {
        !matches!(
            access(&self.path, AccessFlags::R_OK | AccessFlags::W_OK),
            Err(Errno::EACCES) | Err(Errno::EPERM)
        )
    }
}
