//! Synthetic frame source for `stub://` devices.
//!
//! Replays a fixed pixel pattern (flat gray, or a still image loaded from disk)
//! at the configured frame rate on a dedicated capture thread. Every emitted
//! frame carries a release hook, so the source can report how many of its
//! buffers are still held downstream.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat, Rotation};
use crate::capture::source::{ErrorCallback, FrameCallback, FrameSource};
use crate::error::ScanError;
use crate::CaptureConfig;

/// Buffer accounting for a synthetic source
#[derive(Debug, Default)]
pub struct SourceCounters {
    pub delivered: AtomicU64,
    pub released: AtomicU64,
}

impl SourceCounters {
    /// Frames delivered but not yet released
    pub fn outstanding(&self) -> u64 {
        let delivered = self.delivered.load(Ordering::Acquire);
        delivered.saturating_sub(self.released.load(Ordering::Acquire))
    }
}

pub struct SyntheticFrameSource {
    name: String,
    pattern: Bytes,
    template: FrameMetadata,
    interval: Duration,
    limit: Option<u64>,
    fail_after: Option<u64>,
    running: Arc<AtomicBool>,
    counters: Arc<SourceCounters>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticFrameSource {
    /// Flat mid-gray frames of the given size
    pub fn gray(width: u32, height: u32, fps: u32) -> Self {
        let pattern = Bytes::from(vec![0x80u8; frame_len(width, height)]);
        Self::with_pattern("stub://gray".into(), pattern, width, height, fps)
    }

    /// Replay a still image, converted to 8-bit luma
    pub fn from_image(path: &Path, fps: u32) -> Result<Self, ScanError> {
        let name = format!("stub://{}", path.display());
        let image = image::open(path)
            .map_err(|e| ScanError::device_unavailable(name.clone(), e))?
            .to_luma8();
        let (width, height) = image.dimensions();
        let pattern = Bytes::from(image.into_raw());
        Ok(Self::with_pattern(name, pattern, width, height, fps))
    }

    pub fn from_config(config: &CaptureConfig) -> Result<Self, ScanError> {
        let target = config.device.path.trim_start_matches("stub://");
        let source = if !target.is_empty() && Path::new(target).is_file() {
            Self::from_image(Path::new(target), config.fps)?
        } else {
            Self::gray(config.width, config.height, config.fps)
        };
        Ok(source.rotated(config.rotation))
    }

    fn with_pattern(name: String, pattern: Bytes, width: u32, height: u32, fps: u32) -> Self {
        Self {
            name,
            pattern,
            template: FrameMetadata {
                sequence: 0,
                width,
                height,
                stride: width,
                format: PixelFormat::Gray8,
                rotation: Rotation::Deg0,
                device_timestamp: None,
            },
            interval: Duration::from_secs(1) / fps.max(1),
            limit: None,
            fail_after: None,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(SourceCounters::default()),
            worker: None,
        }
    }

    pub fn rotated(mut self, rotation: Rotation) -> Self {
        self.template.rotation = rotation;
        self
    }

    /// Stop producing after `frames` frames
    pub fn limited(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Report the device as lost after `frames` frames, like an unplugged camera
    pub fn failing_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn counters(&self) -> Arc<SourceCounters> {
        self.counters.clone()
    }
}

impl FrameSource for SyntheticFrameSource {
    fn start(
        &mut self,
        on_frame: FrameCallback,
        on_error: ErrorCallback,
    ) -> Result<(), ScanError> {
        if self.worker.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let counters = self.counters.clone();
        let pattern = self.pattern.clone();
        let template = self.template.clone();
        let interval = self.interval;
        let limit = self.limit;
        let fail_after = self.fail_after;
        let name = self.name.clone();

        let worker = thread::Builder::new()
            .name("synthetic-capture".into())
            .spawn(move || {
                let mut sequence = 0u64;
                while running.load(Ordering::Acquire) {
                    if limit.is_some_and(|limit| sequence >= limit) {
                        debug!("synthetic source reached its frame limit");
                        break;
                    }
                    if fail_after.is_some_and(|after| sequence >= after) {
                        if running.swap(false, Ordering::AcqRel) {
                            on_error(ScanError::device_unavailable(name, "device disconnected"));
                        }
                        break;
                    }
                    sequence += 1;
                    counters.delivered.fetch_add(1, Ordering::AcqRel);

                    let hook_counters = counters.clone();
                    let frame = Frame::new(
                        pattern.clone(),
                        FrameMetadata {
                            sequence,
                            ..template.clone()
                        },
                    )
                    .with_release(move |_| {
                        hook_counters.released.fetch_add(1, Ordering::AcqRel);
                    });
                    on_frame(frame);

                    thread::sleep(interval);
                }
            })
            .map_err(|e| ScanError::device_unavailable(self.name.clone(), e))?;

        info!("Synthetic capture started: {}", self.name);
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("synthetic capture thread panicked");
            }
            info!("Synthetic capture stopped: {}", self.name);
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Byte length of one 8-bit luma frame
fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

impl Drop for SyntheticFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_limited_source_delivers_sequenced_frames() {
        let mut source = SyntheticFrameSource::gray(4, 4, 1000)
            .rotated(Rotation::Deg180)
            .limited(5);
        let counters = source.counters();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        source
            .start(
                Arc::new(move |frame: Frame| {
                    assert_eq!(frame.meta().rotation, Rotation::Deg180);
                    assert_eq!(frame.data().len(), 16);
                    sink.lock().unwrap().push(frame.sequence());
                }),
                Arc::new(|error: ScanError| panic!("unexpected capture failure: {error}")),
            )
            .unwrap();

        // The limit ends the loop on its own; stop joins it
        while counters.delivered.load(Ordering::Acquire) < 5 {
            thread::sleep(Duration::from_millis(1));
        }
        source.stop();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(counters.outstanding(), 0);
    }

    #[test]
    fn test_failing_source_reports_device_loss_once() {
        let mut source = SyntheticFrameSource::gray(4, 4, 1000).failing_after(3);
        let counters = source.counters();
        let failures = Arc::new(Mutex::new(Vec::new()));

        let reported = failures.clone();
        source
            .start(
                Arc::new(|_frame: Frame| {}),
                Arc::new(move |error: ScanError| reported.lock().unwrap().push(error)),
            )
            .unwrap();

        while failures.lock().unwrap().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        source.stop();

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], ScanError::DeviceUnavailable { .. }));
        assert_eq!(counters.delivered.load(Ordering::Acquire), 3);
        assert_eq!(counters.outstanding(), 0);
    }

    #[test]
    fn test_stop_does_not_report_a_failure() {
        let mut source = SyntheticFrameSource::gray(4, 4, 1000).failing_after(u64::MAX);
        let counters = source.counters();
        let failed = Arc::new(AtomicBool::new(false));

        let flag = failed.clone();
        source
            .start(
                Arc::new(|_frame: Frame| {}),
                Arc::new(move |_error: ScanError| flag.store(true, Ordering::SeqCst)),
            )
            .unwrap();
        while counters.delivered.load(Ordering::Acquire) < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        source.stop();

        assert!(!failed.load(Ordering::SeqCst));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_frame_len_widens_before_multiplying() {
        assert_eq!(frame_len(70_000, 70_000), 4_900_000_000);
        assert_eq!(frame_len(4, 4), 16);
    }

    #[test]
    fn test_missing_image_is_device_unavailable() {
        let result = SyntheticFrameSource::from_image(Path::new("/nonexistent/code.png"), 10);
        assert!(matches!(result, Err(ScanError::DeviceUnavailable { .. })));
    }
}
