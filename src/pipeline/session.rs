//! Scan session: coordinates capture, backpressure, decode and the single commit.
//!
//! Three threads of control touch a session:
//! - the source's capture thread, delivering frames through `offer` and
//!   reporting device loss through `device_lost`
//! - Tokio workers running decode completions
//! - the host thread calling `activate` / `deactivate`
//!
//! The state cell is the single source of truth for "still scanning". Every
//! transition is a compare-and-commit, and the slot is closed right after a
//! terminal transition so no frame is handed to the decoder afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use metrics::counter;
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

use crate::capture::{CapturePermission, ErrorCallback, Frame, FrameCallback, FrameSource};
use crate::decode::Decoder;
use crate::error::{DecodeError, ScanError};
use crate::pipeline::sink::ResultSink;
use crate::pipeline::slot::{FrameSlot, Offer};
use crate::pipeline::state::{DecodedPayload, ScanState, StateCell};
use crate::ScannerConfig;

/// Live scan bound to one host screen.
///
/// `deactivate` joins the capture thread, so call it from the host thread
/// rather than from inside a frame callback or on an async worker. Dropping
/// the session cancels it at once and stops capture on the blocking pool when
/// a Tokio runtime is current, inline otherwise.
pub struct ScanSession {
    core: Arc<SessionCore>,
}

struct SessionCore {
    state: StateCell,
    slot: FrameSlot,
    source: Mutex<Box<dyn FrameSource>>,
    decoder: Arc<dyn Decoder>,
    sink: Arc<dyn ResultSink>,
    permission: Arc<dyn CapturePermission>,
    runtime: Handle,
    config: ScannerConfig,
    stats: CachePadded<CompletionStats>,
}

#[derive(Default)]
struct CompletionStats {
    completed: AtomicU64,
    decode_errors: AtomicU64,
    late: AtomicU64,
}

/// Frame and completion accounting for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub offered: u64,
    /// Released by the slot because a newer frame arrived
    pub replaced: u64,
    /// Released by the slot after the session ended
    pub discarded: u64,
    /// Taken from the slot for decode
    pub submitted: u64,
    /// Released by the decode completion handler
    pub completed: u64,
    pub decode_errors: u64,
    /// Completions that arrived after the session ended
    pub late_completions: u64,
}

impl ScanStats {
    /// Frames whose buffer has been closed
    pub fn released(&self) -> u64 {
        self.replaced + self.discarded + self.completed
    }
}

impl ScanSession {
    /// Build a session in `Idle`. Must be called inside a Tokio runtime; decode
    /// completions are spawned onto it.
    pub fn new(
        config: ScannerConfig,
        source: Box<dyn FrameSource>,
        decoder: Arc<dyn Decoder>,
        sink: Arc<dyn ResultSink>,
        permission: Arc<dyn CapturePermission>,
    ) -> Result<Self, ScanError> {
        let runtime = Handle::try_current().map_err(|_| ScanError::NoRuntime)?;
        Ok(Self {
            core: Arc::new(SessionCore {
                state: StateCell::new(),
                slot: FrameSlot::new(),
                source: Mutex::new(source),
                decoder,
                sink,
                permission,
                runtime,
                config,
                stats: CachePadded::new(CompletionStats::default()),
            }),
        })
    }

    /// Host screen became active: check permission, enter `Scanning`, start capture.
    ///
    /// `PermissionDenied` leaves the session `Idle` so it can be activated again
    /// once the grant arrives. `DeviceUnavailable` ends the session, whether it
    /// comes from here or later through the sink's `fail`.
    pub fn activate(&self) -> Result<(), ScanError> {
        let core = &self.core;
        match core.state.get() {
            ScanState::Idle => {}
            ScanState::Scanning => return Err(ScanError::AlreadyActive),
            _ => return Err(ScanError::SessionFinished),
        }

        if !core.permission.is_granted() {
            warn!("Capture permission not granted, scanning not started");
            return Err(ScanError::PermissionDenied);
        }

        if let Err(state) = core.state.begin() {
            return Err(match state {
                ScanState::Scanning => ScanError::AlreadyActive,
                _ => ScanError::SessionFinished,
            });
        }

        let weak = Arc::downgrade(core);
        let on_frame: FrameCallback = Arc::new(move |frame: Frame| match weak.upgrade() {
            Some(core) => core.offer(frame),
            None => frame.release(),
        });
        let weak = Arc::downgrade(core);
        let on_error: ErrorCallback = Arc::new(move |error: ScanError| {
            if let Some(core) = weak.upgrade() {
                core.device_lost(error);
            }
        });

        let mut source = core.lock_source();
        let device = source.describe();
        if let Err(e) = source.start(on_frame, on_error) {
            drop(source);
            error!("Scan session failed to start capture on {}: {}", device, e);
            let _ = core.state.cancel();
            core.slot.close();
            return Err(e);
        }

        // A deactivate that slipped in before the lock found nothing to stop
        if core.state.get() == ScanState::Cancelled {
            source.stop();
            debug!("Scan session cancelled while capture was starting");
            return Err(ScanError::SessionFinished);
        }

        info!("Scan session active on {}", device);
        Ok(())
    }

    /// Host screen went away. Cancels if nothing has committed yet, stops
    /// capture, and lets any in-flight decode finish into the void. Idempotent.
    pub fn deactivate(&self) {
        self.core.end();
        self.core.stop_source();
    }

    pub fn state(&self) -> ScanState {
        self.core.state.get()
    }

    pub fn stats(&self) -> ScanStats {
        let slot = self.core.slot.stats();
        let stats = &self.core.stats;
        ScanStats {
            offered: slot.offered,
            replaced: slot.replaced,
            discarded: slot.discarded,
            submitted: slot.submitted,
            completed: stats.completed.load(Ordering::Acquire),
            decode_errors: stats.decode_errors.load(Ordering::Relaxed),
            late_completions: stats.late.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.core.end();
        match Handle::try_current() {
            Ok(runtime) => {
                let core = self.core.clone();
                runtime.spawn_blocking(move || core.stop_source());
            }
            Err(_) => self.core.stop_source(),
        }
    }
}

impl SessionCore {
    // The boxed source is only ever stopped or started under this lock
    fn lock_source(&self) -> MutexGuard<'_, Box<dyn FrameSource>> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_source(&self) {
        self.lock_source().stop();
    }

    /// Cancel unless already terminal, then close the slot.
    fn end(&self) {
        match self.state.cancel() {
            Ok(()) => {
                info!("Scan session cancelled");
                counter!("optiscan_sessions_cancelled_total").increment(1);
            }
            Err(state) => debug!("Scan session deactivated in state {}", state),
        }
        self.slot.close();
    }

    /// Capture thread entry point for a fatal device failure. The thread is
    /// exiting on its own, so the source is left for `deactivate` to join.
    fn device_lost(&self, error: ScanError) {
        match self.state.cancel() {
            Ok(()) => {
                error!("Capture lost, scan session cancelled: {}", error);
                counter!("optiscan_sessions_cancelled_total").increment(1);
                counter!("optiscan_device_lost_total").increment(1);
                self.slot.close();
                self.sink.fail(error);
            }
            Err(state) => debug!("Capture failure after session ended in {}: {}", state, error),
        }
    }

    /// Capture thread entry point. Never waits on a decode.
    fn offer(self: &Arc<Self>, frame: Frame) {
        let sequence = frame.sequence();
        match self.slot.offer(frame) {
            Offer::Ready => {
                if let Some(frame) = self.slot.take() {
                    self.dispatch(frame);
                }
            }
            Offer::Replaced => trace!(sequence, "frame replaced pending frame"),
            Offer::Pending => trace!(sequence, "frame waiting behind in-flight decode"),
            Offer::Rejected => trace!(sequence, "frame rejected by closed slot"),
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        let core = self.clone();
        self.runtime.spawn(async move { core.complete(frame).await });
    }

    /// Decode one frame, release it, and arbitrate the result.
    async fn complete(self: Arc<Self>, frame: Frame) {
        let sequence = frame.sequence();

        let outcome = if self.state.is_scanning() {
            let decoder = self.decoder.clone();
            // The worker owns the frame and releases it on every exit path,
            // unwinding included, before its join handle resolves
            let worker = self.runtime.spawn(async move {
                let result = decoder.decode(&frame).await;
                frame.release();
                result
            });
            worker
                .await
                .unwrap_or_else(|e| Err(DecodeError::Worker(e.to_string())))
        } else {
            frame.release();
            Ok(Vec::new())
        };
        self.stats.completed.fetch_add(1, Ordering::AcqRel);

        let candidates = outcome.unwrap_or_else(|e| {
            warn!(sequence, "Decode failed, treating frame as empty: {}", e);
            self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            counter!("optiscan_decode_errors_total").increment(1);
            Vec::new()
        });

        match candidates.into_iter().find(|c| !c.is_empty()) {
            Some(payload) => self.commit(sequence, DecodedPayload::new(payload)),
            None if !self.state.is_scanning() => self.discard_late(sequence),
            None => trace!(sequence, "no code in frame"),
        }

        // Hand the decode slot to the newest frame; a closed slot yields nothing
        if let Some(next) = self.slot.complete() {
            self.dispatch(next);
        }
    }

    fn commit(self: &Arc<Self>, sequence: u64, payload: DecodedPayload) {
        if let Err(state) = self.state.commit(payload.clone()) {
            debug!(sequence, "payload {:?} arrived after {}", payload.as_str(), state);
            self.discard_late(sequence);
            return;
        }

        info!(sequence, "Payload committed: {}", payload);
        counter!("optiscan_sessions_committed_total").increment(1);
        self.slot.close();
        self.sink.deliver(payload);

        if self.config.stop_on_commit {
            // Stopping joins the capture thread; keep that off the async workers
            let core = self.clone();
            self.runtime.spawn_blocking(move || core.stop_source());
        }
    }

    fn discard_late(&self, sequence: u64) {
        trace!(sequence, "late completion discarded");
        self.stats.late.fetch_add(1, Ordering::Relaxed);
        counter!("optiscan_late_completions_total").increment(1);
    }
}
