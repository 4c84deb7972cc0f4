//! Single-slot, overwrite-on-full frame buffer between capture and decode

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use metrics::counter;
use tracing::{debug, trace};

use crate::capture::Frame;

/// Outcome of `FrameSlot::offer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Stored and no decode is in flight: the caller should `take` it
    Ready,
    /// Stored behind an in-flight decode; handed off on `complete`
    Pending,
    /// Stored, and the previously pending frame was released unread
    Replaced,
    /// Slot closed; the frame was released immediately
    Rejected,
}

/// Keeps only the latest frame.
///
/// Offer, take and complete share one mutex so a replace-and-release can
/// never tear against a take. Evicted frames are released after the lock is
/// dropped but before the call returns.
pub struct FrameSlot {
    inner: Mutex<SlotState>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct SlotState {
    pending: Option<Frame>,
    in_flight: bool,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    offered: AtomicU64,
    replaced: AtomicU64,
    discarded: AtomicU64,
    submitted: AtomicU64,
}

/// Point-in-time slot counters.
///
/// Once the slot is closed, `replaced + discarded + submitted == offered`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub offered: u64,
    /// Released because a newer frame arrived
    pub replaced: u64,
    /// Released because the slot was closed
    pub discarded: u64,
    /// Handed out for decode
    pub submitted: u64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotState::default()),
            stats: CachePadded::new(Stats::default()),
        }
    }

    // Slot state is consistent at every panic point, so a poisoned lock is safe to reuse
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: store the frame, releasing whatever was pending.
    pub fn offer(&self, frame: Frame) -> Offer {
        self.stats.offered.fetch_add(1, Ordering::Relaxed);
        counter!("optiscan_frames_offered_total").increment(1);

        let mut state = self.lock();
        if state.closed {
            drop(state);
            self.discard(frame);
            return Offer::Rejected;
        }

        let sequence = frame.sequence();
        let evicted = state.pending.replace(frame);
        let idle = !state.in_flight;
        drop(state);

        match evicted {
            Some(old) => {
                trace!(
                    evicted = old.sequence(),
                    sequence,
                    "pending frame replaced"
                );
                self.stats.replaced.fetch_add(1, Ordering::Relaxed);
                counter!("optiscan_frames_replaced_total").increment(1);
                old.release();
                Offer::Replaced
            }
            None if idle => Offer::Ready,
            None => Offer::Pending,
        }
    }

    /// Consumer: claim the pending frame for decode.
    ///
    /// Returns `None` if the slot is empty, closed, or a decode is already in
    /// flight. A returned frame marks the slot in flight until `complete`.
    pub fn take(&self) -> Option<Frame> {
        let mut state = self.lock();
        self.claim(&mut state)
    }

    /// Finish the in-flight decode and claim the next pending frame, if any.
    pub fn complete(&self) -> Option<Frame> {
        let mut state = self.lock();
        state.in_flight = false;
        self.claim(&mut state)
    }

    fn claim(&self, state: &mut SlotState) -> Option<Frame> {
        if state.closed || state.in_flight {
            return None;
        }
        let frame = state.pending.take()?;
        state.in_flight = true;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        counter!("optiscan_frames_submitted_total").increment(1);
        Some(frame)
    }

    /// Reject all further offers and release the pending frame. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        let pending = state.pending.take();
        drop(state);

        if let Some(frame) = pending {
            debug!(sequence = frame.sequence(), "pending frame dropped on close");
            self.discard(frame);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn discard(&self, frame: Frame) {
        self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        counter!("optiscan_frames_discarded_total").increment(1);
        frame.release();
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            offered: self.stats.offered.load(Ordering::Relaxed),
            replaced: self.stats.replaced.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
            submitted: self.stats.submitted.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}
