//! Downstream consumer of the committed payload

use tracing::warn;

use crate::error::ScanError;
use crate::pipeline::state::DecodedPayload;

/// How a scan session ended, as seen by the host
pub type ScanOutcome = Result<DecodedPayload, ScanError>;

/// Receives the end of a scan session.
///
/// A session calls exactly one of `deliver` or `fail`, at most once. `deliver`
/// runs after the state has moved to `Decoded`, on the decode worker that won
/// the commit. `fail` runs on the capture thread after the device was lost.
pub trait ResultSink: Send + Sync + 'static {
    fn deliver(&self, payload: DecodedPayload);

    /// Capture failed after the session started; the session is `Cancelled`.
    fn fail(&self, error: ScanError) {
        warn!("Scan session ended without a payload: {}", error);
    }
}

impl<F> ResultSink for F
where
    F: Fn(DecodedPayload) + Send + Sync + 'static,
{
    fn deliver(&self, payload: DecodedPayload) {
        self(payload)
    }
}

/// Hands the outcome to whoever holds the paired receiver, typically the task
/// that performs the record lookup.
pub struct ChannelSink {
    tx: flume::Sender<ScanOutcome>,
}

impl ChannelSink {
    pub fn new() -> (Self, flume::Receiver<ScanOutcome>) {
        // A session ends at most once
        let (tx, rx) = flume::bounded(1);
        (Self { tx }, rx)
    }

    fn send(&self, outcome: ScanOutcome) {
        if let Err(e) = self.tx.try_send(outcome) {
            warn!("Result receiver unavailable, outcome dropped: {}", e);
        }
    }
}

impl ResultSink for ChannelSink {
    fn deliver(&self, payload: DecodedPayload) {
        self.send(Ok(payload));
    }

    fn fail(&self, error: ScanError) {
        self.send(Err(error));
    }
}
