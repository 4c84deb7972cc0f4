//! Deterministic fakes for driving a scan session from tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use optiscan::capture::{FrameMetadata, PixelFormat, Rotation};
use optiscan::{
    DecodeError, DecodedPayload, Decoder, ErrorCallback, Frame, FrameCallback, FrameSource,
    ScanError,
};

/// Frame source whose frames are emitted by the test itself.
pub struct ManualSource {
    handle: Arc<SourceHandle>,
    fail_start: bool,
}

#[derive(Default)]
pub struct SourceHandle {
    callback: Mutex<Option<FrameCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    on_start: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    stop_gate: Mutex<Option<flume::Receiver<()>>>,
    released: Mutex<Vec<u64>>,
    pub started: AtomicBool,
    pub stops: AtomicUsize,
}

impl ManualSource {
    pub fn new() -> (Self, Arc<SourceHandle>) {
        let handle = Arc::new(SourceHandle::default());
        let source = Self {
            handle: handle.clone(),
            fail_start: false,
        };
        (source, handle)
    }

    /// A source whose device is always busy
    pub fn busy() -> (Self, Arc<SourceHandle>) {
        let (mut source, handle) = Self::new();
        source.fail_start = true;
        (source, handle)
    }
}

impl FrameSource for ManualSource {
    fn start(
        &mut self,
        on_frame: FrameCallback,
        on_error: ErrorCallback,
    ) -> Result<(), ScanError> {
        let hook = self.handle.on_start.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        if self.fail_start {
            return Err(ScanError::device_unavailable("manual://busy", "device busy"));
        }
        *self.handle.callback.lock().unwrap() = Some(on_frame);
        *self.handle.on_error.lock().unwrap() = Some(on_error);
        self.handle.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        let gate = self.handle.stop_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        self.handle.callback.lock().unwrap().take();
        self.handle.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "manual://test".into()
    }
}

impl SourceHandle {
    /// Deliver a frame as the capture thread would. Frames emitted after
    /// `stop` go straight to the callback kept by `late_callback`.
    pub fn emit(self: &Arc<Self>, sequence: u64) {
        let callback = self.callback.lock().unwrap().clone();
        let frame = self.frame(sequence);
        match callback {
            Some(callback) => callback(frame),
            None => frame.release(),
        }
    }

    /// Report the device as lost, as a capture thread does before exiting.
    /// The frame callback stays installed so stragglers can still be emitted.
    pub fn fail(&self, reason: &str) {
        let on_error = self.on_error.lock().unwrap().take();
        if let Some(on_error) = on_error {
            on_error(ScanError::device_unavailable("manual://test", reason));
        }
    }

    /// Run `hook` inside the next `start`, before the device is bound
    pub fn before_start(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_start.lock().unwrap() = Some(Box::new(hook));
    }

    /// Make the next `stop` block until the returned sender fires or is dropped
    pub fn hold_stop(&self) -> flume::Sender<()> {
        let (tx, rx) = flume::bounded(1);
        *self.stop_gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Keep a copy of the callback to simulate a capture thread that has not
    /// quiesced yet after `stop`.
    pub fn late_callback(&self) -> Option<FrameCallback> {
        self.callback.lock().unwrap().clone()
    }

    pub fn frame(self: &Arc<Self>, sequence: u64) -> Frame {
        let handle = self.clone();
        Frame::new(
            Bytes::from_static(&[0u8; 16]),
            FrameMetadata {
                sequence,
                width: 4,
                height: 4,
                stride: 4,
                format: PixelFormat::Gray8,
                rotation: Rotation::Deg0,
                device_timestamp: None,
            },
        )
        .with_release(move |meta| {
            handle.released.lock().unwrap().push(meta.sequence);
        })
    }

    pub fn released(&self) -> Vec<u64> {
        let mut released = self.released.lock().unwrap().clone();
        released.sort_unstable();
        released
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// Per-frame decode behaviour
pub struct Script {
    gate: Option<oneshot::Receiver<()>>,
    result: Result<Vec<String>, String>,
}

impl Script {
    pub fn found(payloads: &[&str]) -> Self {
        Self {
            gate: None,
            result: Ok(payloads.iter().map(|p| p.to_string()).collect()),
        }
    }

    pub fn fail(reason: &str) -> Self {
        Self {
            gate: None,
            result: Err(reason.to_string()),
        }
    }

    /// Hold the decode in flight until the returned sender fires or is dropped
    pub fn gated(mut self) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        self.gate = Some(rx);
        (self, tx)
    }
}

/// Decoder whose results are scripted per frame sequence. Unscripted frames
/// decode to an empty list.
pub struct ScriptedDecoder {
    scripts: Mutex<HashMap<u64, Script>>,
    seen: Mutex<Vec<u64>>,
    entered: flume::Sender<u64>,
    entered_rx: flume::Receiver<u64>,
    delay: Duration,
}

impl ScriptedDecoder {
    pub fn new() -> Self {
        let (entered, entered_rx) = flume::unbounded();
        Self {
            scripts: Mutex::new(HashMap::new()),
            seen: Mutex::new(Vec::new()),
            entered,
            entered_rx,
            delay: Duration::ZERO,
        }
    }

    /// Every decode takes at least this long
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn script(&self, sequence: u64, script: Script) {
        self.scripts.lock().unwrap().insert(sequence, script);
    }

    /// Frames that reached the decoder, in arrival order
    pub fn seen(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }

    /// Wait until the decoder has started on `sequence`
    pub async fn entered(&self, sequence: u64) {
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), self.entered_rx.recv_async())
                .await
                .expect("decoder was never entered")
                .expect("decoder channel closed");
            if next == sequence {
                return;
            }
        }
    }
}

#[async_trait]
impl Decoder for ScriptedDecoder {
    async fn decode(&self, frame: &Frame) -> Result<Vec<String>, DecodeError> {
        let sequence = frame.sequence();
        self.seen.lock().unwrap().push(sequence);
        let _ = self.entered.send(sequence);

        let script = self.scripts.lock().unwrap().remove(&sequence);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let Some(script) = script else {
            return Ok(Vec::new());
        };
        if let Some(gate) = script.gate {
            let _ = gate.await;
        }
        script.result.map_err(DecodeError::Worker)
    }
}

/// Sink that records every delivery
pub fn recording_sink() -> (Arc<dyn optiscan::ResultSink>, Arc<Mutex<Vec<String>>>) {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let log = delivered.clone();
    let sink = move |payload: DecodedPayload| {
        log.lock().unwrap().push(payload.into_string());
    };
    (Arc::new(sink), delivered)
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
