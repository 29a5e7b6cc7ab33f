//! Capture pipeline: capture → encode → transmit on an adaptive cadence.
//!
//! The loop is lossy at every stage. At most one encode is in flight; a
//! cycle that finds the encoder busy skips its snapshot, and a frame the
//! transport cannot take right now is dropped rather than queued.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::encoder::{EncodeSettings, FrameEncoder, JpegFrameEncoder, RawSnapshot};
use super::rate::{RatePolicy, Signals};
use super::source::CaptureSource;
use crate::client::ConnectionStatus;
use crate::error::{CaptureError, EncodeError, StopReason};
use crate::protocol::Frame;

/// How long `start` waits for the transport to come up
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound side the loop pushes frames into
pub trait FrameSink: Send + Sync + 'static {
    fn is_open(&self) -> bool;
    /// Non-blocking; `false` means the frame was dropped
    fn send(&self, frame: &Frame) -> bool;
    fn status(&self) -> ConnectionStatus;
    fn subscribe_status(&self) -> mpsc::UnboundedReceiver<ConnectionStatus>;
    fn close(&self);
}

impl<T: FrameSink + ?Sized> FrameSink for Arc<T> {
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn send(&self, frame: &Frame) -> bool {
        (**self).send(frame)
    }

    fn status(&self) -> ConnectionStatus {
        (**self).status()
    }

    fn subscribe_status(&self) -> mpsc::UnboundedReceiver<ConnectionStatus> {
        (**self).subscribe_status()
    }

    fn close(&self) {
        (**self).close()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub cycles: u64,
    pub captured: u64,
    pub encoded: u64,
    pub sent: u64,
    /// Encoded but not taken by the transport, or older than what was already sent
    pub dropped: u64,
    /// Cycles that found the previous encode still running
    pub skipped: u64,
    pub encode_failures: u64,
    pub capture_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub reason: StopReason,
    pub stats: CaptureStats,
}

/// State shared between the loop task and its handle
struct Shared {
    source: Mutex<Box<dyn CaptureSource>>,
    sink: Box<dyn FrameSink>,
    state: watch::Sender<CaptureState>,
    reason: Mutex<Option<StopReason>>,
    cancel: CancellationToken,
}

impl Shared {
    /// Stop scheduling, release the source, close the transport. Idempotent;
    /// the first caller's reason wins.
    fn shutdown(&self, reason: StopReason) {
        {
            let mut current = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.cancel.cancel();
        self.source.lock().unwrap_or_else(|e| e.into_inner()).stop();
        self.sink.close();
        self.state.send_if_modified(|state| {
            let changed = *state != CaptureState::Stopped;
            *state = CaptureState::Stopped;
            changed
        });
    }

    fn reason(&self) -> Option<StopReason> {
        *self.reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_source<T>(&self, f: impl FnOnce(&mut dyn CaptureSource) -> T) -> T {
        let mut source = self.source.lock().unwrap_or_else(|e| e.into_inner());
        f(source.as_mut())
    }
}

struct InFlight {
    seq: u64,
    handle: JoinHandle<Result<Frame, EncodeError>>,
}

/// Everything a tick reads or updates, threaded explicitly through the loop
#[derive(Default)]
struct LoopState {
    next_seq: u64,
    last_delivered: Option<u64>,
    in_flight: Option<InFlight>,
    stats: CaptureStats,
}

impl LoopState {
    fn begin_encode(
        &mut self,
        encoder: &Arc<dyn FrameEncoder>,
        snapshot: RawSnapshot,
        settings: EncodeSettings,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let encoder = encoder.clone();
        let handle = tokio::task::spawn_blocking(move || encoder.encode(&snapshot, settings));
        self.in_flight = Some(InFlight { seq, handle });
    }

    fn finish_encode(
        &mut self,
        seq: u64,
        result: Result<Result<Frame, EncodeError>, JoinError>,
        sink: &dyn FrameSink,
    ) {
        let frame = match result {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                self.stats.encode_failures += 1;
                debug!("skipping frame {}: {}", seq, e);
                return;
            }
            Err(e) => {
                self.stats.encode_failures += 1;
                warn!("encode task failed: {}", e);
                return;
            }
        };
        self.stats.encoded += 1;

        // Late frames are dropped, never delivered out of order
        if self.last_delivered.is_some_and(|last| seq <= last) {
            self.stats.dropped += 1;
            return;
        }
        if sink.is_open() && sink.send(&frame) {
            self.stats.sent += 1;
            self.last_delivered = Some(seq);
        } else {
            self.stats.dropped += 1;
        }
    }
}

async fn join_in_flight(
    in_flight: &mut Option<InFlight>,
) -> (u64, Result<Result<Frame, EncodeError>, JoinError>) {
    match in_flight {
        Some(job) => (job.seq, (&mut job.handle).await),
        None => std::future::pending().await,
    }
}

/// A configured, not yet running pipeline
pub struct CaptureLoop {
    source: Box<dyn CaptureSource>,
    sink: Box<dyn FrameSink>,
    encoder: Arc<dyn FrameEncoder>,
    signals: Signals,
    policy: RatePolicy,
    connect_timeout: Duration,
}

impl CaptureLoop {
    pub fn new(source: impl CaptureSource, sink: impl FrameSink, signals: Signals) -> Self {
        Self {
            source: Box::new(source),
            sink: Box::new(sink),
            encoder: Arc::new(JpegFrameEncoder),
            signals,
            policy: RatePolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_encoder(mut self, encoder: impl FrameEncoder) -> Self {
        self.encoder = Arc::new(encoder);
        self
    }

    pub fn with_policy(mut self, policy: RatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Spawn the loop. It stays `Idle` until the transport is connected.
    pub fn start(self) -> CaptureHandle {
        let (state_tx, state_rx) = watch::channel(CaptureState::Idle);
        let shared = Arc::new(Shared {
            source: Mutex::new(self.source),
            sink: self.sink,
            state: state_tx,
            reason: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let task = tokio::spawn(run(
            shared.clone(),
            self.encoder,
            self.signals,
            self.policy,
            self.connect_timeout,
        ));

        CaptureHandle {
            shared,
            state: state_rx,
            task,
        }
    }
}

pub struct CaptureHandle {
    shared: Arc<Shared>,
    state: watch::Receiver<CaptureState>,
    task: JoinHandle<CaptureReport>,
}

impl CaptureHandle {
    /// Halt scheduling, release the source and close the transport.
    /// Safe to call any number of times.
    pub fn stop(&self) {
        self.shared.shutdown(StopReason::Requested);
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<CaptureState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end
    pub async fn wait(self) -> CaptureReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                warn!("capture loop task failed: {}", e);
                self.shared.shutdown(StopReason::Requested);
                CaptureReport {
                    reason: self.shared.reason().unwrap_or(StopReason::Requested),
                    stats: CaptureStats::default(),
                }
            }
        }
    }
}

async fn wait_for_link(
    sink: &dyn FrameSink,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<(), StopReason> {
    let mut changes = sink.subscribe_status();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        match sink.status() {
            ConnectionStatus::Connected => return Ok(()),
            ConnectionStatus::Error => return Err(StopReason::ConnectFailed),
            ConnectionStatus::Connecting | ConnectionStatus::Disconnected => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(StopReason::Requested),
            _ = &mut deadline => return Err(StopReason::ConnectFailed),
            change = changes.recv() => {
                if change.is_none() {
                    return Err(StopReason::ConnectFailed);
                }
            }
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    encoder: Arc<dyn FrameEncoder>,
    signals: Signals,
    policy: RatePolicy,
    connect_timeout: Duration,
) -> CaptureReport {
    let mut state = LoopState::default();

    if let Err(reason) = wait_for_link(shared.sink.as_ref(), &shared.cancel, connect_timeout).await {
        info!("capture not started: {}", reason);
        shared.shutdown(reason);
        return CaptureReport {
            reason: shared.reason().unwrap_or(reason),
            stats: state.stats,
        };
    }
    shared.state.send_if_modified(|s| {
        let idle = *s == CaptureState::Idle;
        if idle {
            *s = CaptureState::Capturing;
        }
        idle
    });
    info!("capture started");

    let reason = 'cycle: loop {
        if shared.cancel.is_cancelled() {
            break StopReason::Requested;
        }
        if !shared.with_source(|source| source.is_active()) {
            break StopReason::StreamEnded;
        }
        if !shared.sink.is_open() {
            break StopReason::TransportClosed;
        }

        let attention = signals.attention();
        let visible = signals.visible();
        let delay = policy.next_delay(attention, visible);
        state.stats.cycles += 1;

        if state.in_flight.is_some() {
            state.stats.skipped += 1;
        } else {
            match shared.with_source(|source| source.snapshot()) {
                Ok(snapshot) => {
                    state.stats.captured += 1;
                    state.begin_encode(&encoder, snapshot, policy.settings(attention, visible));
                }
                Err(CaptureError::NoFrame) => {}
                Err(e) => {
                    state.stats.capture_failures += 1;
                    debug!("capture failed: {}", e);
                }
            }
        }

        let tick = tokio::time::sleep(delay);
        tokio::pin!(tick);
        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => break 'cycle StopReason::Requested,
                (seq, result) = join_in_flight(&mut state.in_flight), if state.in_flight.is_some() => {
                    state.in_flight = None;
                    state.finish_encode(seq, result, shared.sink.as_ref());
                }
                _ = &mut tick => break,
            }
        }
    };

    // The final frame of a finished stream is still worth delivering
    if reason == StopReason::StreamEnded {
        if let Some(job) = state.in_flight.take() {
            let result = job.handle.await;
            state.finish_encode(job.seq, result, shared.sink.as_ref());
        }
    }

    shared.shutdown(reason);
    let reason = shared.reason().unwrap_or(reason);
    info!(
        %reason,
        sent = state.stats.sent,
        dropped = state.stats.dropped,
        skipped = state.stats.skipped,
        "capture stopped"
    );
    CaptureReport {
        reason,
        stats: state.stats,
    }
}
