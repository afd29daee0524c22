// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Transfer Engine
//!
//! Keeps a fixed number of bulk reads in flight and feeds every completed
//! buffer to the raster decoder, then resubmits the same buffer.
//!
//! ```text
//!   submit ──▶ [in flight] ──▶ completion ──┬─ stopped         → discard
//!     ▲                                     ├─ N > 0 bytes     → decode, handled += 1
//!     │                                     ├─ 0 bytes / error → empty += 1
//!     │                                     └─ disconnected    → halt
//!     └──────────────── resubmit same buffer (failure → halt) ◀─┘
//! ```
//!
//! A halted engine cancels whatever is still in flight so the active count
//! drains to zero. The pump then drops it, which releases its bulk queue and
//! with it the interface claim, and marks its counters retired; the watchdog
//! takes it from there.

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flume::RecvTimeoutError;
use log::{debug, error, info, warn};

use crate::decoder::RasterDecoder;
use crate::error::{CaptureError, LastError, Result};
use crate::protocol::{BULK_PACKET_SIZE, DEFAULT_TRANSFER_COUNT, TRANSFER_CHUNK_SIZE};
use crate::usb::BulkQueue;

/// Default per-transfer timeout
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(100);

/// How long the pump waits for an engine while it has nothing in flight
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Transfer pool settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Transfers kept in flight
    pub count: usize,
    /// Bytes per transfer, a multiple of the bulk packet size
    pub chunk_size: usize,
    /// Per-transfer timeout
    pub timeout: Duration,
    /// Consecutive empty completions tolerated before halting
    pub empty_budget: Option<u32>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_TRANSFER_COUNT,
            chunk_size: TRANSFER_CHUNK_SIZE,
            timeout: DEFAULT_TRANSFER_TIMEOUT,
            empty_budget: None,
        }
    }
}

impl TransferConfig {
    /// Validate the transfer settings
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(CaptureError::InvalidConfig(
                "transfer count must be non-zero".to_string(),
            ));
        }
        if self.chunk_size == 0 || self.chunk_size % BULK_PACKET_SIZE != 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "transfer size {:#x} must be a non-zero multiple of {BULK_PACKET_SIZE:#x}",
                self.chunk_size
            )));
        }
        if self.timeout.is_zero() {
            return Err(CaptureError::InvalidConfig(
                "transfer timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pipeline liveness counters, replaced on every pipeline start
#[derive(Debug, Default)]
pub struct HealthCounters {
    /// Transfers submitted and not yet completed
    active: AtomicIsize,
    /// Completions that carried data
    handled: AtomicU64,
    /// Zero-byte and failed completions
    empty: AtomicU64,
    /// Empty completions since the last data
    consecutive_empty: AtomicU32,
    /// Frames completed by this pipeline
    frames: AtomicU64,
    /// Pipeline stopped itself after a fatal transfer error
    halted: AtomicBool,
    /// The halted engine was dropped by the pump
    retired: AtomicBool,
}

/// Point-in-time copy of [`HealthCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Transfers in flight
    pub active: isize,
    /// Completions that carried data
    pub handled: u64,
    /// Zero-byte and failed completions
    pub empty: u64,
    /// Frames completed
    pub frames: u64,
    /// Pipeline stopped itself
    pub halted: bool,
}

impl HealthCounters {
    /// Fresh counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Transfers in flight
    pub fn active(&self) -> isize {
        self.active.load(Ordering::Acquire)
    }

    /// Whether the pipeline stopped itself
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Whether the engine reporting here has been dropped
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn mark_halted(&self) {
        self.halted.store(true, Ordering::Release);
    }

    /// Nothing in flight and no halted engine still holding the device
    pub fn needs_restart(&self) -> bool {
        self.active() <= 0 && (!self.is_halted() || self.is_retired())
    }

    /// Copy all counters
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            active: self.active(),
            handled: self.handled.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            halted: self.is_halted(),
        }
    }
}

/// What one completion did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Data decoded and the buffer resubmitted
    Decoded {
        /// Samples decoded
        bytes: usize,
        /// Frames completed by this pass
        frames: usize,
    },
    /// Zero bytes or a recoverable error; buffer resubmitted
    Empty,
    /// Completion arrived after a stop; buffer dropped
    Discarded,
    /// Fatal failure; the engine halted
    Halted,
}

/// Pool of in-flight bulk reads on one bulk queue
pub struct TransferEngine<Q: BulkQueue> {
    queue: Q,
    config: TransferConfig,
    health: Arc<HealthCounters>,
    shutdown: Arc<AtomicBool>,
    last_error: Arc<LastError>,
}

impl<Q: BulkQueue> TransferEngine<Q> {
    /// Create an engine over `queue` reporting into `health`
    pub fn new(
        queue: Q,
        config: TransferConfig,
        health: Arc<HealthCounters>,
        shutdown: Arc<AtomicBool>,
        last_error: Arc<LastError>,
    ) -> Self {
        Self {
            queue,
            config,
            health,
            shutdown,
            last_error,
        }
    }

    /// Counters this engine reports into
    pub fn health(&self) -> &Arc<HealthCounters> {
        &self.health
    }

    /// Transfers the queue still holds
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Whether completions are being discarded
    pub fn is_stopped(&self) -> bool {
        self.health.is_halted() || self.shutdown.load(Ordering::Acquire)
    }

    /// Allocate one chunk buffer and submit it
    pub fn submit(&mut self) -> Result<()> {
        self.submit_buffer(Vec::with_capacity(self.config.chunk_size))
    }

    /// Submit `count` fresh transfers
    pub fn submit_all(&mut self) -> Result<()> {
        for _ in 0..self.config.count {
            self.submit()?;
        }
        debug!("Submitted {} bulk transfers", self.config.count);
        Ok(())
    }

    fn submit_buffer(&mut self, buf: Vec<u8>) -> Result<()> {
        self.queue
            .submit(buf, self.config.chunk_size)
            .map_err(|e| CaptureError::Submission(e.to_string()))?;
        self.health.active.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Stop the pipeline: record `err`, flag the halt and cancel what is
    /// still in flight
    pub fn halt(&mut self, err: &CaptureError) {
        error!("Transfer pipeline halted: {err}");
        self.last_error.set(err.to_string());
        self.health.mark_halted();
        self.queue.cancel_all();
    }

    /// Handle one completion if there is one, without blocking
    pub fn poll(&mut self, decoder: &mut RasterDecoder) -> Option<CompletionOutcome> {
        let completion = self.queue.poll_complete()?;
        self.health.active.fetch_sub(1, Ordering::AcqRel);

        if self.is_stopped() {
            return Some(CompletionOutcome::Discarded);
        }

        let outcome = match completion.status {
            Ok(()) if !completion.data.is_empty() => {
                let bytes = completion.data.len();
                let frames = decoder.decode(&completion.data);
                self.health.handled.fetch_add(1, Ordering::Relaxed);
                self.health.consecutive_empty.store(0, Ordering::Relaxed);
                self.health.frames.fetch_add(frames as u64, Ordering::Relaxed);
                CompletionOutcome::Decoded { bytes, frames }
            }
            Err(e) if e.is_fatal() => {
                self.halt(&CaptureError::TransferFailure(e.to_string()));
                return Some(CompletionOutcome::Halted);
            }
            status => {
                if let Err(e) = status {
                    debug!("Bulk transfer returned {e}, resubmitting");
                }
                self.health.empty.fetch_add(1, Ordering::Relaxed);
                let run = self.health.consecutive_empty.fetch_add(1, Ordering::Relaxed) + 1;
                if self.config.empty_budget.is_some_and(|budget| run > budget) {
                    self.halt(&CaptureError::TransferFailure(format!(
                        "{run} consecutive empty transfers"
                    )));
                    return Some(CompletionOutcome::Halted);
                }
                CompletionOutcome::Empty
            }
        };

        if let Err(e) = self.submit_buffer(completion.data) {
            self.halt(&e);
            return Some(CompletionOutcome::Halted);
        }
        Some(outcome)
    }
}

/// Completion-servicing loop. Owns the decoder, so decode passes never
/// overlap.
///
/// New engines arrive over a channel; the newest one replaces the current
/// engine, whose remaining transfers are dropped with it.
pub struct EventPump<Q: BulkQueue> {
    decoder: RasterDecoder,
    engines: flume::Receiver<TransferEngine<Q>>,
    engine: Option<TransferEngine<Q>>,
    shutdown: Arc<AtomicBool>,
}

impl<Q: BulkQueue> EventPump<Q> {
    /// Create a pump with no engine yet
    pub fn new(
        decoder: RasterDecoder,
        engines: flume::Receiver<TransferEngine<Q>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            decoder,
            engines,
            engine: None,
            shutdown,
        }
    }

    /// Decoder driven by this pump
    pub fn decoder(&self) -> &RasterDecoder {
        &self.decoder
    }

    fn install(&mut self, engine: TransferEngine<Q>) {
        if self.engine.replace(engine).is_some() {
            debug!("Replaced transfer engine");
        }
    }

    /// Whether an engine is installed
    pub fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    /// Drop the current engine once it has halted and drained
    fn retire_halted(&mut self) {
        let drained = self
            .engine
            .as_ref()
            .is_some_and(|e| e.health.is_halted() && e.pending() == 0);
        if !drained {
            return;
        }
        if let Some(engine) = self.engine.take() {
            let health = Arc::clone(&engine.health);
            drop(engine);
            health.retired.store(true, Ordering::Release);
            info!("Halted transfer engine released");
        }
    }

    /// Take any new engine, then service at most one completion.
    /// Returns whether a completion was handled.
    pub fn spin_once(&mut self) -> bool {
        while let Ok(engine) = self.engines.try_recv() {
            self.install(engine);
        }

        let handled = match self.engine.as_mut() {
            Some(engine) => engine.poll(&mut self.decoder).is_some(),
            None => false,
        };
        self.retire_halted();
        handled
    }

    /// Service completions until shutdown or until every engine sender is
    /// gone
    pub fn run(mut self) {
        info!("Transfer event pump started");

        while !self.shutdown.load(Ordering::Acquire) {
            if self.spin_once() {
                continue;
            }

            let idle = self.engine.as_ref().is_none_or(|e| e.pending() == 0);
            if !idle {
                thread::yield_now();
                continue;
            }

            match self.engines.recv_timeout(IDLE_WAIT) {
                Ok(engine) => self.install(engine),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Engine channel closed, stopping event pump");
                    break;
                }
            }
        }

        info!("Transfer event pump stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DisplayOptions;
    use crate::frame_store::FrameStore;
    use crate::mode::Mode;
    use crate::protocol::{BULK_IN_ENDPOINT, FX2_FIRMWARE_ID};
    use crate::usb::mock::{MockCompletion, MockQueue, MockUsb};
    use crate::usb::{UsbBackend, UsbError, UsbHandle};

    struct Fixture {
        usb: MockUsb,
        engine: TransferEngine<MockQueue>,
        decoder: RasterDecoder,
        last_error: Arc<LastError>,
    }

    fn fixture(config: TransferConfig) -> Fixture {
        let usb = MockUsb::new();
        usb.plug(FX2_FIRMWARE_ID);
        let handle = usb.open(FX2_FIRMWARE_ID).unwrap();
        let last_error = Arc::new(LastError::default());
        let engine = TransferEngine::new(
            handle.bulk_in_queue(BULK_IN_ENDPOINT, config.timeout),
            config,
            Arc::new(HealthCounters::new()),
            Arc::new(AtomicBool::new(false)),
            Arc::clone(&last_error),
        );
        let decoder = RasterDecoder::new(
            Mode::Uknc,
            Arc::new(FrameStore::for_mode(Mode::Uknc)),
            Arc::new(DisplayOptions::default()),
        )
        .unwrap();
        Fixture {
            usb,
            engine,
            decoder,
            last_error,
        }
    }

    #[test]
    fn test_config_validation() {
        TransferConfig::default().validate().unwrap();

        let unaligned = TransferConfig {
            chunk_size: 1000,
            ..TransferConfig::default()
        };
        unaligned.validate().unwrap_err();

        let no_transfers = TransferConfig {
            count: 0,
            ..TransferConfig::default()
        };
        no_transfers.validate().unwrap_err();
    }

    #[test]
    fn test_submit_all_counts_active() {
        let mut f = fixture(TransferConfig::default());
        f.engine.submit_all().unwrap();
        assert_eq!(f.engine.health().active(), 4);
        assert_eq!(f.usb.submitted(), 4);
    }

    #[test]
    fn test_failed_submit_leaves_counter() {
        let mut f = fixture(TransferConfig::default());
        f.usb.limit_submissions(Some(2));
        let err = f.engine.submit_all().unwrap_err();
        assert!(matches!(err, CaptureError::Submission(_)));
        assert_eq!(f.engine.health().active(), 2);
    }

    #[test]
    fn test_data_completion_decodes_and_resubmits() {
        let mut f = fixture(TransferConfig::default());
        f.engine.submit_all().unwrap();
        assert!(f.engine.poll(&mut f.decoder).is_none());

        f.usb.push_data(vec![0xF0; 1000]);
        let outcome = f.engine.poll(&mut f.decoder).unwrap();
        assert_eq!(
            outcome,
            CompletionOutcome::Decoded {
                bytes: 1000,
                frames: 0
            }
        );
        assert_eq!(f.decoder.state().offset, 1000);

        let health = f.engine.health().snapshot();
        assert_eq!(health.active, 4);
        assert_eq!(health.handled, 1);
        assert_eq!(f.usb.submitted(), 5);
    }

    #[test]
    fn test_empty_and_error_completions_resubmit() {
        let mut f = fixture(TransferConfig::default());
        f.engine.submit_all().unwrap();
        f.usb.push_completion(MockCompletion::Empty);
        f.usb.push_completion(MockCompletion::Error(UsbError::Stall));

        assert_eq!(f.engine.poll(&mut f.decoder), Some(CompletionOutcome::Empty));
        assert_eq!(f.engine.poll(&mut f.decoder), Some(CompletionOutcome::Empty));

        let health = f.engine.health().snapshot();
        assert_eq!(health.empty, 2);
        assert_eq!(health.active, 4);
        assert!(!health.halted);
        assert_eq!(f.decoder.state().offset, 0);
    }

    #[test]
    fn test_failed_resubmit_halts() {
        let mut f = fixture(TransferConfig::default());
        f.engine.submit_all().unwrap();
        f.usb.limit_submissions(Some(4));
        f.usb.push_data(vec![0xF0; 16]);

        assert_eq!(f.engine.poll(&mut f.decoder), Some(CompletionOutcome::Halted));
        assert!(f.engine.is_stopped());
        assert!(f.last_error.get().is_some());

        // the rest drain as cancelled and are discarded
        for _ in 0..3 {
            assert_eq!(
                f.engine.poll(&mut f.decoder),
                Some(CompletionOutcome::Discarded)
            );
        }
        assert_eq!(f.engine.health().active(), 0);
    }

    #[test]
    fn test_disconnect_halts() {
        let mut f = fixture(TransferConfig::default());
        f.engine.submit_all().unwrap();
        f.usb
            .push_completion(MockCompletion::Error(UsbError::Disconnected));

        assert_eq!(f.engine.poll(&mut f.decoder), Some(CompletionOutcome::Halted));
        assert_eq!(f.engine.health().active(), 3);
        assert_eq!(f.usb.submitted(), 4);
    }

    #[test]
    fn test_empty_budget() {
        let config = TransferConfig {
            empty_budget: Some(2),
            ..TransferConfig::default()
        };
        let mut f = fixture(config);
        f.engine.submit_all().unwrap();
        for _ in 0..3 {
            f.usb.push_completion(MockCompletion::Empty);
        }

        assert_eq!(f.engine.poll(&mut f.decoder), Some(CompletionOutcome::Empty));
        assert_eq!(f.engine.poll(&mut f.decoder), Some(CompletionOutcome::Empty));
        assert_eq!(f.engine.poll(&mut f.decoder), Some(CompletionOutcome::Halted));
        assert!(f
            .last_error
            .get()
            .unwrap()
            .contains("3 consecutive empty transfers"));
    }

    #[test]
    fn test_data_resets_empty_run() {
        let config = TransferConfig {
            empty_budget: Some(1),
            ..TransferConfig::default()
        };
        let mut f = fixture(config);
        f.engine.submit_all().unwrap();
        f.usb.push_completion(MockCompletion::Empty);
        f.usb.push_data(vec![0xF0; 4]);
        f.usb.push_completion(MockCompletion::Empty);

        for _ in 0..3 {
            assert_ne!(f.engine.poll(&mut f.decoder), Some(CompletionOutcome::Halted));
        }
    }

    #[test]
    fn test_shutdown_discards() {
        let mut f = fixture(TransferConfig::default());
        f.engine.submit_all().unwrap();
        f.engine.shutdown.store(true, Ordering::Release);
        f.usb.push_data(vec![0xF0; 16]);

        assert_eq!(
            f.engine.poll(&mut f.decoder),
            Some(CompletionOutcome::Discarded)
        );
        assert_eq!(f.decoder.state().offset, 0);
        assert_eq!(f.usb.submitted(), 4);
    }

    #[test]
    fn test_pump_installs_engine() {
        let f = fixture(TransferConfig::default());
        let (tx, rx) = flume::unbounded();
        let mut pump = EventPump::new(f.decoder, rx, Arc::new(AtomicBool::new(false)));
        assert!(!pump.spin_once());

        let mut engine = f.engine;
        engine.submit_all().unwrap();
        tx.send(engine).unwrap();
        f.usb.push_data(vec![0xF0; 32]);

        assert!(pump.spin_once());
        assert_eq!(pump.decoder().state().offset, 32);
    }

    #[test]
    fn test_pump_releases_halted_engine() {
        let config = TransferConfig {
            empty_budget: Some(0),
            ..TransferConfig::default()
        };
        let f = fixture(config);
        let (tx, rx) = flume::unbounded();
        let mut pump = EventPump::new(f.decoder, rx, Arc::new(AtomicBool::new(false)));

        let mut engine = f.engine;
        engine.submit_all().unwrap();
        let health = Arc::clone(engine.health());
        tx.send(engine).unwrap();
        f.usb.push_completion(MockCompletion::Empty);

        assert!(pump.spin_once());
        assert!(health.is_halted());
        assert!(pump.has_engine());
        assert!(!health.needs_restart());
        assert!(f.usb.is_claimed(FX2_FIRMWARE_ID));

        // three cancelled transfers drain, then the engine is dropped
        for _ in 0..3 {
            assert!(pump.spin_once());
        }
        assert!(!pump.has_engine());
        assert!(health.is_retired());
        assert!(health.needs_restart());
        assert_eq!(health.active(), 0);
        assert!(!f.usb.is_claimed(FX2_FIRMWARE_ID));
    }
}
