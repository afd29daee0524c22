// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture session
//!
//! Owns everything one capture needs: the device session, the frame store,
//! the display options, the event pump thread and the watchdog thread.
//!
//! ```text
//!                 ┌───────────── SessionContext (Arc) ─────────────┐
//!   watchdog ───▶ │ device (Mutex)   health (swapped per restart)  │
//!   start()  ───▶ │ shutdown flag    last error    engine sender ──┼──▶ event pump
//!                 └────────────────────────────────────────────────┘      │ decode
//!                                                                         ▼
//!                                               consumer ◀── FrameStore (8 buffers)
//! ```
//!
//! Every pipeline (re)start runs bring-up, builds a new transfer engine with
//! fresh health counters, fills it with transfers, re-issues the start
//! command and hands the engine to the pump.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::config::CaptureConfig;
use crate::decoder::{DisplayOptions, RasterDecoder};
use crate::device::DeviceSession;
use crate::error::{CaptureError, LastError, Result};
use crate::frame_store::{FrameReceiver, FrameStore};
use crate::mode::Mode;
use crate::transfer::{EventPump, HealthCounters, HealthSnapshot, TransferConfig, TransferEngine};
use crate::usb::{UsbBackend, UsbHandle};
use crate::watchdog::Watchdog;

/// Bulk queue type of a backend
pub type QueueOf<B> = <<B as UsbBackend>::Handle as UsbHandle>::Queue;

/// State shared by the session, the watchdog and pipeline restarts
pub(crate) struct SessionContext<B: UsbBackend> {
    device: Mutex<DeviceSession<B>>,
    transfer: TransferConfig,
    shutdown: Arc<AtomicBool>,
    last_error: Arc<LastError>,
    health: Mutex<Arc<HealthCounters>>,
    engines: flume::Sender<TransferEngine<QueueOf<B>>>,
    restarts: AtomicU64,
}

impl<B: UsbBackend> SessionContext<B> {
    fn device(&self) -> MutexGuard<'_, DeviceSession<B>> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counters of the current pipeline
    pub(crate) fn health(&self) -> Arc<HealthCounters> {
        Arc::clone(&self.health.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn record_error(&self, err: &CaptureError) {
        self.last_error.set(err.to_string());
    }

    /// Bring the device up and start a new transfer pipeline
    pub(crate) fn restart_pipeline(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::AcqRel);

        let mut device = self.device();
        device.bring_up()?;

        let health = Arc::new(HealthCounters::new());
        let mut engine = TransferEngine::new(
            device.bulk_queue(self.transfer.timeout)?,
            self.transfer,
            Arc::clone(&health),
            Arc::clone(&self.shutdown),
            Arc::clone(&self.last_error),
        );
        engine.submit_all()?;
        device.send_start_acquisition(device.config().start_flags)?;

        *self.health.lock().unwrap_or_else(PoisonError::into_inner) = health;
        self.engines
            .send(engine)
            .map_err(|_| CaptureError::Submission("event pump has exited".to_string()))?;

        self.last_error.clear();
        info!(
            "Capture pipeline running with {} transfers of {:#x} bytes",
            self.transfer.count, self.transfer.chunk_size
        );
        Ok(())
    }
}

/// Live capture of one machine's display
pub struct CaptureSession<B: UsbBackend> {
    mode: Mode,
    watchdog_period: Duration,
    ctx: Arc<SessionContext<B>>,
    store: Arc<FrameStore>,
    options: Arc<DisplayOptions>,
    /// Pump waiting to be moved onto its thread
    pump: Option<EventPump<QueueOf<B>>>,
    pump_thread: Option<thread::JoinHandle<()>>,
    watchdog_thread: Option<thread::JoinHandle<()>>,
    watchdog_stop: Option<flume::Sender<()>>,
}

impl<B: UsbBackend> CaptureSession<B> {
    /// Create a stopped session
    pub fn new(backend: B, config: &CaptureConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(FrameStore::for_mode(config.mode));
        let options = Arc::new(DisplayOptions::new(config.show_sync, config.palette));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (engine_tx, engine_rx) = flume::unbounded();

        let decoder = RasterDecoder::new(config.mode, Arc::clone(&store), Arc::clone(&options))?;
        let pump = EventPump::new(decoder, engine_rx, Arc::clone(&shutdown));

        let ctx = Arc::new(SessionContext {
            device: Mutex::new(DeviceSession::new(backend, config.device_config())),
            transfer: config.transfer_config(),
            shutdown,
            last_error: Arc::new(LastError::default()),
            health: Mutex::new(Arc::new(HealthCounters::new())),
            engines: engine_tx,
            restarts: AtomicU64::new(0),
        });

        Ok(Self {
            mode: config.mode,
            watchdog_period: config.watchdog_period(),
            ctx,
            store,
            options,
            pump: Some(pump),
            pump_thread: None,
            watchdog_thread: None,
            watchdog_stop: None,
        })
    }

    /// Start the event pump, attempt the first bring-up and start the
    /// watchdog. A failed first bring-up is logged and left to the watchdog.
    /// A session can be started once.
    pub fn start(&mut self) -> Result<()> {
        let pump = self.pump.take().ok_or(CaptureError::AlreadyRunning)?;

        self.pump_thread = Some(
            thread::Builder::new()
                .name("fx2-events".to_string())
                .spawn(move || pump.run())?,
        );

        if let Err(e) = self.ctx.restart_pipeline() {
            warn!("Initial bring-up failed: {e}; the watchdog will retry");
            self.ctx.record_error(&e);
        }

        let (stop_tx, stop_rx) = flume::bounded(1);
        self.watchdog_thread = Some(self.watchdog().spawn(stop_rx)?);
        self.watchdog_stop = Some(stop_tx);

        info!("Capture session started ({} mode)", self.mode);
        Ok(())
    }

    /// Stop both threads and close the device
    pub fn stop(&mut self) {
        self.ctx.shutdown.store(true, Ordering::Release);

        // dropping the sender wakes the watchdog
        drop(self.watchdog_stop.take());
        let was_running = self.pump_thread.is_some();
        if let Some(handle) = self.watchdog_thread.take() {
            handle.join().ok();
        }
        if let Some(handle) = self.pump_thread.take() {
            handle.join().ok();
        }

        self.ctx.device().close();
        if was_running {
            info!("Capture session stopped");
        }
    }

    /// Whether the threads are running
    pub fn is_running(&self) -> bool {
        self.pump_thread.is_some() && !self.ctx.is_shutdown()
    }

    /// Machine being captured
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Frame ring
    pub fn frame_store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    /// Completed-frame notifications
    pub fn frames(&self) -> FrameReceiver {
        self.store.subscribe()
    }

    /// Palette and sync display options
    pub fn options(&self) -> &Arc<DisplayOptions> {
        &self.options
    }

    /// Counters of the current pipeline
    pub fn health(&self) -> HealthSnapshot {
        self.ctx.health().snapshot()
    }

    /// Last error message, cleared when a restart succeeds
    pub fn last_error(&self) -> Option<String> {
        self.ctx.last_error.get()
    }

    /// Pipeline (re)starts attempted so far
    pub fn restart_attempts(&self) -> u64 {
        self.ctx.restarts.load(Ordering::Acquire)
    }

    /// Watchdog over this session
    pub fn watchdog(&self) -> Watchdog<B> {
        Watchdog::new(Arc::clone(&self.ctx), self.watchdog_period)
    }
}

impl<B: UsbBackend> Drop for CaptureSession<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
