// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Watchdog
//!
//! Wakes every period and restarts the whole pipeline when nothing is in
//! flight: after a halt, after a failed bring-up, or before the first
//! successful one. A failed restart is logged and retried on the next tick.
//!
//! A halted engine keeps the interface claimed until the event pump drops
//! it, so the restart waits for that.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flume::RecvTimeoutError;
use log::{debug, info, warn};

use crate::session::SessionContext;
use crate::usb::UsbBackend;

/// Result of one watchdog check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Transfers are in flight
    Healthy,
    /// A halted pipeline has not released the device yet
    Draining,
    /// The session is stopping
    ShuttingDown,
    /// The pipeline was restarted
    Recovered,
    /// A restart was attempted and failed
    RecoveryFailed,
}

/// Periodic liveness check over one capture session
pub struct Watchdog<B: UsbBackend> {
    ctx: Arc<SessionContext<B>>,
    period: Duration,
}

impl<B: UsbBackend> Watchdog<B> {
    pub(crate) fn new(ctx: Arc<SessionContext<B>>, period: Duration) -> Self {
        Self { ctx, period }
    }

    /// Check period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Check once, restarting the pipeline if it has stalled
    pub fn tick(&self) -> TickOutcome {
        if self.ctx.is_shutdown() {
            return TickOutcome::ShuttingDown;
        }

        let health = self.ctx.health();
        if health.active() > 0 {
            debug!("Watchdog: {:?}", health.snapshot());
            return TickOutcome::Healthy;
        }
        if !health.needs_restart() {
            debug!("Watchdog: halted pipeline still draining");
            return TickOutcome::Draining;
        }

        warn!("No transfers in flight, restarting capture pipeline");
        match self.ctx.restart_pipeline() {
            Ok(()) => {
                info!("Capture pipeline recovered");
                TickOutcome::Recovered
            }
            Err(e) => {
                warn!("Pipeline restart failed: {e}");
                self.ctx.record_error(&e);
                TickOutcome::RecoveryFailed
            }
        }
    }

    /// Run on a thread until `stop` receives a message or its sender is
    /// dropped
    pub fn spawn(self, stop: flume::Receiver<()>) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("fx2-watchdog".to_string())
            .spawn(move || loop {
                match stop.recv_timeout(self.period) {
                    Err(RecvTimeoutError::Timeout) => {
                        self.tick();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
    }
}
