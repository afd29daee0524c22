// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture configuration
//!
//! Every field has a default, so a JSON file only needs the values it
//! changes:
//!
//! ```json
//! { "mode": "bk", "palette": 3, "firmware_path": "/usr/share/fx2lafw/fx2lafw-cypress-fx2.fw" }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceConfig, DEFAULT_FIRMWARE_PATH, DEFAULT_SETTLE_DELAY};
use crate::error::{CaptureError, Result};
use crate::mode::Mode;
use crate::palette::{BK_DEFAULT_PALETTE, BK_PALETTE_COUNT};
use crate::protocol::{
    StartFlags, UsbId, DEFAULT_TRANSFER_COUNT, FX2_FIRMWARE_ID, FX2_STOCK_ID, TRANSFER_CHUNK_SIZE,
};
use crate::transfer::{TransferConfig, DEFAULT_TRANSFER_TIMEOUT};

/// Default watchdog period
pub const DEFAULT_WATCHDOG_PERIOD: Duration = Duration::from_secs(5);

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Target machine
    pub mode: Mode,
    /// Firmware image staged into a stock device
    pub firmware_path: PathBuf,
    /// Identifiers before firmware staging
    pub stock_id: UsbId,
    /// Identifiers once the firmware runs
    pub fallback_id: UsbId,
    /// Sample on the falling clock edge
    pub invert_clock: bool,
    /// BK palette index
    pub palette: usize,
    /// Tint sync samples
    pub show_sync: bool,
    /// Bulk transfers kept in flight
    pub transfer_count: usize,
    /// Bytes per bulk transfer
    pub transfer_size: usize,
    /// Per-transfer timeout in milliseconds
    pub transfer_timeout_ms: u64,
    /// Watchdog period in milliseconds
    pub watchdog_period_ms: u64,
    /// Wait for re-enumeration after staging, in milliseconds
    pub settle_delay_ms: u64,
    /// Consecutive empty transfers tolerated before the pipeline halts
    pub empty_transfer_budget: Option<u32>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            firmware_path: PathBuf::from(DEFAULT_FIRMWARE_PATH),
            stock_id: FX2_STOCK_ID,
            fallback_id: FX2_FIRMWARE_ID,
            invert_clock: true,
            palette: BK_DEFAULT_PALETTE,
            show_sync: false,
            transfer_count: DEFAULT_TRANSFER_COUNT,
            transfer_size: TRANSFER_CHUNK_SIZE,
            transfer_timeout_ms: DEFAULT_TRANSFER_TIMEOUT.as_millis() as u64,
            watchdog_period_ms: DEFAULT_WATCHDOG_PERIOD.as_millis() as u64,
            settle_delay_ms: DEFAULT_SETTLE_DELAY.as_millis() as u64,
            empty_transfer_budget: None,
        }
    }
}

impl CaptureConfig {
    /// Load a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| CaptureError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.palette >= BK_PALETTE_COUNT {
            return Err(CaptureError::InvalidConfig(format!(
                "palette {} out of range (0..{BK_PALETTE_COUNT})",
                self.palette
            )));
        }
        if self.stock_id == self.fallback_id {
            return Err(CaptureError::InvalidConfig(format!(
                "stock and firmware identifiers are both {}",
                self.stock_id
            )));
        }
        if self.watchdog_period_ms == 0 {
            return Err(CaptureError::InvalidConfig(
                "watchdog period cannot be zero".to_string(),
            ));
        }
        if self.empty_transfer_budget == Some(0) {
            return Err(CaptureError::InvalidConfig(
                "empty transfer budget cannot be zero".to_string(),
            ));
        }
        self.transfer_config().validate()
    }

    /// Flags sent with the start command
    pub fn start_flags(&self) -> StartFlags {
        if self.invert_clock {
            StartFlags::INV_CLK
        } else {
            StartFlags::empty()
        }
    }

    /// Device session settings
    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            stock_id: self.stock_id,
            fallback_id: self.fallback_id,
            firmware_path: self.firmware_path.clone(),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            start_flags: self.start_flags(),
        }
    }

    /// Transfer pool settings
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            count: self.transfer_count,
            chunk_size: self.transfer_size,
            timeout: Duration::from_millis(self.transfer_timeout_ms),
            empty_budget: self.empty_transfer_budget,
        }
    }

    /// Watchdog period
    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms)
    }
}
