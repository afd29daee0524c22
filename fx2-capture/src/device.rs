// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Device Session
//!
//! Finds the FX2, stages the acquisition firmware when the device still runs
//! the stock boot loader, and issues the start command.
//!
//! Bring-up sequence:
//!
//! ```text
//!   open stock id ──found──▶ CPUCS = stop ─▶ write firmware ─▶ CPUCS = run
//!        │                      (0xA0 @ 0xE600)   (0xA0, ≤ 4 KiB chunks)
//!        │                                                  │ settle delay
//!        │ not found                                        ▼
//!        └──────────────────────────────▶ open firmware id ─▶ start (0xB1)
//! ```

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{CaptureError, Result};
use crate::protocol::{
    CpuState, StartFlags, UsbId, BULK_IN_ENDPOINT, CPUCS_ADDR, FIRMWARE_MAX_SIZE, FX2_FIRMWARE_ID,
    FX2_STOCK_ID, RAM_ACCESS_TIMEOUT, RAM_CHUNK_SIZE, REQUEST_RAM_ACCESS, REQUEST_START,
    START_TIMEOUT,
};
use crate::usb::{UsbBackend, UsbError, UsbHandle};

/// Default firmware image name
pub const DEFAULT_FIRMWARE_PATH: &str = "fx2lafw-cypress-fx2.fw";

/// Default wait for re-enumeration after the firmware starts
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Device session settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Identifiers before firmware staging
    pub stock_id: UsbId,
    /// Identifiers once the firmware runs
    pub fallback_id: UsbId,
    /// Firmware image staged into a stock device
    pub firmware_path: PathBuf,
    /// Wait after releasing the CPU
    pub settle_delay: Duration,
    /// Flags sent with the start command
    pub start_flags: StartFlags,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            stock_id: FX2_STOCK_ID,
            fallback_id: FX2_FIRMWARE_ID,
            firmware_path: PathBuf::from(DEFAULT_FIRMWARE_PATH),
            settle_delay: DEFAULT_SETTLE_DELAY,
            start_flags: StartFlags::default(),
        }
    }
}

/// Which identifiers the device answered to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenedAs {
    /// Stock boot loader, firmware must be staged
    Stock,
    /// Firmware already running
    Firmware,
}

/// Session with one capture device
pub struct DeviceSession<B: UsbBackend> {
    backend: B,
    config: DeviceConfig,
    handle: Option<B::Handle>,
}

impl<B: UsbBackend> DeviceSession<B> {
    /// Create a closed session
    pub fn new(backend: B, config: DeviceConfig) -> Self {
        Self {
            backend,
            config,
            handle: None,
        }
    }

    /// Session settings
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Whether a device handle is held
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Identifiers of the open device
    pub fn opened_id(&self) -> Option<UsbId> {
        self.handle.as_ref().map(UsbHandle::id)
    }

    /// Drop the device handle
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Closed usb device {}", handle.id());
        }
    }

    /// Open `id`; `Ok(false)` when no such device is attached
    fn try_open(&mut self, id: UsbId) -> Result<bool> {
        match self.backend.open(id) {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(true)
            }
            Err(UsbError::NotFound) => Ok(false),
            Err(e) => Err(CaptureError::Configuration {
                id,
                reason: e.to_string(),
            }),
        }
    }

    fn not_found(&self) -> CaptureError {
        CaptureError::DeviceNotFound {
            preferred: self.config.stock_id,
            fallback: self.config.fallback_id,
        }
    }

    /// Open the stock identifiers, or the firmware identifiers when the stock
    /// ones are absent
    pub fn open(&mut self) -> Result<OpenedAs> {
        self.close();

        if self.try_open(self.config.stock_id)? {
            info!("Found stock FX2 at {}", self.config.stock_id);
            return Ok(OpenedAs::Stock);
        }
        if self.try_open(self.config.fallback_id)? {
            info!("Found FX2 running firmware at {}", self.config.fallback_id);
            return Ok(OpenedAs::Firmware);
        }
        Err(self.not_found())
    }

    fn open_fallback(&mut self) -> Result<()> {
        self.close();
        if self.try_open(self.config.fallback_id)? {
            Ok(())
        } else {
            Err(self.not_found())
        }
    }

    fn handle(&self) -> std::result::Result<&B::Handle, UsbError> {
        self.handle.as_ref().ok_or(UsbError::NotFound)
    }

    /// Write `data` into 8051 RAM at `addr`, in chunks of at most 4 KiB
    pub fn write_ram(&self, addr: u16, data: &[u8]) -> std::result::Result<(), UsbError> {
        let handle = self.handle()?;
        let mut addr = addr;
        for chunk in data.chunks(RAM_CHUNK_SIZE) {
            handle.control_out(REQUEST_RAM_ACCESS, addr, 0, chunk, RAM_ACCESS_TIMEOUT)?;
            addr = addr.wrapping_add(chunk.len() as u16);
        }
        Ok(())
    }

    /// Read `len` bytes of 8051 RAM from `addr`
    pub fn read_ram(&self, addr: u16, len: usize) -> std::result::Result<Vec<u8>, UsbError> {
        let handle = self.handle()?;
        let mut data = Vec::with_capacity(len);
        let mut addr = addr;
        while data.len() < len {
            let want = (len - data.len()).min(RAM_CHUNK_SIZE);
            let chunk = handle.control_in(REQUEST_RAM_ACCESS, addr, 0, want, RAM_ACCESS_TIMEOUT)?;
            if chunk.is_empty() {
                break;
            }
            addr = addr.wrapping_add(chunk.len() as u16);
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// Hold or release the 8051 core
    pub fn set_cpu_state(&self, state: CpuState) -> std::result::Result<(), UsbError> {
        self.write_ram(CPUCS_ADDR, &[state as u8])
    }

    /// Current CPUCS value
    pub fn cpu_state(&self) -> std::result::Result<Option<CpuState>, UsbError> {
        let value = self.read_ram(CPUCS_ADDR, 1)?;
        Ok(value
            .first()
            .and_then(|&v| CpuState::try_from(v & 0x01).ok()))
    }

    /// Read CPUCS back after a stop request. A core that still runs would
    /// execute the image while it is being written; an unreadable CPUCS is
    /// only logged since some boot loaders do not answer RAM reads.
    fn verify_cpu_stopped(&self) -> Result<()> {
        match self.cpu_state() {
            Ok(Some(CpuState::Stop)) => {
                debug!("CPUCS reads stop, 8051 held in reset");
                Ok(())
            }
            Ok(Some(CpuState::Run)) => Err(CaptureError::DeviceCommand(
                "cpu still running after stop request".to_string(),
            )),
            Ok(None) => {
                warn!("CPUCS read returned no data");
                Ok(())
            }
            Err(e) => {
                warn!("Unable to read CPUCS: {e}");
                Ok(())
            }
        }
    }

    /// Read the configured firmware image
    pub fn load_firmware(&self) -> Result<Vec<u8>> {
        let path = &self.config.firmware_path;
        let firmware = fs::read(path)
            .map_err(|e| CaptureError::FirmwareLoad(format!("{}: {e}", path.display())))?;
        debug!("Read {} bytes of firmware from {}", firmware.len(), path.display());
        Ok(firmware)
    }

    /// Stop the CPU, write `firmware` at address 0, release the CPU and wait
    /// for the device to come back under the firmware identifiers.
    ///
    /// The handle is closed afterwards since the device re-enumerates.
    pub fn stage_firmware(&mut self, firmware: &[u8]) -> Result<()> {
        if firmware.is_empty() || firmware.len() > FIRMWARE_MAX_SIZE {
            return Err(CaptureError::FirmwareLoad(format!(
                "image is {} bytes, expected 1..={FIRMWARE_MAX_SIZE}",
                firmware.len()
            )));
        }

        self.set_cpu_state(CpuState::Stop)
            .map_err(|e| CaptureError::DeviceCommand(format!("unable to stop cpu: {e}")))?;
        self.verify_cpu_stopped()?;
        self.write_ram(0, firmware)
            .map_err(|e| CaptureError::FirmwareLoad(format!("RAM write failed: {e}")))?;
        self.set_cpu_state(CpuState::Run)
            .map_err(|e| CaptureError::DeviceCommand(format!("unable to start cpu: {e}")))?;
        info!("Staged {} bytes of firmware", firmware.len());

        self.close();
        if !self.config.settle_delay.is_zero() {
            debug!("Waiting {:?} for re-enumeration", self.config.settle_delay);
            thread::sleep(self.config.settle_delay);
        }
        Ok(())
    }

    /// Start sampling
    pub fn send_start_acquisition(&self, flags: StartFlags) -> Result<()> {
        let handle = self
            .handle()
            .map_err(|e| CaptureError::DeviceCommand(format!("start acquisition: {e}")))?;
        handle
            .control_out(REQUEST_START, 0, 0, &flags.payload(), START_TIMEOUT)
            .map_err(|e| CaptureError::DeviceCommand(format!("start acquisition: {e}")))?;
        debug!("Acquisition started (flags {:#04x})", flags.bits());
        Ok(())
    }

    /// Open the device, stage firmware when needed, reopen it under the
    /// firmware identifiers and start acquisition
    pub fn bring_up(&mut self) -> Result<()> {
        match self.open()? {
            OpenedAs::Stock => {
                let firmware = self.load_firmware()?;
                self.stage_firmware(&firmware)?;
                self.open_fallback()?;
            }
            OpenedAs::Firmware => {
                warn!("Firmware already running, skipping staging");
            }
        }
        self.send_start_acquisition(self.config.start_flags)
    }

    /// Bulk IN queue on the sample endpoint
    pub fn bulk_queue(
        &self,
        timeout: Duration,
    ) -> Result<<B::Handle as UsbHandle>::Queue> {
        let handle = self
            .handle()
            .map_err(|e| CaptureError::Submission(e.to_string()))?;
        Ok(handle.bulk_in_queue(BULK_IN_ENDPOINT, timeout))
    }
}
