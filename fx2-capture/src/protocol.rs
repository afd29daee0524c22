// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! FX2 vendor protocol definitions
//!
//! Constants and small wire types shared by the device session, the transfer
//! engine and the mock backend. Values follow the Cypress FX2 boot loader
//! (RAM access through vendor request 0xA0) and the fx2lafw firmware
//! (acquisition start through vendor request 0xB1).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Stock Cypress FX2 identifiers, before any firmware has been staged
pub const FX2_STOCK_ID: UsbId = UsbId::new(0x04B4, 0x8613);

/// Identifiers the device re-enumerates under once fx2lafw is running
pub const FX2_FIRMWARE_ID: UsbId = UsbId::new(0xFFFF, 0x2048);

/// USB configuration selected after open
pub const USB_CONFIGURATION: u8 = 1;

/// Interface claimed after open
pub const USB_INTERFACE: u8 = 0;

/// Bulk IN endpoint carrying the sample stream
pub const BULK_IN_ENDPOINT: u8 = 0x82;

/// Boot loader request for internal RAM read/write (`wValue` = address)
pub const REQUEST_RAM_ACCESS: u8 = 0xA0;

/// fx2lafw request starting sample acquisition
pub const REQUEST_START: u8 = 0xB1;

/// CPUCS register; bit 0 holds the 8051 in reset
pub const CPUCS_ADDR: u16 = 0xE600;

/// Largest payload per RAM-access control transfer
pub const RAM_CHUNK_SIZE: usize = 0x1000;

/// Largest firmware image that fits in FX2 program RAM
pub const FIRMWARE_MAX_SIZE: usize = 0x2000;

/// Bulk packet size of the high-speed IN endpoint
pub const BULK_PACKET_SIZE: usize = 0x200;

/// Bulk transfer chunk, roughly 10ms of samples, multiple of the packet size
pub const TRANSFER_CHUNK_SIZE: usize = 0x20000;

/// Bulk transfers kept in flight
pub const DEFAULT_TRANSFER_COUNT: usize = 4;

/// Timeout for RAM-access control transfers
pub const RAM_ACCESS_TIMEOUT: Duration = Duration::from_millis(1000);

/// Timeout for the start-acquisition control transfer
pub const START_TIMEOUT: Duration = Duration::from_millis(1000);

/// Vendor/product identifier pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbId {
    /// USB vendor identifier
    pub vendor_id: u16,
    /// USB product identifier
    pub product_id: u16,
}

impl UsbId {
    /// Create an identifier pair
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl FromStr for UsbId {
    type Err = String;

    /// Parse `vvvv:pppp` (hexadecimal, optional `0x` prefixes)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vendor, product) = s
            .split_once(':')
            .ok_or_else(|| format!("expected VID:PID, got '{s}'"))?;
        let parse = |part: &str| {
            let digits = part.trim().trim_start_matches("0x").trim_start_matches("0X");
            u16::from_str_radix(digits, 16).map_err(|e| format!("invalid id '{part}': {e}"))
        };
        Ok(Self::new(parse(vendor)?, parse(product)?))
    }
}

/// 8051 core state written to CPUCS
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    /// Core running
    Run = 0,
    /// Core held in reset
    Stop = 1,
}

impl TryFrom<u8> for CpuState {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CpuState::Run),
            1 => Ok(CpuState::Stop),
            _ => Err("Invalid CPUCS value"),
        }
    }
}

bitflags::bitflags! {
    /// Flags byte of the start-acquisition command
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StartFlags: u8 {
        /// Sample on the falling edge of the external clock
        const INV_CLK = 1 << 0;
    }
}

impl Default for StartFlags {
    fn default() -> Self {
        StartFlags::INV_CLK
    }
}

impl StartFlags {
    /// Wire payload: flags followed by two reserved bytes
    pub fn payload(&self) -> [u8; 3] {
        [self.bits(), 0, 0]
    }
}
