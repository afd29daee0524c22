// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture error types

use std::sync::{Mutex, PoisonError};

use crate::protocol::UsbId;

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Capture error types.
///
/// Device Session and Transfer Engine operations return these to their
/// caller. The watchdog is the only component that acts on bring-up
/// failures, by retrying on its next tick.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Neither the stock nor the firmware-loaded identifiers are present.
    #[error("can't find usb device with VID:PID {preferred} (or {fallback})")]
    DeviceNotFound {
        /// Identifiers tried first
        preferred: UsbId,
        /// Identifiers tried when the first pair is absent
        fallback: UsbId,
    },

    /// The device was found but configuration 1 or interface 0 could not be
    /// set up.
    #[error("can't configure usb device {id}: {reason}")]
    Configuration {
        /// Device being configured
        id: UsbId,
        /// Underlying failure
        reason: String,
    },

    /// The firmware file is unreadable or a RAM write failed.
    #[error("unable to load firmware: {0}")]
    FirmwareLoad(String),

    /// A reset or start control transfer failed.
    #[error("device command failed: {0}")]
    DeviceCommand(String),

    /// A bulk transfer could not be queued.
    #[error("unable to submit usb data transfer: {0}")]
    Submission(String),

    /// A submitted transfer completed with an unrecoverable status, or the
    /// empty-transfer budget ran out.
    #[error("usb data transfer failed: {0}")]
    TransferFailure(String),

    /// Configuration values are out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `start()` called on a session that is already running.
    #[error("capture session already running")]
    AlreadyRunning,

    /// I/O failure outside the USB stack (config files, threads).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Last formatted error message, surfaced to the UI as plain text.
#[derive(Debug, Default)]
pub struct LastError(Mutex<Option<String>>);

impl LastError {
    /// Record an error message, replacing the previous one
    pub fn set(&self, message: String) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    /// Get the last recorded message
    pub fn get(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Forget the last message
    pub fn clear(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
