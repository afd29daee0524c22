// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! fx2-capture
//!
//! Live video raster capture of BK-0011M and UKNC displays through a generic
//! FX2 logic analyzer.
//!
//! # Overview
//!
//! The analyzer samples the machine's video DAC lines and composite sync once
//! per pixel clock. This crate turns that byte stream back into frames:
//!
//! - **Device Session**: finds the FX2, stages fx2lafw, starts acquisition
//! - **Transfer Engine**: keeps bulk reads in flight and resubmits them
//! - **Raster Decoder**: recovers line/frame sync from sync run lengths
//! - **Frame Store**: ring of eight frame buffers read by the consumer
//! - **Watchdog**: restarts the pipeline when transfers stop flowing
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    FX2 logic analyzer                       │
//! └─────────────────────────────────────────────────────────────┘
//!          ▲ vendor control (0xA0 RAM, 0xB1 start)  │ bulk IN 0x82
//!          │                                        ▼
//! ┌──────────────────┐                   ┌──────────────────────┐
//! │  Device Session  │◀── bring-up ──────│   Transfer Engine    │
//! └──────────────────┘        ▲          │  (event pump thread) │
//!                             │          └──────────────────────┘
//!                       ┌──────────┐                │ samples
//!                       │ Watchdog │                ▼
//!                       └──────────┘     ┌──────────────────────┐
//!                                        │    Raster Decoder    │
//!                                        └──────────────────────┘
//!                                                   │ colors
//!                                                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Frame Store (8 x full-frame buffers)           │
//! └─────────────────────────────────────────────────────────────┘
//!                                                   │ frame index
//!                                                   ▼
//!                                              consumer
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fx2_capture::{CaptureConfig, CaptureSession, Mode, NusbBackend};
//!
//! let config = CaptureConfig { mode: Mode::Bk, ..Default::default() };
//! let mut session = CaptureSession::new(NusbBackend, &config)?;
//! session.start()?;
//!
//! let frames = session.frames();
//! while let Ok(index) = frames.recv() {
//!     let cells = session.frame_store().frame(index);
//!     // ...
//! }
//! ```
//!
//! # Modules
//!
//! - [`device`]: Device session and firmware staging
//! - [`transfer`]: Bulk transfer engine and event pump
//! - [`decoder`]: Raster decoder
//! - [`frame_store`]: Frame buffer ring
//! - [`watchdog`]: Pipeline watchdog
//! - [`session`]: Capture session tying the above together
//! - [`usb`]: USB backend traits, `nusb` backend and mock
//! - [`protocol`]: FX2 vendor protocol definitions

pub mod config;
pub mod decoder;
pub mod device;
pub mod error;
pub mod frame_store;
pub mod mode;
pub mod palette;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod usb;
pub mod watchdog;

pub use config::CaptureConfig;
pub use decoder::{DecoderState, DisplayOptions, RasterDecoder};
pub use device::{DeviceConfig, DeviceSession, OpenedAs};
pub use error::{CaptureError, Result};
pub use frame_store::{FrameReceiver, FrameStore, FRAME_BUFFER_COUNT};
pub use mode::{Mode, ModeParams};
pub use session::CaptureSession;
pub use transfer::{HealthCounters, HealthSnapshot, TransferConfig, TransferEngine};
pub use usb::NusbBackend;
pub use watchdog::{TickOutcome, Watchdog};
