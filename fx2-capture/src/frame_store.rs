// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame Store
//!
//! A ring of [`FRAME_BUFFER_COUNT`] full-frame buffers of 32-bit color cells.
//! The raster decoder is the only writer; consumers read without locks.
//!
//! Cells are atomics, so a reader racing the writer on the buffer currently
//! being filled sees a partially written (torn) frame but never memory outside
//! the ring. Buffers the writer has moved past are stable until the ring wraps
//! back to them, eight frames later.
//!
//! Consumers learn about completed frames through a single-slot channel
//! (see [`FrameStore::subscribe`]). The writer never blocks on it: when the
//! consumer is behind, the stale index is replaced by the newest one.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use flume::TrySendError;

use crate::mode::Mode;

/// Buffers in the ring
pub const FRAME_BUFFER_COUNT: usize = 8;

/// Receiving end of completed-frame notifications; each message is the index
/// of a buffer that was just completed
pub type FrameReceiver = flume::Receiver<usize>;

/// Rotating set of frame buffers
pub struct FrameStore {
    /// Cells per buffer
    frame_len: usize,
    /// The ring
    buffers: Box<[Box<[AtomicU32]>]>,
    /// Buffer currently targeted by the decoder
    write_index: AtomicUsize,
    /// Frames completed since creation
    frames_completed: AtomicU64,
    /// Completed-frame notifications (capacity 1)
    notify_tx: flume::Sender<usize>,
    /// Held by the writer to evict a stale notification
    notify_rx: flume::Receiver<usize>,
}

impl FrameStore {
    /// Create a ring of buffers holding `frame_len` cells each
    pub fn new(frame_len: usize) -> Self {
        let buffers = (0..FRAME_BUFFER_COUNT)
            .map(|_| (0..frame_len).map(|_| AtomicU32::new(0)).collect())
            .collect();
        let (notify_tx, notify_rx) = flume::bounded(1);

        Self {
            frame_len,
            buffers,
            write_index: AtomicUsize::new(0),
            frames_completed: AtomicU64::new(0),
            notify_tx,
            notify_rx,
        }
    }

    /// Create a ring sized for a machine's full frame
    pub fn for_mode(mode: Mode) -> Self {
        Self::new(mode.params().full)
    }

    /// Cells per buffer
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Buffers in the ring
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Store one color cell. Decoder only; `offset < frame_len` is the
    /// caller's invariant.
    #[inline]
    pub fn write(&self, index: usize, offset: usize, color: u32) {
        self.buffers[index][offset].store(color, Ordering::Relaxed);
    }

    /// Buffer currently targeted by the decoder
    pub fn current_write_index(&self) -> usize {
        self.write_index.load(Ordering::Acquire)
    }

    /// Most recently completed buffer
    pub fn last_completed_index(&self) -> usize {
        let count = self.buffer_count();
        (self.current_write_index() + count - 1) % count
    }

    /// Frames completed since creation
    pub fn frames_completed(&self) -> u64 {
        self.frames_completed.load(Ordering::Acquire)
    }

    /// Switch the write target to `next` and announce `completed`.
    pub fn publish_frame(&self, completed: usize, next: usize) {
        self.write_index.store(next, Ordering::Release);
        self.frames_completed.fetch_add(1, Ordering::AcqRel);

        if let Err(TrySendError::Full(index)) = self.notify_tx.try_send(completed) {
            // consumer is behind, keep only the newest index
            let _ = self.notify_rx.try_recv();
            let _ = self.notify_tx.try_send(index);
        }
    }

    /// Receiver for completed-frame notifications.
    ///
    /// Receivers share one queue; with more than one subscriber each
    /// notification reaches only one of them.
    pub fn subscribe(&self) -> FrameReceiver {
        self.notify_rx.clone()
    }

    /// Cells of one buffer
    pub fn frame(&self, index: usize) -> &[AtomicU32] {
        &self.buffers[index]
    }

    /// Copy one buffer into `out`, returning the number of cells copied
    pub fn copy_frame(&self, index: usize, out: &mut [u32]) -> usize {
        let src = self.frame(index);
        for (dst, cell) in out.iter_mut().zip(src.iter()) {
            *dst = cell.load(Ordering::Relaxed);
        }
        src.len().min(out.len())
    }
}
