// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Raster Decoder
//!
//! Rebuilds the video raster from the raw sample stream. There is no clock
//! reference besides the samples themselves: each byte is one pixel clock,
//! and line/frame position is recovered from the length of sync runs.
//!
//! Per sample, in arrival order:
//!
//! ```text
//!   byte ─▶ !byte ─▶ & mask ─▶ color ─┬─ sync?  run += 1 (tint if show-sync)
//!                                     └─ else   run == hsync → snap to line start
//!                                               run == vsync → centering offset
//!                                               run = 0
//!          write color at offset, offset += 1
//!          offset == full → offset = 0, next buffer, notify
//! ```
//!
//! Run lengths are matched exactly; any other length leaves the offset alone.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{CaptureError, Result};
use crate::frame_store::FrameStore;
use crate::mode::Mode;
use crate::palette::{BK_DEFAULT_PALETTE, BK_PALETTE_COUNT, SYNC_HIGHLIGHT};

/// Display options shared with the UI, read by the decoder on every sample
#[derive(Debug)]
pub struct DisplayOptions {
    show_sync: AtomicBool,
    palette: AtomicUsize,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self::new(false, BK_DEFAULT_PALETTE)
    }
}

impl DisplayOptions {
    /// Create options; out-of-range palettes fall back to the default
    pub fn new(show_sync: bool, palette: usize) -> Self {
        let palette = if palette < BK_PALETTE_COUNT {
            palette
        } else {
            BK_DEFAULT_PALETTE
        };
        Self {
            show_sync: AtomicBool::new(show_sync),
            palette: AtomicUsize::new(palette),
        }
    }

    /// Whether sync samples are tinted
    pub fn show_sync(&self) -> bool {
        self.show_sync.load(Ordering::Relaxed)
    }

    /// Toggle sync tinting
    pub fn set_show_sync(&self, show: bool) {
        self.show_sync.store(show, Ordering::Relaxed);
    }

    /// Selected BK palette
    pub fn palette(&self) -> usize {
        self.palette.load(Ordering::Relaxed)
    }

    /// Select a BK palette
    pub fn set_palette(&self, palette: usize) -> Result<()> {
        if palette >= BK_PALETTE_COUNT {
            return Err(CaptureError::InvalidConfig(format!(
                "palette {palette} out of range (0..{BK_PALETTE_COUNT})"
            )));
        }
        self.palette.store(palette, Ordering::Relaxed);
        Ok(())
    }
}

/// Decoder position, owned by the decode context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderState {
    /// Next write offset in the target buffer, always `< full`
    pub offset: usize,
    /// Length of the current sync run
    pub sync_run: u32,
    /// Target buffer in the frame store
    pub buffer_index: usize,
}

/// Sample stream to raster decoder for one machine
pub struct RasterDecoder {
    mode: Mode,
    state: DecoderState,
    store: Arc<FrameStore>,
    options: Arc<DisplayOptions>,
}

impl RasterDecoder {
    /// Create a decoder writing into `store`, starting at buffer 0 offset 0.
    /// Fails when the store's buffers are smaller than one full raster.
    pub fn new(mode: Mode, store: Arc<FrameStore>, options: Arc<DisplayOptions>) -> Result<Self> {
        let full = mode.params().full;
        if store.frame_len() < full {
            return Err(CaptureError::InvalidConfig(format!(
                "frame buffers hold {} cells, {mode} needs {full}",
                store.frame_len()
            )));
        }
        Ok(Self {
            mode,
            state: DecoderState::default(),
            store,
            options,
        })
    }

    /// Machine being decoded
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current position
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Frame store written by this decoder
    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    /// Consume `samples` in order, returning the number of frames completed.
    pub fn decode(&mut self, samples: &[u8]) -> usize {
        let params = self.mode.params();
        let buffer_count = self.store.buffer_count();

        let DecoderState {
            mut offset,
            mut sync_run,
            mut buffer_index,
        } = self.state;
        let mut completed = 0;

        for &byte in samples {
            let sample = !byte & params.sample_mask;
            let mut color = self.mode.color(sample, self.options.palette());

            if self.mode.is_sync(sample) {
                sync_run = sync_run.saturating_add(1);
                if self.options.show_sync() {
                    color |= SYNC_HIGHLIGHT;
                }
            } else {
                if sync_run == params.hsync_run {
                    offset = params.line_start(offset);
                } else if sync_run == params.vsync_run {
                    offset = params.vsync_offset;
                }
                sync_run = 0;
            }

            self.store.write(buffer_index, offset, color);
            offset += 1;

            if offset == params.full {
                let next = (buffer_index + 1) % buffer_count;
                self.store.publish_frame(buffer_index, next);
                offset = 0;
                buffer_index = next;
                completed += 1;
            }
        }

        self.state = DecoderState {
            offset,
            sync_run,
            buffer_index,
        };
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_store::FRAME_BUFFER_COUNT;
    use crate::mode::{BK_PARAMS, UKNC_PARAMS};

    // Raw bytes are inverted before masking.
    const UKNC_SYNC: u8 = 0xFF;
    const UKNC_WHITE: u8 = 0xF0;
    const BK_SYNC: u8 = !0x10;
    const BK_COLOR1: u8 = !0x01;

    fn decoder(mode: Mode) -> RasterDecoder {
        RasterDecoder::new(
            mode,
            Arc::new(FrameStore::for_mode(mode)),
            Arc::new(DisplayOptions::default()),
        )
        .unwrap()
    }

    fn frame(decoder: &RasterDecoder, index: usize) -> Vec<u32> {
        let mut out = vec![0; decoder.store().frame_len()];
        decoder.store().copy_frame(index, &mut out);
        out
    }

    #[test]
    fn test_rejects_short_frame_store() {
        let err = RasterDecoder::new(
            Mode::Uknc,
            Arc::new(FrameStore::new(16)),
            Arc::new(DisplayOptions::default()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CaptureError::InvalidConfig(_)));

        // a BK-sized store is too small for a UKNC raster
        RasterDecoder::new(
            Mode::Uknc,
            Arc::new(FrameStore::for_mode(Mode::Bk)),
            Arc::new(DisplayOptions::default()),
        )
        .err()
        .unwrap();
    }

    #[test]
    fn test_display_options() {
        let options = DisplayOptions::new(true, 99);
        assert!(options.show_sync());
        assert_eq!(options.palette(), BK_DEFAULT_PALETTE);

        options.set_palette(0).unwrap();
        assert_eq!(options.palette(), 0);
        options.set_palette(BK_PALETTE_COUNT).unwrap_err();
        assert_eq!(options.palette(), 0);
    }

    #[test]
    fn test_advance_without_sync() {
        let mut dec = decoder(Mode::Uknc);
        let full = UKNC_PARAMS.full;

        assert_eq!(dec.decode(&vec![UKNC_WHITE; full - 1]), 0);
        assert_eq!(dec.state().offset, full - 1);
        assert_eq!(dec.state().buffer_index, 0);

        assert_eq!(dec.decode(&[UKNC_WHITE, UKNC_WHITE]), 1);
        assert_eq!(dec.state().offset, 1);
        assert_eq!(dec.state().buffer_index, 1);
        assert_eq!(dec.store().current_write_index(), 1);
    }

    #[test]
    fn test_buffer_index_wraps() {
        let mut dec = decoder(Mode::Bk);
        let full = BK_PARAMS.full;
        let chunk = vec![BK_COLOR1; 0x20000];

        let total = full * FRAME_BUFFER_COUNT + 5;
        let mut completed = 0;
        let mut fed = 0;
        while fed < total {
            let n = chunk.len().min(total - fed);
            completed += dec.decode(&chunk[..n]);
            fed += n;
        }

        assert_eq!(completed, FRAME_BUFFER_COUNT);
        assert_eq!(dec.state().buffer_index, 0);
        assert_eq!(dec.state().offset, 5);
        assert_eq!(dec.store().frames_completed(), FRAME_BUFFER_COUNT as u64);
    }

    #[test]
    fn test_hsync_snaps_to_line_start() {
        let mut dec = decoder(Mode::Uknc);
        let prior = 3 * UKNC_PARAMS.width + 17;
        dec.decode(&vec![UKNC_WHITE; prior]);

        let run = UKNC_PARAMS.hsync_run as usize;
        dec.decode(&vec![UKNC_SYNC; run]);
        let before_snap = dec.state().offset;
        dec.decode(&[UKNC_WHITE]);

        // the non-sync sample lands at the start of the line holding the run end
        let line = UKNC_PARAMS.line_start(before_snap);
        assert_eq!(dec.state().offset, line + 1);
        assert_eq!(frame(&dec, 0)[line], 0xFFFFFF);
        assert_eq!(dec.state().sync_run, 0);
    }

    #[test]
    fn test_vsync_moves_to_centering_offset() {
        let mut dec = decoder(Mode::Bk);
        dec.decode(&vec![BK_COLOR1; 1234]);
        dec.decode(&vec![BK_SYNC; BK_PARAMS.vsync_run as usize]);
        dec.decode(&[BK_COLOR1]);

        assert_eq!(dec.state().offset, BK_PARAMS.vsync_offset + 1);
        assert_eq!(frame(&dec, 0)[BK_PARAMS.vsync_offset], 0x0000FF);
    }

    #[test]
    fn test_other_run_lengths_do_not_correct() {
        for run in [1, 0x37, 0x39, 0x4F, 0x51, 0x200] {
            let mut dec = decoder(Mode::Bk);
            dec.decode(&vec![BK_COLOR1; 1000]);
            dec.decode(&vec![BK_SYNC; run]);
            dec.decode(&[BK_COLOR1]);
            assert_eq!(dec.state().offset, 1000 + run + 1, "run {run}");
        }
    }

    #[test]
    fn test_sync_run_spans_calls() {
        let mut dec = decoder(Mode::Uknc);
        dec.decode(&vec![UKNC_WHITE; 100]);
        let run = UKNC_PARAMS.vsync_run as usize;
        dec.decode(&vec![UKNC_SYNC; run / 2]);
        dec.decode(&vec![UKNC_SYNC; run - run / 2]);
        dec.decode(&[UKNC_WHITE]);
        assert_eq!(dec.state().offset, UKNC_PARAMS.vsync_offset + 1);
    }

    #[test]
    fn test_split_decoding_matches_single_pass() {
        let params = BK_PARAMS;
        let mut stream = Vec::new();
        for line in 0..params.height + 40 {
            stream.extend(std::iter::repeat_n(BK_SYNC, params.hsync_run as usize));
            stream.extend((0..params.width - 3).map(|i| !((i + line) as u8 & 0x03)));
            if line % 97 == 0 {
                stream.extend(std::iter::repeat_n(BK_SYNC, params.vsync_run as usize));
            }
        }

        let mut whole = decoder(Mode::Bk);
        whole.decode(&stream);

        let mut split = decoder(Mode::Bk);
        let mut rest = stream.as_slice();
        let mut step = 1;
        while !rest.is_empty() {
            let n = step.min(rest.len());
            split.decode(&rest[..n]);
            rest = &rest[n..];
            step = step * 7 % 4093 + 1;
        }

        assert_eq!(whole.state(), split.state());
        for index in 0..FRAME_BUFFER_COUNT {
            assert_eq!(frame(&whole, index), frame(&split, index), "buffer {index}");
        }
    }

    #[test]
    fn test_show_sync_tints_sync_samples() {
        let mut dec = decoder(Mode::Bk);
        dec.decode(&[BK_SYNC]);
        assert_eq!(frame(&dec, 0)[0], 0x000000);

        let options = Arc::new(DisplayOptions::new(true, BK_DEFAULT_PALETTE));
        let mut dec = RasterDecoder::new(
            Mode::Bk,
            Arc::new(FrameStore::for_mode(Mode::Bk)),
            Arc::clone(&options),
        )
        .unwrap();
        dec.decode(&[BK_SYNC, BK_COLOR1]);
        let cells = frame(&dec, 0);
        assert_eq!(cells[0], SYNC_HIGHLIGHT);
        assert_eq!(cells[1], 0x0000FF);
    }

    #[test]
    fn test_palette_change_applies_on_next_pass() {
        let options = Arc::new(DisplayOptions::default());
        let mut dec = RasterDecoder::new(
            Mode::Bk,
            Arc::new(FrameStore::for_mode(Mode::Bk)),
            Arc::clone(&options),
        )
        .unwrap();
        dec.decode(&[BK_COLOR1]);
        options.set_palette(2).unwrap();
        dec.decode(&[BK_COLOR1]);

        let cells = frame(&dec, 0);
        assert_eq!(cells[0], 0x0000FF);
        assert_eq!(cells[1], 0xFFFF00);
    }

    #[test]
    fn test_show_sync_toggle_between_samples() {
        let options = Arc::new(DisplayOptions::default());
        let mut dec = RasterDecoder::new(
            Mode::Uknc,
            Arc::new(FrameStore::for_mode(Mode::Uknc)),
            Arc::clone(&options),
        )
        .unwrap();

        // the run keeps counting across the toggles
        dec.decode(&[UKNC_SYNC]);
        options.set_show_sync(true);
        dec.decode(&[UKNC_SYNC, UKNC_SYNC]);
        options.set_show_sync(false);
        dec.decode(&[UKNC_SYNC]);
        assert_eq!(dec.state().sync_run, 4);

        let cells = frame(&dec, 0);
        let sync = Mode::Uknc.color(!UKNC_SYNC & UKNC_PARAMS.sample_mask, 0);
        assert_eq!(cells[0], sync);
        assert_eq!(cells[1], sync | SYNC_HIGHLIGHT);
        assert_eq!(cells[2], sync | SYNC_HIGHLIGHT);
        assert_eq!(cells[3], sync);
    }

    #[test]
    fn test_raster_fill() {
        let params = UKNC_PARAMS;
        let mut dec = decoder(Mode::Uknc);

        // color 1 (dark red) is raw 0xFE
        let mut stream = Vec::new();
        for _ in 0..params.height {
            stream.extend(std::iter::repeat_n(UKNC_SYNC, params.hsync_run as usize));
            stream.extend(std::iter::repeat_n(0xFE, params.width));
        }
        dec.decode(&stream);

        let cells = frame(&dec, 0);
        let lit: Vec<usize> = (0..params.full).filter(|&i| cells[i] == 0x800000).collect();
        assert_eq!(lit.len(), params.height * params.width);
        for line in lit.chunks(params.width) {
            assert_eq!(line[0] % params.width, 0);
        }
    }
}
