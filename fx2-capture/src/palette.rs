// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Color tables
//!
//! Colors are 0xRRGGBB in the low 24 bits of a frame cell.

/// Tint OR-ed into sync samples when sync visualization is on
pub const SYNC_HIGHLIGHT: u32 = 0x808080;

/// Number of selectable BK palettes (index 0 is black & white)
pub const BK_PALETTE_COUNT: usize = 17;

/// Index of the black & white BK palette
pub const BK_MONOCHROME_PALETTE: usize = 0;

/// Default BK palette (standard palette 0)
pub const BK_DEFAULT_PALETTE: usize = 1;

/// BK palettes, four colors each, indexed by the two color bits
pub const BK_PALETTES: [[u32; 4]; BK_PALETTE_COUNT] = [
    // black & white: colors mark which half of the cell pair is lit
    [0x000000, 0x0000FF, 0x00FF00, 0xFF0000],
    [0x000000, 0x0000FF, 0x00FF00, 0xFF0000],
    [0x000000, 0xFFFF00, 0xFF00FF, 0xFF0000],
    [0x000000, 0x00FFFF, 0x0000FF, 0xFF00FF],
    [0x000000, 0x00FF00, 0x00FFFF, 0xFFFF00],
    [0x000000, 0xFF00FF, 0x00FFFF, 0xFFFFFF],
    [0x000000, 0xFFFFFF, 0xFFFFFF, 0xFFFFFF],
    [0x000000, 0xC00000, 0x900000, 0xFF0000],
    [0x000000, 0xC0FF00, 0x90FF00, 0xFFFF00],
    [0x000000, 0xC000FF, 0x9000FF, 0xFF00FF],
    [0x000000, 0x90FF00, 0x9000FF, 0x900000],
    [0x000000, 0xC0FF00, 0xC000FF, 0xC00000],
    [0x000000, 0x00FFFF, 0xFFFF00, 0xFF0000],
    [0x000000, 0xFF0000, 0x00FF00, 0x00FFFF],
    [0x000000, 0x00FFFF, 0xFFFF00, 0xFFFFFF],
    [0x000000, 0xFFFF00, 0x00FF00, 0xFFFFFF],
    [0x000000, 0x00FFFF, 0x00FF00, 0xFFFFFF],
];

/// UKNC palette: bit 3 selects full intensity
pub const UKNC_PALETTE: [u32; 16] = [
    0x000000, 0x800000, 0x008000, 0x808000, 0x000080, 0x800080, 0x008080, 0x808080,
    0x000000, 0xFF0000, 0x00FF00, 0xFFFF00, 0x0000FF, 0xFF00FF, 0x00FFFF, 0xFFFFFF,
];

/// BK color for a masked sample; out-of-range palettes clamp to the last one
#[inline]
pub fn bk_color(palette: usize, sample: u8) -> u32 {
    BK_PALETTES[palette.min(BK_PALETTE_COUNT - 1)][usize::from(sample & 0x03)]
}

/// UKNC color for a masked sample
#[inline]
pub fn uknc_color(sample: u8) -> u32 {
    UKNC_PALETTE[usize::from(sample & 0x0F)]
}

/// Convert a frame decoded with the black & white BK palette to monochrome.
///
/// Each even cell carries two mono pixels: blue lights the left one, green
/// the right one, red both. The result overwrites the cell pair.
pub fn bw_postprocess(frame: &mut [u32]) {
    const WHITE: u32 = 0xFFFFFF;
    const BLACK: u32 = 0x000000;

    for pair in frame.chunks_exact_mut(2) {
        let cell = pair[0];
        let (left, right) = if cell & 0x0F0000 != 0 {
            (WHITE, WHITE)
        } else {
            (
                if cell & 0x00000F != 0 { WHITE } else { BLACK },
                if cell & 0x000F00 != 0 { WHITE } else { BLACK },
            )
        };
        pair[0] = left;
        pair[1] = right;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bk_color_lookup() {
        assert_eq!(bk_color(1, 0), 0x000000);
        assert_eq!(bk_color(1, 1), 0x0000FF);
        assert_eq!(bk_color(2, 2), 0xFF00FF);
        // sync bit is ignored for color
        assert_eq!(bk_color(3, 0x13), 0xFF00FF);
        // clamped
        assert_eq!(bk_color(99, 3), BK_PALETTES[16][3]);
    }

    #[test]
    fn test_uknc_color_lookup() {
        assert_eq!(uknc_color(0x00), 0x000000);
        assert_eq!(uknc_color(0x01), 0x800000);
        assert_eq!(uknc_color(0x0F), 0xFFFFFF);
        assert_eq!(uknc_color(0x1F), 0xFFFFFF);
    }

    #[test]
    fn test_bw_postprocess() {
        let mut frame = [0x0000FF, 0x123456, 0x00FF00, 0, 0xFF0000, 0, 0x000000, 0xFFFFFF];
        bw_postprocess(&mut frame);
        assert_eq!(
            frame,
            [
                0xFFFFFF, 0x000000, // left lit
                0x000000, 0xFFFFFF, // right lit
                0xFFFFFF, 0xFFFFFF, // both lit
                0x000000, 0x000000, // dark, odd cell ignored
            ]
        );
    }
}
