//! Pixel packing: rasterized RGBA bitmaps down to device print lines.
//!
//! The print head is fixed at 384 dots. A monochrome line packs 8 pixels per
//! byte LSB-first; a 4bpp grayscale line packs 2 pixels per byte, high nibble
//! first. Images are rotated 180° before packing because the head prints
//! upside down relative to the paper exit, and short images are padded with
//! blank lines up to the firmware's minimum transfer length.

use image::GrayImage;

use crate::dithering::{self, Dithering};
use crate::error::PrinterError;

/// Fixed print head width in dots.
pub const PRINT_WIDTH: usize = 384;
/// Bytes per packed monochrome line.
pub const LINE_BYTES_1BPP: usize = PRINT_WIDTH / 8;
/// Bytes per packed 4bpp grayscale line.
pub const LINE_BYTES_4BPP: usize = PRINT_WIDTH / 2;
/// Firmware minimum transfer length in lines; shorter images are padded.
pub const MIN_LINES: usize = 90;
/// Luminance below this is classified as ink.
pub const INK_THRESHOLD: u8 = 128;

/// A rasterized image as handed in by the host. Never mutated.
#[derive(Debug, Clone)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    /// RGBA, row-major, 4 bytes per pixel.
    pub rgba: Vec<u8>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, PrinterError> {
        let expected = width as usize * height as usize * 4;
        if rgba.len() < expected {
            return Err(PrinterError::MalformedBitmap {
                expected,
                actual: rgba.len(),
            });
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }
}

/// Line encoding for one print session. The length never varies mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineMode {
    #[default]
    Monochrome,
    Grayscale,
}

impl LineMode {
    pub fn line_bytes(self) -> usize {
        match self {
            LineMode::Monochrome => LINE_BYTES_1BPP,
            LineMode::Grayscale => LINE_BYTES_4BPP,
        }
    }

    /// Mode byte in the MXW01 print request.
    pub fn mode_byte(self) -> u8 {
        match self {
            LineMode::Monochrome => 0x00,
            LineMode::Grayscale => 0x02,
        }
    }
}

/// Rec. 601 luma, the weighting the deployed firmware tooling uses.
pub fn luminance(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

fn check_width(bitmap: &Bitmap) -> Result<(), PrinterError> {
    if bitmap.width as usize != PRINT_WIDTH {
        return Err(PrinterError::InvalidRowLength {
            expected: PRINT_WIDTH,
            actual: bitmap.width as usize,
        });
    }
    let expected = bitmap.width as usize * bitmap.height as usize * 4;
    if bitmap.rgba.len() < expected {
        return Err(PrinterError::MalformedBitmap {
            expected,
            actual: bitmap.rgba.len(),
        });
    }
    Ok(())
}

/// Classifies every pixel as ink or blank by luminance thresholding.
pub fn ink_rows(bitmap: &Bitmap) -> Result<Vec<Vec<bool>>, PrinterError> {
    check_width(bitmap)?;
    let width = bitmap.width as usize;
    let mut rows = Vec::with_capacity(bitmap.height as usize);
    for y in 0..bitmap.height as usize {
        let mut row = Vec::with_capacity(width);
        for x in 0..width {
            let i = (y * width + x) * 4;
            let lum = luminance(bitmap.rgba[i], bitmap.rgba[i + 1], bitmap.rgba[i + 2]);
            row.push(lum < INK_THRESHOLD);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Quantizes every pixel to 16 ink levels for the 4bpp path. 0 is blank
/// paper, 15 full ink, so an all-zero packed line stays "blank".
pub fn gray_rows(bitmap: &Bitmap) -> Result<Vec<Vec<u8>>, PrinterError> {
    check_width(bitmap)?;
    let width = bitmap.width as usize;
    let mut rows = Vec::with_capacity(bitmap.height as usize);
    for y in 0..bitmap.height as usize {
        let mut row = Vec::with_capacity(width);
        for x in 0..width {
            let i = (y * width + x) * 4;
            let lum = luminance(bitmap.rgba[i], bitmap.rgba[i + 1], bitmap.rgba[i + 2]);
            row.push(15 - (lum >> 4));
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Classifies pixels with a dithering pass in front of the threshold.
/// `Dithering::Threshold` reduces to plain [`ink_rows`].
pub fn prepare_rows(bitmap: &Bitmap, dither: Dithering) -> Result<Vec<Vec<bool>>, PrinterError> {
    if dither == Dithering::Threshold {
        return ink_rows(bitmap);
    }
    check_width(bitmap)?;
    let width = bitmap.width as usize;
    let mut luma = Vec::with_capacity(width * bitmap.height as usize);
    for px in bitmap.rgba.chunks_exact(4) {
        luma.push(luminance(px[0], px[1], px[2]));
    }
    let gray = GrayImage::from_raw(bitmap.width, bitmap.height, luma).ok_or(
        PrinterError::MalformedBitmap {
            expected: width * bitmap.height as usize,
            actual: bitmap.rgba.len() / 4,
        },
    )?;
    let dithered = dithering::apply(gray, dither);
    let rows = dithered
        .rows()
        .map(|row| row.map(|px| px[0] < INK_THRESHOLD).collect())
        .collect();
    Ok(rows)
}

/// Packs one 384-pixel monochrome row: bit `d` of byte `i` is pixel `i*8+d`.
pub fn pack_mono_line(row: &[bool]) -> Result<Vec<u8>, PrinterError> {
    if row.len() != PRINT_WIDTH {
        return Err(PrinterError::InvalidRowLength {
            expected: PRINT_WIDTH,
            actual: row.len(),
        });
    }
    let mut out = vec![0u8; LINE_BYTES_1BPP];
    for (i, &ink) in row.iter().enumerate() {
        if ink {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    Ok(out)
}

/// Packs one 384-pixel grayscale row (levels 0-15), two pixels per byte.
pub fn pack_gray_line(levels: &[u8]) -> Result<Vec<u8>, PrinterError> {
    if levels.len() != PRINT_WIDTH {
        return Err(PrinterError::InvalidRowLength {
            expected: PRINT_WIDTH,
            actual: levels.len(),
        });
    }
    let mut out = Vec::with_capacity(LINE_BYTES_4BPP);
    for pair in levels.chunks_exact(2) {
        out.push(((pair[0] & 0x0F) << 4) | (pair[1] & 0x0F));
    }
    Ok(out)
}

/// Packs a whole monochrome image: 180° rotation (rows reversed, pixels
/// reversed within each row), then per-row packing, then blank-line padding
/// up to [`MIN_LINES`]. Padding happens here, once, at whole-buffer
/// granularity; it carries no image content.
pub fn pack_image(rows: &[Vec<bool>]) -> Result<Vec<Vec<u8>>, PrinterError> {
    let mut lines = Vec::with_capacity(rows.len().max(MIN_LINES));
    for row in rows.iter().rev() {
        let flipped: Vec<bool> = row.iter().rev().copied().collect();
        lines.push(pack_mono_line(&flipped)?);
    }
    while lines.len() < MIN_LINES {
        lines.push(vec![0u8; LINE_BYTES_1BPP]);
    }
    Ok(lines)
}

/// 4bpp counterpart of [`pack_image`].
pub fn pack_gray_image(rows: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, PrinterError> {
    let mut lines = Vec::with_capacity(rows.len().max(MIN_LINES));
    for row in rows.iter().rev() {
        let flipped: Vec<u8> = row.iter().rev().copied().collect();
        lines.push(pack_gray_line(&flipped)?);
    }
    while lines.len() < MIN_LINES {
        lines.push(vec![0u8; LINE_BYTES_4BPP]);
    }
    Ok(lines)
}
