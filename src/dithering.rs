//! Grayscale-to-bilevel conversion applied before pixel packing.
//!
//! Thermal heads print full-on dots, so continuous-tone input has to be
//! reduced to ink/no-ink before it hits the packer. Plain thresholding is
//! the contract baseline; the dithers trade it for better perceived tone.

use image::{GrayImage, Luma};
use imageproc::drawing::draw_filled_circle_mut;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dithering {
    #[default]
    Threshold,
    FloydSteinberg,
    Atkinson,
    Bayer,
    Halftone,
}

/// Error-diffusion kernel: (dx, dy, weight) taps over a common denominator.
struct DiffusionKernel {
    taps: &'static [(i32, i32, i16)],
    denom: i16,
}

const FLOYD_STEINBERG: DiffusionKernel = DiffusionKernel {
    taps: &[(1, 0, 7), (-1, 1, 3), (0, 1, 5), (1, 1, 1)],
    denom: 16,
};

const ATKINSON: DiffusionKernel = DiffusionKernel {
    taps: &[(1, 0, 1), (2, 0, 1), (-1, 1, 1), (0, 1, 1), (1, 1, 1), (0, 2, 1)],
    denom: 8,
};

/// Reduces a grayscale image to pure black/white with the chosen algorithm.
pub fn apply(img: GrayImage, dithering: Dithering) -> GrayImage {
    match dithering {
        Dithering::Threshold => threshold(img),
        Dithering::FloydSteinberg => diffuse(img, &FLOYD_STEINBERG),
        Dithering::Atkinson => diffuse(img, &ATKINSON),
        Dithering::Bayer => ordered(img),
        Dithering::Halftone => halftone(&img),
    }
}

fn threshold(mut img: GrayImage) -> GrayImage {
    for pixel in img.pixels_mut() {
        pixel[0] = if pixel[0] > 127 { 255 } else { 0 };
    }
    img
}

fn diffuse(mut img: GrayImage, kernel: &DiffusionKernel) -> GrayImage {
    let (width, height) = img.dimensions();
    for y in 0..height {
        for x in 0..width {
            let old = img.get_pixel(x, y)[0];
            let new = if old > 127 { 255u8 } else { 0u8 };
            img.put_pixel(x, y, Luma([new]));
            let error = old as i16 - new as i16;
            for &(dx, dy, weight) in kernel.taps {
                let nx = x as i32 + dx;
                let ny = y as i32 + dy;
                if nx < 0 || nx >= width as i32 || ny >= height as i32 {
                    continue;
                }
                let neighbor = img.get_pixel(nx as u32, ny as u32)[0] as i16;
                let adjusted = (neighbor + error * weight / kernel.denom).clamp(0, 255);
                img.put_pixel(nx as u32, ny as u32, Luma([adjusted as u8]));
            }
        }
    }
    img
}

fn ordered(mut img: GrayImage) -> GrayImage {
    const BAYER_MATRIX: [[u8; 4]; 4] = [
        [0, 8, 2, 10],
        [12, 4, 14, 6],
        [3, 11, 1, 9],
        [15, 7, 13, 5],
    ];
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let cell = BAYER_MATRIX[(y % 4) as usize][(x % 4) as usize] as u16;
        // threshold at the center of each matrix step so pure black and
        // pure white stay solid
        pixel[0] = if pixel[0] as u16 > cell * 16 + 8 { 255 } else { 0 };
    }
    img
}

/// Classic clustered-dot halftone: average 4x4 cells, render each as a
/// filled circle sized by darkness. Output dimensions are the input's
/// rounded up to the cell size.
fn halftone(img: &GrayImage) -> GrayImage {
    const CELL: u32 = 4;
    let (width, height) = img.dimensions();
    let out_w = CELL * width.div_ceil(CELL);
    let out_h = CELL * height.div_ceil(CELL);
    let mut canvas = GrayImage::from_pixel(out_w, out_h, Luma([255]));

    for cy in (0..height).step_by(CELL as usize) {
        for cx in (0..width).step_by(CELL as usize) {
            let mut sum = 0u32;
            let mut n = 0u32;
            for dy in 0..CELL {
                for dx in 0..CELL {
                    if cx + dx < width && cy + dy < height {
                        sum += img.get_pixel(cx + dx, cy + dy)[0] as u32;
                        n += 1;
                    }
                }
            }
            let darkness = 1.0 - (sum as f32 / n as f32) / 255.0;
            let radius = (3.0 * darkness * CELL as f32 / 2.0) as i32;
            if radius > 0 {
                let mut cell = GrayImage::from_pixel(CELL, CELL, Luma([255]));
                draw_filled_circle_mut(
                    &mut cell,
                    (CELL as i32 / 2, CELL as i32 / 2),
                    radius,
                    Luma([0]),
                );
                image::imageops::overlay(&mut canvas, &cell, cx as i64, cy as i64);
            }
        }
    }
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(value: u8) -> GrayImage {
        GrayImage::from_pixel(16, 16, Luma([value]))
    }

    #[test]
    fn threshold_is_bilevel() {
        let out = apply(uniform(127), Dithering::Threshold);
        assert!(out.pixels().all(|p| p[0] == 0));
        let out = apply(uniform(128), Dithering::Threshold);
        assert!(out.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn diffusion_output_is_bilevel() {
        for dithering in [Dithering::FloydSteinberg, Dithering::Atkinson] {
            let out = apply(uniform(128), dithering);
            assert!(out.pixels().all(|p| p[0] == 0 || p[0] == 255));
        }
    }

    #[test]
    fn floyd_steinberg_mid_gray_is_half_ink() {
        let out = apply(uniform(128), Dithering::FloydSteinberg);
        let ink = out.pixels().filter(|p| p[0] == 0).count();
        let total = (out.width() * out.height()) as usize;
        // mid gray should land near 50% coverage
        assert!(ink > total / 4 && ink < 3 * total / 4);
    }

    #[test]
    fn bayer_extremes_are_solid() {
        assert!(apply(uniform(0), Dithering::Bayer).pixels().all(|p| p[0] == 0));
        assert!(apply(uniform(255), Dithering::Bayer).pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn halftone_preserves_aligned_dimensions() {
        let out = apply(uniform(60), Dithering::Halftone);
        assert_eq!(out.dimensions(), (16, 16));
    }
}
