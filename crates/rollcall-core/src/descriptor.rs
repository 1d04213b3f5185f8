//! Hand-engineered diagnostic descriptor.
//!
//! Used only for offline quality testing. It is never compared against the
//! match index and must not be mixed up with the 128-d face embedding.
//!
//! Layout, over a 256×256 canonical frame split into 16×16 cells:
//! orientation histograms, one LBP histogram, per-channel color histograms
//! in four color spaces, per-cell edge densities, per-cell texture
//! statistics and fixed-region "landmark proxy" statistics.

use crate::quality::mean_and_std;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage};
use imageproc::edges::canny;
use imageproc::filter::laplacian_filter;
use imageproc::gradients::{horizontal_sobel, sobel_gradients, vertical_sobel};
use std::f32::consts::PI;

pub const CANONICAL_SIZE: u32 = 256;
const CELL: u32 = 16;
const CELLS: usize = ((CANONICAL_SIZE / CELL) * (CANONICAL_SIZE / CELL)) as usize;
const ORIENTATION_BINS: usize = 12;
const LBP_BINS: usize = 256;
const COLOR_BINS: usize = 32;
const COLOR_SPACES: usize = 4;
const EDGE_FEATURES: usize = 3;
const TEXTURE_FEATURES: usize = 5;
const LANDMARK_REGIONS: [(u32, u32, u32, u32); 4] = [
    // (top, bottom, left, right)
    (80, 120, 80, 176),   // left eye
    (80, 120, 176, 272),  // right eye (clipped to the frame)
    (120, 160, 128, 192), // nose
    (160, 200, 96, 224),  // mouth
];

/// Total descriptor length.
pub const DESCRIPTOR_LEN: usize = CELLS * ORIENTATION_BINS
    + LBP_BINS
    + COLOR_SPACES * 3 * COLOR_BINS
    + CELLS * EDGE_FEATURES
    + CELLS * TEXTURE_FEATURES
    + LANDMARK_REGIONS.len() * 3;

const EPS: f32 = 1e-6;

/// Compute the diagnostic descriptor for any image size.
pub fn compute(image: &DynamicImage) -> Vec<f32> {
    let rgb = imageops::resize(
        &image.to_rgb8(),
        CANONICAL_SIZE,
        CANONICAL_SIZE,
        FilterType::Triangle,
    );
    let gray = imageops::grayscale(&rgb);

    let mut out = Vec::with_capacity(DESCRIPTOR_LEN);
    orientation_histograms(&gray, &mut out);
    lbp_histogram(&gray, &mut out);
    color_histograms(&rgb, &mut out);
    edge_densities(&gray, &mut out);
    texture_statistics(&gray, &mut out);
    landmark_proxies(&gray, &mut out);
    debug_assert_eq!(out.len(), DESCRIPTOR_LEN);
    out
}

/// Standardize each feature column across a batch (zero mean, unit
/// variance). Constant columns become zero.
pub fn normalize_batch(batch: &mut [Vec<f32>]) {
    let Some(width) = batch.first().map(Vec::len) else {
        return;
    };
    for col in 0..width {
        let (mean, std) = mean_and_std(
            batch
                .iter()
                .filter_map(|row| row.get(col))
                .map(|&v| v as f64),
        );
        for row in batch.iter_mut() {
            if let Some(v) = row.get_mut(col) {
                *v = if std > 0.0 {
                    ((*v as f64 - mean) / std) as f32
                } else {
                    0.0
                };
            }
        }
    }
}

/// Top-left corners of all 16×16 cells, row-major.
fn cells() -> impl Iterator<Item = (u32, u32)> {
    (0..CANONICAL_SIZE)
        .step_by(CELL as usize)
        .flat_map(|y| (0..CANONICAL_SIZE).step_by(CELL as usize).map(move |x| (x, y)))
}

fn cell_coords(x0: u32, y0: u32) -> impl Iterator<Item = (u32, u32)> {
    (y0..y0 + CELL).flat_map(move |y| (x0..x0 + CELL).map(move |x| (x, y)))
}

fn push_normalized(hist: &[f32], out: &mut Vec<f32>) {
    let total: f32 = hist.iter().sum();
    out.extend(hist.iter().map(|h| h / (total + EPS)));
}

fn orientation_histograms(gray: &GrayImage, out: &mut Vec<f32>) {
    let gx = horizontal_sobel(gray);
    let gy = vertical_sobel(gray);
    let bin_width = 2.0 * PI / ORIENTATION_BINS as f32;

    for (x0, y0) in cells() {
        let mut hist = [0.0f32; ORIENTATION_BINS];
        for (x, y) in cell_coords(x0, y0) {
            let dx = gx.get_pixel(x, y)[0] as f32;
            let dy = gy.get_pixel(x, y)[0] as f32;
            let magnitude = (dx * dx + dy * dy).sqrt();
            let angle = dy.atan2(dx).rem_euclid(2.0 * PI);
            let bin = ((angle / bin_width) as usize).min(ORIENTATION_BINS - 1);
            hist[bin] += magnitude;
        }
        push_normalized(&hist, out);
    }
}

fn lbp_histogram(gray: &GrayImage, out: &mut Vec<f32>) {
    // Clockwise from the top-left neighbour.
    const NEIGHBOURS: [(i32, i32); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];
    let (w, h) = gray.dimensions();
    let mut hist = [0.0f32; LBP_BINS];

    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            let centre = gray.get_pixel(x, y)[0];
            let code = NEIGHBOURS
                .iter()
                .enumerate()
                .fold(0usize, |code, (bit, &(dx, dy))| {
                    let n = gray.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0];
                    if n >= centre {
                        code | (1 << bit)
                    } else {
                        code
                    }
                });
            hist[code] += 1.0;
        }
    }
    push_normalized(&hist, out);
}

fn color_histograms(rgb: &RgbImage, out: &mut Vec<f32>) {
    let mut hists = [[0.0f32; COLOR_BINS]; COLOR_SPACES * 3];
    let bin = |v: u8| v as usize * COLOR_BINS / 256;

    for pixel in rgb.pixels() {
        let [r, g, b] = pixel.0;
        let spaces = [[r, g, b], rgb_to_hsv(r, g, b), rgb_to_lab(r, g, b), rgb_to_yuv(r, g, b)];
        for (s, channels) in spaces.iter().enumerate() {
            for (c, &v) in channels.iter().enumerate() {
                hists[s * 3 + c][bin(v)] += 1.0;
            }
        }
    }
    for hist in &hists {
        push_normalized(hist, out);
    }
}

fn edge_densities(gray: &GrayImage, out: &mut Vec<f32>) {
    let edges = canny(gray, 50.0, 150.0);
    let sobel = sobel_gradients(gray);
    let laplacian = laplacian_filter(gray);
    let area = (CELL * CELL) as f32;

    for (x0, y0) in cells() {
        let (mut edge_count, mut sobel_sum, mut lap_sum) = (0.0f32, 0.0f32, 0.0f32);
        for (x, y) in cell_coords(x0, y0) {
            if edges.get_pixel(x, y)[0] > 0 {
                edge_count += 1.0;
            }
            sobel_sum += sobel.get_pixel(x, y)[0] as f32;
            lap_sum += (laplacian.get_pixel(x, y)[0] as f32).abs();
        }
        out.extend([edge_count / area, sobel_sum / area, lap_sum / area]);
    }
}

fn texture_statistics(gray: &GrayImage, out: &mut Vec<f32>) {
    for (x0, y0) in cells() {
        let values: Vec<f64> = cell_coords(x0, y0)
            .map(|(x, y)| gray.get_pixel(x, y)[0] as f64)
            .collect();
        let (mean, std) = mean_and_std(values.iter().copied());

        let mut hist = [0.0f64; 256];
        for &v in &values {
            hist[v as usize] += 1.0;
        }
        let n = values.len() as f64;
        let (mut entropy, mut energy) = (0.0f64, 0.0f64);
        for p in hist.iter().map(|c| c / n).filter(|&p| p > 0.0) {
            entropy -= p * p.log2();
            energy += p * p;
        }

        let (skewness, kurtosis) = if std > 0.0 {
            let moment = |k: i32| values.iter().map(|v| ((v - mean) / std).powi(k)).sum::<f64>() / n;
            (moment(3), moment(4))
        } else {
            (0.0, 0.0)
        };

        out.extend([std * std, entropy, energy, skewness, kurtosis].map(|v| v as f32));
    }
}

fn landmark_proxies(gray: &GrayImage, out: &mut Vec<f32>) {
    let (w, h) = gray.dimensions();
    for &(top, bottom, left, right) in &LANDMARK_REGIONS {
        let (bottom, right) = (bottom.min(h), right.min(w));
        let (mean, std) = mean_and_std(
            (top..bottom)
                .flat_map(|y| (left..right).map(move |x| (x, y)))
                .map(|(x, y)| gray.get_pixel(x, y)[0] as f64),
        );
        out.extend([mean as f32, std as f32, (std * std) as f32]);
    }
}

/// 8-bit HSV with hue in 0..180, matching common vision-library scaling.
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let sat = if max == 0.0 { 0.0 } else { delta / max * 255.0 };

    [(hue / 2.0).round() as u8, sat.round() as u8, max as u8]
}

/// 8-bit CIE L*a*b* (D65): L scaled to 0..255, a/b offset by 128.
fn rgb_to_lab(r: u8, g: u8, b: u8) -> [u8; 3] {
    let linear = |c: u8| {
        let c = c as f32 / 255.0;
        if c <= 0.04045 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    };
    let (r, g, b) = (linear(r), linear(g), linear(b));
    let x = (0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b) / 0.950_47;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175 * b;
    let z = (0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b) / 1.088_83;

    let f = |t: f32| {
        if t > 0.008_856 {
            t.cbrt()
        } else {
            7.787 * t + 16.0 / 116.0
        }
    };
    let (fx, fy, fz) = (f(x), f(y), f(z));
    let l = 116.0 * fy - 16.0;
    let a = 500.0 * (fx - fy);
    let bb = 200.0 * (fy - fz);

    [
        (l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8,
        (a + 128.0).round().clamp(0.0, 255.0) as u8,
        (bb + 128.0).round().clamp(0.0, 255.0) as u8,
    ]
}

/// BT.601 YUV with chroma offset by 128.
fn rgb_to_yuv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = 0.492 * (b - y) + 128.0;
    let v = 0.877 * (r - y) + 128.0;
    [y, u, v].map(|c| c.round().clamp(0.0, 255.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::test_images::{checkerboard, uniform};

    fn lbp_section(desc: &[f32]) -> &[f32] {
        let start = CELLS * ORIENTATION_BINS;
        &desc[start..start + LBP_BINS]
    }

    #[test]
    fn test_length_is_fixed() {
        assert_eq!(compute(&checkerboard(256, 256, 8, 60, 190)).len(), DESCRIPTOR_LEN);
        assert_eq!(compute(&checkerboard(640, 480, 12, 30, 220)).len(), DESCRIPTOR_LEN);
        assert_eq!(compute(&uniform(50, 300, 90)).len(), DESCRIPTOR_LEN);
    }

    #[test]
    fn test_all_values_finite_on_flat_image() {
        let desc = compute(&uniform(256, 256, 128));
        assert!(desc.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_lbp_histogram_sums_to_one() {
        let desc = compute(&checkerboard(256, 256, 8, 60, 190));
        let total: f32 = lbp_section(&desc).iter().sum();
        assert!((total - 1.0).abs() < 1e-3, "sum = {total}");
    }

    #[test]
    fn test_flat_image_lbp_all_in_top_code() {
        // Every neighbour equals the centre, so every code has all bits set.
        let desc = compute(&uniform(256, 256, 128));
        let lbp = lbp_section(&desc);
        assert!((lbp[255] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_color_conversions_on_grey() {
        assert_eq!(rgb_to_hsv(128, 128, 128), [0, 0, 128]);
        assert_eq!(rgb_to_yuv(128, 128, 128), [128, 128, 128]);
        let lab = rgb_to_lab(255, 255, 255);
        assert_eq!(lab[0], 255);
        assert!((lab[1] as i32 - 128).abs() <= 1 && (lab[2] as i32 - 128).abs() <= 1);
    }

    #[test]
    fn test_hsv_primary_hues() {
        assert_eq!(rgb_to_hsv(255, 0, 0), [0, 255, 255]);
        assert_eq!(rgb_to_hsv(0, 255, 0), [60, 255, 255]);
        assert_eq!(rgb_to_hsv(0, 0, 255), [120, 255, 255]);
    }

    #[test]
    fn test_normalize_batch_standardizes_columns() {
        let mut batch = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        normalize_batch(&mut batch);
        assert!((batch[0][0] + 1.0).abs() < 1e-6);
        assert!((batch[1][0] - 1.0).abs() < 1e-6);
        assert_eq!(batch[0][1], 0.0);
        assert_eq!(batch[1][1], 0.0);

        let mut empty: Vec<Vec<f32>> = Vec::new();
        normalize_batch(&mut empty);
    }
}
