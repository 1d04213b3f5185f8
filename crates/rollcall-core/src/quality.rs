//! Image quality gate.
//!
//! Rejects images that are unsuitable for reliable face encoding before any
//! detector or encoder work is done. Checks run in a fixed order and stop at
//! the first failure.

use image::{DynamicImage, GrayImage, Luma};
use imageproc::edges::canny;
use imageproc::filter::laplacian_filter;
use serde::Serialize;
use thiserror::Error;

const MIN_WIDTH: u32 = 200;
const MIN_HEIGHT: u32 = 200;
const MIN_BRIGHTNESS: f64 = 30.0;
const MAX_BRIGHTNESS: f64 = 220.0;
const MIN_CONTRAST: f64 = 15.0;
const MIN_SHARPNESS: f64 = 50.0;
const MIN_EDGE_DENSITY: f64 = 0.005;
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;

/// Why an image was turned away. The message is meant for the end user.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QualityRejection {
    #[error("could not read image: {0}")]
    Undecodable(String),
    #[error("image too small ({width}x{height}); please use a larger image")]
    TooSmall { width: u32, height: u32 },
    #[error("image too dark; please improve lighting")]
    TooDark { brightness: f64 },
    #[error("image too bright; please reduce lighting")]
    TooBright { brightness: f64 },
    #[error("image has low contrast; please improve lighting")]
    LowContrast { contrast: f64 },
    #[error("image is blurry; please hold the camera steady")]
    Blurry { sharpness: f64 },
    #[error("no clear facial features detected; please position your face clearly")]
    NoFacialStructure { edge_density: f64 },
}

/// Tunable limits for each check.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityThresholds {
    pub min_width: u32,
    pub min_height: u32,
    pub min_brightness: f64,
    pub max_brightness: f64,
    pub min_contrast: f64,
    /// Minimum variance of the Laplacian.
    pub min_sharpness: f64,
    /// Minimum fraction of Canny edge pixels over the whole frame.
    pub min_edge_density: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_width: MIN_WIDTH,
            min_height: MIN_HEIGHT,
            min_brightness: MIN_BRIGHTNESS,
            max_brightness: MAX_BRIGHTNESS,
            min_contrast: MIN_CONTRAST,
            min_sharpness: MIN_SHARPNESS,
            min_edge_density: MIN_EDGE_DENSITY,
        }
    }
}

/// Measurements of an image that passed the gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub width: u32,
    pub height: u32,
    pub brightness: f64,
    pub contrast: f64,
    pub sharpness: f64,
    pub edge_density: f64,
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    thresholds: QualityThresholds,
}

impl QualityGate {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Decode raw bytes and assess them. Returns the decoded image so the
    /// caller does not decode twice.
    pub fn assess_bytes(
        &self,
        bytes: &[u8],
    ) -> Result<(DynamicImage, QualityReport), QualityRejection> {
        let image = decode(bytes)?;
        let report = self.assess(&image)?;
        Ok((image, report))
    }

    pub fn assess(&self, image: &DynamicImage) -> Result<QualityReport, QualityRejection> {
        let t = &self.thresholds;
        let gray = bt601_luma(image);
        let (width, height) = gray.dimensions();

        if width < t.min_width || height < t.min_height {
            return Err(QualityRejection::TooSmall { width, height });
        }

        let (brightness, contrast) = mean_and_std(gray.as_raw().iter().map(|&p| p as f64));
        if brightness < t.min_brightness {
            return Err(QualityRejection::TooDark { brightness });
        }
        if brightness > t.max_brightness {
            return Err(QualityRejection::TooBright { brightness });
        }
        if contrast < t.min_contrast {
            return Err(QualityRejection::LowContrast { contrast });
        }

        let sharpness = laplacian_variance(&gray);
        if sharpness < t.min_sharpness {
            return Err(QualityRejection::Blurry { sharpness });
        }

        let edge_density = edge_density(&gray);
        if edge_density < t.min_edge_density {
            return Err(QualityRejection::NoFacialStructure { edge_density });
        }

        Ok(QualityReport {
            width,
            height,
            brightness,
            contrast,
            sharpness,
            edge_density,
        })
    }
}

/// Decode an encoded image (JPEG, PNG, ...) from memory.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, QualityRejection> {
    if bytes.is_empty() {
        return Err(QualityRejection::Undecodable("empty image".into()));
    }
    image::load_from_memory(bytes).map_err(|e| QualityRejection::Undecodable(e.to_string()))
}

/// Grayscale with BT.601 weights (0.299, 0.587, 0.114) in 14-bit fixed point.
/// `image`'s own `to_luma8` uses Rec. 709 weights, which shift brightness on
/// saturated colours.
pub fn bt601_luma(image: &DynamicImage) -> GrayImage {
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let luma = (r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + (1 << 13)) >> 14;
        Luma([luma as u8])
    })
}

/// Population mean and standard deviation.
pub(crate) fn mean_and_std(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let mut n = 0u64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for v in values {
        n += 1;
        sum += v;
        sum_sq += v * v;
    }
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / n as f64;
    let variance = (sum_sq / n as f64 - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

/// Variance of the 4-neighbour Laplacian response: a cheap focus measure.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let lap = laplacian_filter(gray);
    let (_, std) = mean_and_std(lap.as_raw().iter().map(|&v| v as f64));
    std * std
}

/// Fraction of pixels marked as edges by the Canny detector.
pub fn edge_density(gray: &GrayImage) -> f64 {
    let total = gray.width() as u64 * gray.height() as u64;
    if total == 0 {
        return 0.0;
    }
    let edges = canny(gray, CANNY_LOW, CANNY_HIGH);
    let count = edges.as_raw().iter().filter(|&&p| p > 0).count();
    count as f64 / total as f64
}

#[cfg(test)]
pub(crate) mod test_images {
    use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
    use std::io::Cursor;

    /// Checkerboard of `square`-pixel cells alternating `dark` and `light`.
    pub fn checkerboard(width: u32, height: u32, square: u32, dark: u8, light: u8) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            let v = if ((x / square) + (y / square)) % 2 == 0 { dark } else { light };
            Rgb([v, v, v])
        });
        DynamicImage::ImageRgb8(img)
    }

    pub fn uniform(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([value])))
    }

    /// Smooth left-to-right ramp 0..=255.
    pub fn ramp(width: u32, height: u32) -> DynamicImage {
        let img = GrayImage::from_fn(width, height, |x, _| {
            Luma([(x * 255 / (width - 1)) as u8])
        });
        DynamicImage::ImageLuma8(img)
    }

    pub fn png_bytes(image: &DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::test_images::*;
    use super::*;
    use image::{Rgb, RgbImage};

    fn gate() -> QualityGate {
        QualityGate::default()
    }

    #[test]
    fn test_good_checkerboard_passes() {
        let img = checkerboard(256, 256, 8, 60, 190);
        let report = gate().assess(&img).unwrap();
        assert_eq!((report.width, report.height), (256, 256));
        assert!((report.brightness - 125.0).abs() < 1e-6);
        assert!((report.contrast - 65.0).abs() < 1e-6);
        assert!(report.sharpness > MIN_SHARPNESS);
        assert!(report.edge_density > MIN_EDGE_DENSITY);
    }

    #[test]
    fn test_small_image_rejected_first() {
        // Too small and too dark: size wins because it is checked first.
        let img = uniform(199, 300, 0);
        assert_eq!(
            gate().assess(&img),
            Err(QualityRejection::TooSmall {
                width: 199,
                height: 300
            })
        );

        let img = checkerboard(100, 100, 8, 60, 190);
        assert!(matches!(
            gate().assess(&img),
            Err(QualityRejection::TooSmall { .. })
        ));
    }

    #[test]
    fn test_dark_image_rejected() {
        let img = checkerboard(256, 256, 8, 0, 40);
        assert!(matches!(
            gate().assess(&img),
            Err(QualityRejection::TooDark { .. })
        ));
    }

    #[test]
    fn test_bright_image_rejected() {
        let img = checkerboard(256, 256, 8, 210, 250);
        assert!(matches!(
            gate().assess(&img),
            Err(QualityRejection::TooBright { .. })
        ));
    }

    #[test]
    fn test_flat_image_rejected_for_contrast() {
        let img = uniform(256, 256, 128);
        assert!(matches!(
            gate().assess(&img),
            Err(QualityRejection::LowContrast { .. })
        ));
    }

    #[test]
    fn test_smooth_ramp_rejected_as_blurry() {
        let img = ramp(256, 256);
        assert!(matches!(
            gate().assess(&img),
            Err(QualityRejection::Blurry { .. })
        ));
    }

    #[test]
    fn test_fine_texture_without_edges_rejected() {
        // A gentle ramp plus a one-pixel dither: sharp enough for the
        // Laplacian, but the dither vanishes under Canny's smoothing.
        let img = GrayImage::from_fn(256, 256, |x, y| {
            let dither = if (x + y) % 2 == 0 { 6 } else { 0 };
            Luma([(x as f32 * 0.8) as u8 + dither])
        });
        let result = gate().assess(&DynamicImage::ImageLuma8(img));
        assert!(
            matches!(result, Err(QualityRejection::NoFacialStructure { .. })),
            "got {result:?}"
        );
    }

    #[test]
    fn test_undecodable_bytes() {
        assert!(matches!(
            gate().assess_bytes(b"definitely not a picture"),
            Err(QualityRejection::Undecodable(_))
        ));
        assert!(matches!(
            gate().assess_bytes(&[]),
            Err(QualityRejection::Undecodable(_))
        ));
    }

    #[test]
    fn test_assess_bytes_roundtrips_png() {
        let img = checkerboard(240, 220, 10, 50, 200);
        let (decoded, report) = gate().assess_bytes(&png_bytes(&img)).unwrap();
        assert_eq!(decoded.width(), 240);
        assert_eq!(report.height, 220);
    }

    #[test]
    fn test_custom_thresholds() {
        let gate = QualityGate::new(QualityThresholds {
            min_width: 50,
            min_height: 50,
            ..QualityThresholds::default()
        });
        assert!(gate.assess(&checkerboard(64, 64, 8, 60, 190)).is_ok());
    }

    #[test]
    fn test_bt601_luma_weights() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(3, 2, |x, _| match x {
            0 => Rgb([255, 0, 0]),
            1 => Rgb([0, 200, 0]),
            _ => Rgb([0, 0, 255]),
        }));
        let gray = bt601_luma(&img);
        assert_eq!(gray.get_pixel(0, 1).0, [76]);
        assert_eq!(gray.get_pixel(1, 1).0, [117]);
        assert_eq!(gray.get_pixel(2, 1).0, [29]);

        for v in [0u8, 1, 60, 127, 190, 255] {
            assert_eq!(bt601_luma(&uniform(1, 1, v)).get_pixel(0, 0).0, [v]);
        }
    }

    #[test]
    fn test_saturated_blue_is_dark() {
        // BT.601 puts blue at 29; Rec. 709 weights would read it as 18.
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(256, 256, Rgb([0, 0, 255])));
        match gate().assess(&img) {
            Err(QualityRejection::TooDark { brightness }) => assert_eq!(brightness, 29.0),
            other => panic!("expected TooDark, got {other:?}"),
        }
    }

    #[test]
    fn test_mean_and_std() {
        let (mean, std) = mean_and_std([2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].into_iter());
        assert!((mean - 5.0).abs() < 1e-12);
        assert!((std - 2.0).abs() < 1e-12);
        assert_eq!(mean_and_std(std::iter::empty()), (0.0, 0.0));
    }
}
