//! Per-block image quality assessment.
//!
//! Quality is measured on the block's region of the full-resolution image
//! because lighting and focus vary across a photographed sheet. The
//! assessment never fails: a poor region yields a report with issues,
//! which marks the block's answers as advisory.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::config::QualityConfig;
use crate::types::Point;

/// A failed quality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    /// The region is too small for reliable sampling.
    LowResolution,
    /// Too little edge energy: out of focus or motion blurred.
    Blurry,
    /// Grey levels are too uniform.
    LowContrast,
    /// No dark ink is visible: overexposed or washed out.
    Overexposed,
    /// No bright paper is visible: underexposed.
    Underexposed,
    /// The histogram spread is too narrow.
    NarrowDynamicRange,
}

/// Quality measurements for one block region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Region width in pixels.
    pub width: u32,
    /// Region height in pixels.
    pub height: u32,
    /// Variance of the 3x3 Laplacian response.
    pub sharpness: f64,
    /// RMS contrast (standard deviation of grey levels).
    pub contrast: f64,
    /// 1st percentile grey level.
    pub p_low: u8,
    /// 99th percentile grey level.
    pub p_high: u8,
    /// Failed checks, empty when the region is acceptable.
    pub issues: Vec<QualityIssue>,
}

impl QualityReport {
    /// Whether every check passed.
    #[must_use]
    pub fn is_acceptable(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Assess the axis-aligned bounding box of `corners`, padded by `margin`
/// pixels and clipped to the image.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn assess_region(
    gray: &GrayImage,
    corners: &[Point],
    margin: f64,
    config: &QualityConfig,
) -> QualityReport {
    let (w, h) = gray.dimensions();
    let clip = |v: f64, max: u32| v.clamp(0.0, f64::from(max)) as u32;
    let min_x = corners.iter().map(|p| p.x).fold(f64::INFINITY, f64::min) - margin;
    let max_x = corners.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max) + margin;
    let min_y = corners.iter().map(|p| p.y).fold(f64::INFINITY, f64::min) - margin;
    let max_y = corners.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max) + margin;
    let (x0, x1) = (clip(min_x.floor(), w), clip(max_x.ceil(), w));
    let (y0, y1) = (clip(min_y.floor(), h), clip(max_y.ceil(), h));

    let region =
        image::imageops::crop_imm(gray, x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
            .to_image();
    assess(&region, config)
}

/// Assess a whole raster.
#[must_use]
pub fn assess(region: &GrayImage, config: &QualityConfig) -> QualityReport {
    let (width, height) = region.dimensions();
    let sharpness = laplacian_variance(region);
    let contrast = rms_contrast(region);
    let (p_low, p_high) = percentiles(region);

    let mut issues = Vec::new();
    if width.min(height) < config.min_block_side_px {
        issues.push(QualityIssue::LowResolution);
    }
    if sharpness < config.min_sharpness {
        issues.push(QualityIssue::Blurry);
    }
    if contrast < config.min_contrast {
        issues.push(QualityIssue::LowContrast);
    }
    if p_low > config.max_ink_level {
        issues.push(QualityIssue::Overexposed);
    }
    if p_high < config.min_paper_level {
        issues.push(QualityIssue::Underexposed);
    }
    if p_high.saturating_sub(p_low) < config.min_dynamic_range {
        issues.push(QualityIssue::NarrowDynamicRange);
    }

    QualityReport {
        width,
        height,
        sharpness,
        contrast,
        p_low,
        p_high,
        issues,
    }
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
#[allow(clippy::cast_precision_loss)]
fn laplacian_variance(img: &GrayImage) -> f64 {
    let (w, h) = img.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = |x: u32, y: u32| f64::from(img.get_pixel(x, y).0[0]);
    let (mut sum, mut sum_sq, mut n) = (0.0, 0.0, 0.0);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = 4.0f64.mul_add(px(x, y), -(px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1)));
            sum += lap;
            sum_sq += lap * lap;
            n += 1.0;
        }
    }
    let mean = sum / n;
    mean.mul_add(-mean, sum_sq / n).max(0.0)
}

#[allow(clippy::cast_precision_loss)]
fn rms_contrast(img: &GrayImage) -> f64 {
    let n = img.pixels().len() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let (sum, sum_sq) = img.pixels().fold((0.0, 0.0), |(s, sq), p| {
        let v = f64::from(p.0[0]);
        (s + v, v.mul_add(v, sq))
    });
    let mean = sum / n;
    mean.mul_add(-mean, sum_sq / n).max(0.0).sqrt()
}

/// 1st and 99th percentile grey levels.
fn percentiles(img: &GrayImage) -> (u8, u8) {
    let mut histogram = [0_u64; 256];
    for p in img.pixels() {
        histogram[usize::from(p.0[0])] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return (0, 0);
    }
    (
        percentile(&histogram, total, 1),
        percentile(&histogram, total, 99),
    )
}

/// Smallest grey level whose cumulative count reaches `pct` percent.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn percentile(histogram: &[u64; 256], total: u64, pct: u64) -> u8 {
    let target = (total * pct).div_ceil(100).max(1);
    let mut cumulative = 0;
    for (level, &count) in histogram.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return level as u8;
        }
    }
    u8::MAX
}
