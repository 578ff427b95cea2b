//! Downsampling to the fiducial-search working resolution.
//!
//! Fiducial search only needs coarse geometry, so it runs on a raster
//! whose longest axis is at most `working_resolution`. The scale factors
//! are returned so located anchors can be mapped back to full-resolution
//! coordinates before rectification.

use std::fmt;

use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Resampling filter used when downsampling.
///
/// Ordered from fastest/lowest-quality to slowest/highest-quality,
/// with a `Disabled` variant to skip downsampling entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DownsampleFilter {
    /// Skip downsampling regardless of image size.
    Disabled,
    /// Nearest-neighbor: fastest, blocky artifacts.
    Nearest,
    /// Bilinear interpolation: fast, decent quality.
    #[default]
    Triangle,
    /// Bicubic (Catmull-Rom): moderate speed, good quality.
    CatmullRom,
    /// Gaussian: moderate speed, smooth output.
    Gaussian,
    /// Lanczos with 3 lobes: slowest, sharpest.
    Lanczos3,
}

impl DownsampleFilter {
    /// Convert to the `image` crate's `FilterType`.
    ///
    /// Returns `None` for [`DownsampleFilter::Disabled`].
    const fn to_image_filter(self) -> Option<image::imageops::FilterType> {
        match self {
            Self::Disabled => None,
            Self::Nearest => Some(image::imageops::FilterType::Nearest),
            Self::Triangle => Some(image::imageops::FilterType::Triangle),
            Self::CatmullRom => Some(image::imageops::FilterType::CatmullRom),
            Self::Gaussian => Some(image::imageops::FilterType::Gaussian),
            Self::Lanczos3 => Some(image::imageops::FilterType::Lanczos3),
        }
    }
}

impl fmt::Display for DownsampleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Nearest => f.write_str("Nearest"),
            Self::Triangle => f.write_str("Triangle"),
            Self::CatmullRom => f.write_str("CatmullRom"),
            Self::Gaussian => f.write_str("Gaussian"),
            Self::Lanczos3 => f.write_str("Lanczos3"),
        }
    }
}

/// A possibly downsampled raster plus the factors that map full-resolution
/// coordinates onto it.
#[derive(Debug, Clone)]
pub struct Downsampled {
    /// The working raster.
    pub image: GrayImage,
    /// Working width divided by full width.
    pub scale_x: f64,
    /// Working height divided by full height.
    pub scale_y: f64,
    /// Whether resampling was actually applied.
    pub applied: bool,
}

/// Downsample so the longest axis is at most `max_dimension` pixels.
///
/// Images already within the limit (or a `Disabled` filter) are returned
/// unchanged with unit scale.
#[must_use]
pub fn downsample(image: &GrayImage, max_dimension: u32, filter: DownsampleFilter) -> Downsampled {
    let unchanged = || Downsampled {
        image: image.clone(),
        scale_x: 1.0,
        scale_y: 1.0,
        applied: false,
    };

    let Some(image_filter) = filter.to_image_filter() else {
        return unchanged();
    };

    let (w, h) = image.dimensions();
    let long_axis = w.max(h);
    if long_axis <= max_dimension || max_dimension == 0 {
        return unchanged();
    }

    let shrink = |v: u32| {
        let scaled = u64::from(v) * u64::from(max_dimension) / u64::from(long_axis);
        u32::try_from(scaled).unwrap_or(max_dimension).max(1)
    };
    let (nw, nh) = (shrink(w), shrink(h));
    let resized = image::imageops::resize(image, nw, nh, image_filter);

    Downsampled {
        image: resized,
        scale_x: f64::from(nw) / f64::from(w),
        scale_y: f64::from(nh) / f64::from(h),
        applied: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image(w: u32, h: u32) -> GrayImage {
        GrayImage::from_pixel(w, h, image::Luma([128]))
    }

    #[test]
    fn default_filter_is_triangle() {
        assert_eq!(DownsampleFilter::default(), DownsampleFilter::Triangle);
    }

    #[test]
    fn no_downsample_when_already_small() {
        let result = downsample(&test_image(100, 80), 256, DownsampleFilter::Triangle);
        assert!(!result.applied);
        assert_eq!(result.image.dimensions(), (100, 80));
        assert!((result.scale_x - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn downsample_landscape() {
        let result = downsample(&test_image(1024, 768), 256, DownsampleFilter::Triangle);
        assert!(result.applied);
        assert_eq!(result.image.dimensions(), (256, 192));
        assert!((result.scale_x - 0.25).abs() < 1e-12);
        assert!((result.scale_y - 0.25).abs() < 1e-12);
    }

    #[test]
    fn downsample_portrait() {
        let result = downsample(&test_image(700, 800), 400, DownsampleFilter::Triangle);
        assert!(result.applied);
        assert_eq!(result.image.dimensions(), (350, 400));
        assert!((result.scale_x - 0.5).abs() < 1e-12);
    }

    #[test]
    fn disabled_filter_skips_even_large_image() {
        let result = downsample(&test_image(1024, 768), 256, DownsampleFilter::Disabled);
        assert!(!result.applied);
        assert_eq!(result.image.dimensions(), (1024, 768));
    }
}
