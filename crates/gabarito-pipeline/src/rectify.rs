//! Perspective normalization of one block.
//!
//! The four anchor centers are mapped onto the corners of a canonical
//! rectangle with a projective transform, and the full-resolution image is
//! resampled into that rectangle. Grid coordinates are defined relative to
//! the same rectangle, so after this step a template cell lands on the
//! same pixels no matter how the sheet was held.

use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{Interpolation, Projection, warp_into};

use crate::config::PipelineConfig;
use crate::geometry;
use crate::locate::LocatedBlock;
use crate::template::ANCHORS_PER_BLOCK;
use crate::types::BlockError;

/// Fill for samples falling outside the source image.
const OUTSIDE: Luma<u8> = Luma([255]);

/// Rectify `block` into a `width` x `height` raster.
///
/// # Errors
///
/// - [`BlockError::AnchorNotFound`] when fewer than four anchors resolved.
/// - [`BlockError::DegenerateAnchors`] when the anchors are not a convex
///   quadrilateral of plausible area, or no projective transform exists.
#[allow(clippy::cast_possible_truncation)]
pub fn rectify(
    gray: &GrayImage,
    block: &LocatedBlock,
    (width, height): (u32, u32),
    config: &PipelineConfig,
) -> Result<GrayImage, BlockError> {
    let Some(corners) = block.corners() else {
        return Err(BlockError::AnchorNotFound {
            resolved: block.resolved_count(),
            required: ANCHORS_PER_BLOCK,
        });
    };

    if !geometry::is_convex(&corners) {
        return Err(BlockError::DegenerateAnchors);
    }
    let area = geometry::area(&corners);
    if block.expected_area > 0.0 && area < block.expected_area * config.min_quad_area_ratio {
        return Err(BlockError::DegenerateAnchors);
    }

    // imageproc samples pixel `i` at coordinate `i`, while anchor centers
    // treat pixel `i` as spanning `[i, i + 1)`.
    let src = corners.map(|p| ((p.x - 0.5) as f32, (p.y - 0.5) as f32));
    #[allow(clippy::cast_precision_loss)]
    let (w, h) = (width as f32, height as f32);
    let dst = [(-0.5, -0.5), (w - 0.5, -0.5), (w - 0.5, h - 0.5), (-0.5, h - 0.5)];

    let projection = Projection::from_control_points(src, dst).ok_or(BlockError::DegenerateAnchors)?;
    let mut out = GrayImage::new(width, height);
    warp_into(gray, &projection, Interpolation::Bilinear, OUTSIDE, &mut out);
    Ok(out)
}
