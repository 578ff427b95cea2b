//! Fiducial candidate detection.
//!
//! Ink blobs are labelled with 8-connectivity and scored on two
//! rotation-invariant features:
//!
//! - **size**: blob area against the expected fiducial area;
//! - **compactness**: `area / r_max^2`, where `r_max` is the distance from
//!   the centroid to the farthest pixel. A filled square scores about 2.2
//!   at any rotation; a filled disc (a marked bubble) scores about 3.1;
//!   rings, text strokes and lines score well below 2.
//!
//! Confidence is the product of the two feature scores, so a blob must
//! look right on both counts.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};

use crate::binarize::PAPER;
use crate::types::Point;

/// Compactness of an ideal pixelated filled square.
const SQUARE_COMPACTNESS: f64 = 2.2;

/// Compactness deviation at which the shape score reaches zero.
const COMPACTNESS_TOLERANCE: f64 = 0.8;

/// A blob that may be a fiducial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Centroid in working-image coordinates (pixel `i` spans `[i, i+1)`).
    pub center: Point,
    /// Pixel count.
    pub area: u32,
    /// Combined size and shape score in `[0, 1]`.
    pub confidence: f64,
}

#[derive(Default, Clone, Copy)]
struct BlobAccumulator {
    area: u32,
    sum_x: f64,
    sum_y: f64,
    max_r2: f64,
}

/// Find fiducial candidates in a binarized image.
///
/// `expected_side` is the fiducial side length in working pixels.
/// Candidates below `min_confidence` are discarded. The result is sorted
/// by descending confidence, then by position, so it is deterministic.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn find_candidates(binary: &GrayImage, expected_side: f64, min_confidence: f64) -> Vec<Candidate> {
    let labels = connected_components(binary, Connectivity::Eight, Luma([PAPER]));
    let count = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0) as usize;
    if count == 0 {
        return Vec::new();
    }

    let mut blobs = vec![BlobAccumulator::default(); count + 1];
    for (x, y, label) in labels.enumerate_pixels() {
        let id = label.0[0] as usize;
        if id == 0 {
            continue;
        }
        let blob = &mut blobs[id];
        blob.area += 1;
        blob.sum_x += f64::from(x) + 0.5;
        blob.sum_y += f64::from(y) + 0.5;
    }

    // Second pass: farthest pixel from each centroid.
    for (x, y, label) in labels.enumerate_pixels() {
        let id = label.0[0] as usize;
        if id == 0 {
            continue;
        }
        let blob = &mut blobs[id];
        let n = f64::from(blob.area);
        let dx = f64::from(x) + 0.5 - blob.sum_x / n;
        let dy = f64::from(y) + 0.5 - blob.sum_y / n;
        blob.max_r2 = blob.max_r2.max(dx.mul_add(dx, dy * dy));
    }

    let expected_area = expected_side * expected_side;
    let mut candidates: Vec<Candidate> = blobs
        .iter()
        .skip(1)
        .filter(|b| b.area >= 4)
        .filter_map(|b| {
            let area = f64::from(b.area);
            let confidence = size_score(area, expected_area) * shape_score(area, b.max_r2);
            (confidence >= min_confidence).then(|| Candidate {
                center: Point::new(b.sum_x / area, b.sum_y / area),
                area: b.area,
                confidence,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(a.center.y.total_cmp(&b.center.y))
            .then(a.center.x.total_cmp(&b.center.x))
    });
    candidates
}

/// Ratio of the smaller to the larger of `area` and `expected`.
fn size_score(area: f64, expected: f64) -> f64 {
    if area <= 0.0 || expected <= 0.0 {
        return 0.0;
    }
    area.min(expected) / area.max(expected)
}

/// How square-like the blob's compactness is.
fn shape_score(area: f64, max_r2: f64) -> f64 {
    if max_r2 <= 0.0 {
        return 0.0;
    }
    let compactness = area / max_r2;
    (1.0 - (compactness - SQUARE_COMPACTNESS).abs() / COMPACTNESS_TOLERANCE).clamp(0.0, 1.0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut};
    use imageproc::rect::Rect;

    use super::*;
    use crate::binarize::INK;

    fn canvas() -> GrayImage {
        GrayImage::from_pixel(200, 120, Luma([PAPER]))
    }

    #[test]
    fn empty_image_has_no_candidates() {
        assert!(find_candidates(&canvas(), 20.0, 0.35).is_empty());
    }

    #[test]
    fn square_is_a_candidate_with_exact_centroid() {
        let mut img = canvas();
        draw_filled_rect_mut(&mut img, Rect::at(50, 40).of_size(20, 20), Luma([INK]));
        let found = find_candidates(&img, 20.0, 0.35);
        assert_eq!(found.len(), 1);
        assert!(found[0].center.distance(Point::new(60.0, 50.0)) < 1e-9);
        assert_eq!(found[0].area, 400);
        assert!(found[0].confidence > 0.8, "{}", found[0].confidence);
    }

    #[test]
    fn filled_disc_and_ring_are_rejected() {
        let mut img = canvas();
        draw_filled_circle_mut(&mut img, (40, 60), 10, Luma([INK]));
        draw_hollow_circle_mut(&mut img, (120, 60), 10, Luma([INK]));
        assert!(find_candidates(&img, 20.0, 0.35).is_empty());
    }

    #[test]
    fn thin_line_is_rejected() {
        let mut img = canvas();
        draw_filled_rect_mut(&mut img, Rect::at(10, 10).of_size(150, 3), Luma([INK]));
        assert!(find_candidates(&img, 20.0, 0.35).is_empty());
    }

    #[test]
    fn much_smaller_square_scores_low() {
        let mut img = canvas();
        draw_filled_rect_mut(&mut img, Rect::at(50, 40).of_size(6, 6), Luma([INK]));
        assert!(find_candidates(&img, 20.0, 0.35).is_empty());
    }

    #[test]
    fn rotated_square_is_still_a_candidate() {
        let mut square = GrayImage::from_pixel(80, 80, Luma([PAPER]));
        draw_filled_rect_mut(&mut square, Rect::at(30, 30).of_size(20, 20), Luma([INK]));
        let rotated = imageproc::geometric_transformations::rotate_about_center(
            &square,
            20.0_f32.to_radians(),
            imageproc::geometric_transformations::Interpolation::Nearest,
            Luma([PAPER]),
        );
        let found = find_candidates(&rotated, 20.0, 0.35);
        assert_eq!(found.len(), 1);
        assert!(found[0].center.distance(Point::new(40.0, 40.0)) < 1.5);
    }

    #[test]
    fn output_is_sorted_by_confidence() {
        let mut img = canvas();
        draw_filled_rect_mut(&mut img, Rect::at(20, 20).of_size(14, 14), Luma([INK]));
        draw_filled_rect_mut(&mut img, Rect::at(120, 40).of_size(20, 20), Luma([INK]));
        let found = find_candidates(&img, 20.0, 0.35);
        assert_eq!(found.len(), 2);
        assert!(found[0].confidence >= found[1].confidence);
        assert_eq!(found[0].area, 400);
    }
}
