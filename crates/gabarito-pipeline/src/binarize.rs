//! Ink segmentation for fiducial search.
//!
//! Lighting across a photographed sheet is rarely uniform, so a global
//! threshold loses fiducials in shadowed corners. Instead each pixel is
//! compared with the mean of its neighbourhood, computed in constant time
//! from a summed-area table.

use image::{GrayImage, Luma};

use crate::deadline::Deadline;
use crate::types::PipelineError;

/// Ink pixels in the binarized output.
pub const INK: u8 = 255;
/// Background pixels in the binarized output.
pub const PAPER: u8 = 0;

/// Rows processed between deadline polls.
const ROWS_PER_CHECK: u32 = 64;

/// Apply Gaussian blur.
///
/// Non-positive or non-finite sigma returns the image unchanged, since
/// `imageproc` panics on `sigma <= 0.0`.
#[must_use = "returns the blurred image"]
pub fn gaussian_blur(image: &GrayImage, sigma: f32) -> GrayImage {
    if !(sigma > 0.0 && sigma.is_finite()) {
        return image.clone();
    }
    imageproc::filter::gaussian_blur_f32(image, sigma)
}

/// Summed-area table with a zero row and column prepended.
struct Integral {
    stride: usize,
    table: Vec<u64>,
}

impl Integral {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = gray.dimensions();
        let stride = w as usize + 1;
        let mut table = vec![0_u64; stride * (h as usize + 1)];
        for y in 0..h as usize {
            let mut row_sum = 0_u64;
            for x in 0..w as usize {
                #[allow(clippy::cast_possible_truncation)]
                let v = gray.get_pixel(x as u32, y as u32).0[0];
                row_sum += u64::from(v);
                table[(y + 1) * stride + x + 1] = row_sum + table[y * stride + x + 1];
            }
        }
        Self { stride, table }
    }

    /// Sum and pixel count over the half-open rectangle `[x0, x1) x [y0, y1)`.
    fn sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> (u64, u64) {
        let s = self.stride;
        let total = self.table[y1 * s + x1] + self.table[y0 * s + x0]
            - self.table[y0 * s + x1]
            - self.table[y1 * s + x0];
        (total, ((x1 - x0) * (y1 - y0)) as u64)
    }
}

/// Adaptive mean threshold.
///
/// A pixel becomes [`INK`] when it is darker than the mean of the
/// `(2 * radius + 1)` square window around it minus `offset`; everything
/// else becomes [`PAPER`]. Windows are clipped at the image border.
///
/// # Errors
///
/// Returns [`PipelineError::DeadlineExceeded`] if the budget runs out
/// mid-image.
pub fn adaptive_threshold(
    gray: &GrayImage,
    radius: u32,
    offset: u8,
    deadline: &Deadline,
) -> Result<GrayImage, PipelineError> {
    let (w, h) = gray.dimensions();
    let integral = Integral::new(gray);
    let r = radius as usize;
    let mut out = GrayImage::new(w, h);

    for y in 0..h {
        if y % ROWS_PER_CHECK == 0 {
            deadline.check("binarize")?;
        }
        let yu = y as usize;
        let (y0, y1) = (yu.saturating_sub(r), (yu + r + 1).min(h as usize));
        for x in 0..w {
            let xu = x as usize;
            let (x0, x1) = (xu.saturating_sub(r), (xu + r + 1).min(w as usize));
            let (sum, count) = integral.sum(x0, y0, x1, y1);
            let v = u64::from(gray.get_pixel(x, y).0[0]);
            // v < mean - offset, kept in integers: v * count + offset * count < sum
            let is_ink = (v + u64::from(offset)) * count < sum;
            out.put_pixel(x, y, Luma([if is_ink { INK } else { PAPER }]));
        }
    }
    Ok(out)
}

/// Window radius for a fiducial of `fiducial_px` pixels: wide enough that
/// the window around a fiducial's center still sees mostly paper.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn window_radius(fiducial_px: f64) -> u32 {
    let r = (fiducial_px * 1.5).ceil();
    if r.is_finite() { (r as u32).max(7) } else { 7 }
}
