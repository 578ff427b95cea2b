//! Bubble grid extraction: template cells to rectified-block pixels.
//!
//! Purely geometric. The rectified block spans the anchor rectangle, so a
//! normalized grid coordinate `(u, v)` is the pixel `(u * width, v * height)`.

use serde::{Deserialize, Serialize};

use crate::template::BlockLayout;
use crate::types::Point;

/// One bubble cell in rectified-block pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellRegion {
    /// Cell center.
    pub center: Point,
    /// Half of the cell's width and height.
    pub half_size: Point,
}

/// The cells of one question, in alternative order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionCells {
    /// 1-based question number.
    pub number: usize,
    /// One cell per alternative.
    pub cells: Vec<CellRegion>,
}

/// Lay out every question of `layout` on a `width` x `height` rectified
/// block.
#[must_use]
pub fn extract(
    layout: &BlockLayout,
    alternatives: usize,
    (width, height): (u32, u32),
) -> Vec<QuestionCells> {
    let (w, h) = (f64::from(width), f64::from(height));
    let half_size = Point::new(
        layout.grid.cell_size.x * w / 2.0,
        layout.grid.cell_size.y * h / 2.0,
    );
    (0..layout.questions)
        .map(|q| QuestionCells {
            number: q + 1,
            cells: (0..alternatives)
                .map(|a| {
                    let c = layout.grid.cell_center(q, a);
                    CellRegion {
                        center: Point::new(c.x * w, c.y * h),
                        half_size,
                    }
                })
                .collect(),
        })
        .collect()
}
