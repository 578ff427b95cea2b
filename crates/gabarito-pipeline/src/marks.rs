//! Mark detection: fill scores per cell and three-way classification.
//!
//! Ink and paper levels are estimated per block (1st and 90th percentile
//! of the rectified raster) so uneven lighting between blocks, or a
//! washed-out block, does not shift the scores. A cell's fill score is the
//! fraction of pixels inside its inscribed ellipse, shrunk by
//! `inner_ratio` to stay clear of the printed outline, that are darker
//! than the point `dark_ratio` of the way from ink to paper.

use image::GrayImage;

use crate::grid::{CellRegion, QuestionCells};
use crate::quality::percentile;
use crate::template::MarkThresholds;
use crate::types::{Answer, Question};

/// Below this ink-to-paper spread a block has no usable contrast.
const MIN_INK_CONTRAST: u8 = 16;

/// Measured fill of one cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellMeasure {
    /// Dark-pixel fraction in `[0, 1]`.
    pub score: f32,
    /// Mean grey level of the sampled pixels.
    pub intensity: f32,
}

/// Grey levels of printed ink and blank paper in one rectified block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InkLevels {
    /// Darkest common level (1st percentile).
    pub ink: u8,
    /// Unmarked paper level (90th percentile).
    pub paper: u8,
}

impl InkLevels {
    /// Grey level below which a pixel counts as filled.
    ///
    /// Without usable contrast the cut drops to the ink level, so almost
    /// nothing is dark.
    #[must_use]
    pub fn dark_below(self, dark_ratio: f32) -> f32 {
        let ink = f32::from(self.ink);
        if self.paper.saturating_sub(self.ink) < MIN_INK_CONTRAST {
            return ink;
        }
        (f32::from(self.paper) - ink).mul_add(dark_ratio, ink)
    }
}

/// Estimate the ink and paper levels of a rectified block.
#[must_use]
pub fn ink_levels(block: &GrayImage) -> InkLevels {
    let mut histogram = [0_u64; 256];
    for p in block.pixels() {
        histogram[usize::from(p.0[0])] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return InkLevels {
            ink: 0,
            paper: u8::MAX,
        };
    }
    InkLevels {
        ink: percentile(&histogram, total, 1),
        paper: percentile(&histogram, total, 90),
    }
}

/// Measure one cell.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn measure_cell(
    block: &GrayImage,
    cell: &CellRegion,
    levels: InkLevels,
    thresholds: &MarkThresholds,
) -> CellMeasure {
    let (w, h) = block.dimensions();
    let rx = cell.half_size.x * f64::from(thresholds.inner_ratio);
    let ry = cell.half_size.y * f64::from(thresholds.inner_ratio);
    let dark_below = levels.dark_below(thresholds.dark_ratio);

    let span = |c: f64, r: f64, max: u32| {
        let lo = (c - r).floor().clamp(0.0, f64::from(max)) as u32;
        let hi = (c + r).ceil().clamp(0.0, f64::from(max)) as u32;
        lo..hi
    };

    let (mut sampled, mut dark, mut sum) = (0_u32, 0_u32, 0_u64);
    if rx > 0.0 && ry > 0.0 {
        for y in span(cell.center.y, ry, h) {
            let dy = (f64::from(y) + 0.5 - cell.center.y) / ry;
            for x in span(cell.center.x, rx, w) {
                let dx = (f64::from(x) + 0.5 - cell.center.x) / rx;
                if dx.mul_add(dx, dy * dy) > 1.0 {
                    continue;
                }
                let v = block.get_pixel(x, y).0[0];
                sampled += 1;
                sum += u64::from(v);
                if f32::from(v) < dark_below {
                    dark += 1;
                }
            }
        }
    }

    if sampled == 0 {
        return CellMeasure {
            score: 0.0,
            intensity: f32::from(levels.paper),
        };
    }
    CellMeasure {
        score: dark as f32 / sampled as f32,
        intensity: (sum as f64 / f64::from(sampled)) as f32,
    }
}

/// Classify one question from its per-alternative fill scores.
///
/// - best score at or below `marked_threshold`: [`Answer::NoMark`];
/// - best score beats the runner-up by at least `separation_margin`:
///   [`Answer::Marked`] with that alternative's label;
/// - otherwise [`Answer::Ambiguous`].
///
/// Position never breaks a tie.
#[must_use]
pub fn classify(scores: &[f32], alternatives: &[String], thresholds: &MarkThresholds) -> Answer {
    let mut best: Option<(usize, f32)> = None;
    let mut runner_up = 0.0_f32;
    for (i, &s) in scores.iter().enumerate() {
        match best {
            Some((_, b)) if s <= b => runner_up = runner_up.max(s),
            Some((_, b)) => {
                runner_up = b;
                best = Some((i, s));
            }
            None => best = Some((i, s)),
        }
    }

    let Some((index, top)) = best else {
        return Answer::NoMark;
    };
    if top <= thresholds.marked_threshold {
        return Answer::NoMark;
    }
    let gap = top - runner_up;
    if gap > 0.0 && gap >= thresholds.separation_margin {
        alternatives
            .get(index)
            .map_or(Answer::Ambiguous, |label| Answer::Marked(label.clone()))
    } else {
        Answer::Ambiguous
    }
}

/// Measure and classify every question of a rectified block.
#[must_use]
pub fn detect(
    block: &GrayImage,
    questions: &[QuestionCells],
    alternatives: &[String],
    thresholds: &MarkThresholds,
) -> Vec<Question> {
    let levels = ink_levels(block);
    questions
        .iter()
        .map(|q| {
            let measures: Vec<CellMeasure> = q
                .cells
                .iter()
                .map(|cell| measure_cell(block, cell, levels, thresholds))
                .collect();
            let scores: Vec<f32> = measures.iter().map(|m| m.score).collect();
            Question {
                number: q.number,
                answer: classify(&scores, alternatives, thresholds),
                scores,
                intensities: measures.iter().map(|m| m.intensity).collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use image::Luma;
    use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut};

    use super::*;
    use crate::types::Point;

    fn labels() -> Vec<String> {
        ["a", "b", "c", "d"].map(str::to_owned).to_vec()
    }

    fn thresholds() -> MarkThresholds {
        MarkThresholds::default()
    }

    #[test]
    fn single_clear_mark_is_marked() {
        let answer = classify(&[0.05, 0.92, 0.1, 0.0], &labels(), &thresholds());
        assert_eq!(answer, Answer::Marked("b".to_owned()));
    }

    #[test]
    fn nothing_above_threshold_is_no_mark() {
        let answer = classify(&[0.1, 0.3, 0.49, 0.0], &labels(), &thresholds());
        assert_eq!(answer, Answer::NoMark);
    }

    #[test]
    fn score_at_threshold_is_no_mark() {
        let answer = classify(&[0.5, 0.0, 0.0, 0.0], &labels(), &thresholds());
        assert_eq!(answer, Answer::NoMark);
    }

    #[test]
    fn two_strong_marks_are_ambiguous() {
        let answer = classify(&[0.9, 0.0, 0.85, 0.0], &labels(), &thresholds());
        assert_eq!(answer, Answer::Ambiguous);
    }

    #[test]
    fn exact_tie_is_ambiguous_not_first() {
        let answer = classify(&[0.8, 0.8, 0.0, 0.0], &labels(), &thresholds());
        assert_eq!(answer, Answer::Ambiguous);
    }

    #[test]
    fn insufficient_separation_is_ambiguous_even_below_threshold_runner_up() {
        // Runner-up is below the marked threshold but within the margin.
        let answer = classify(&[0.6, 0.4, 0.0, 0.0], &labels(), &thresholds());
        assert_eq!(answer, Answer::Ambiguous);
    }

    #[test]
    fn separation_at_margin_is_marked() {
        let answer = classify(&[0.0, 0.0, 0.75, 0.5], &labels(), &thresholds());
        assert_eq!(answer, Answer::Marked("c".to_owned()));
    }

    #[test]
    fn filled_bubble_scores_high_and_outline_scores_low() {
        let mut block = GrayImage::from_pixel(80, 40, Luma([250]));
        draw_hollow_circle_mut(&mut block, (20, 20), 8, Luma([90]));
        draw_hollow_circle_mut(&mut block, (60, 20), 8, Luma([90]));
        draw_filled_circle_mut(&mut block, (60, 20), 7, Luma([30]));

        let half = Point::new(8.0, 8.0);
        let empty = CellRegion {
            center: Point::new(20.5, 20.5),
            half_size: half,
        };
        let filled = CellRegion {
            center: Point::new(60.5, 20.5),
            half_size: half,
        };
        let levels = ink_levels(&block);
        assert_eq!(levels, InkLevels { ink: 30, paper: 250 });
        let e = measure_cell(&block, &empty, levels, &thresholds());
        let f = measure_cell(&block, &filled, levels, &thresholds());
        assert!(e.score < 0.01, "{e:?}");
        assert!(f.score > 0.95, "{f:?}");
        assert!(f.intensity < e.intensity);
    }

    #[test]
    fn faint_block_is_measured_against_its_own_ink() {
        let mut block = GrayImage::from_pixel(80, 40, Luma([201]));
        draw_hollow_circle_mut(&mut block, (20, 20), 8, Luma([180]));
        draw_hollow_circle_mut(&mut block, (60, 20), 8, Luma([180]));
        draw_filled_circle_mut(&mut block, (60, 20), 7, Luma([172]));

        let levels = ink_levels(&block);
        assert_eq!(levels, InkLevels { ink: 172, paper: 201 });
        let half = Point::new(8.0, 8.0);
        let cell = |x: f64| CellRegion {
            center: Point::new(x, 20.5),
            half_size: half,
        };
        let e = measure_cell(&block, &cell(20.5), levels, &thresholds());
        let f = measure_cell(&block, &cell(60.5), levels, &thresholds());
        assert!(e.score < 0.01, "{e:?}");
        assert!(f.score > 0.95, "{f:?}");
    }

    #[test]
    fn flat_block_has_nothing_dark() {
        let levels = InkLevels { ink: 200, paper: 205 };
        assert!((levels.dark_below(0.6) - 200.0).abs() < f32::EPSILON);
    }

    #[test]
    fn cell_outside_raster_samples_nothing() {
        let block = GrayImage::from_pixel(10, 10, Luma([255]));
        let cell = CellRegion {
            center: Point::new(50.0, 50.0),
            half_size: Point::new(4.0, 4.0),
        };
        let levels = InkLevels { ink: 0, paper: 255 };
        let m = measure_cell(&block, &cell, levels, &thresholds());
        assert!(m.score.abs() < f32::EPSILON);
        assert!((m.intensity - 255.0).abs() < f32::EPSILON);
    }
}
