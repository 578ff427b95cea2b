//! Block location: match detected fiducials to template anchors.
//!
//! Anchor prediction starts from the assumption that the sheet fills the
//! frame. Candidates are assigned to predicted anchors greedily in order
//! of increasing distance (ties broken by index, so the outcome never
//! depends on iteration order). With three or more matches an affine
//! sheet-to-image map is fitted and matching is repeated with a tighter
//! radius, which absorbs rotation, offset and scale of the sheet in the
//! frame.
//!
//! Blocks are then counted. A template block is present when enough of
//! its anchors were resolved, or when the fitted sheet pose places it
//! inside the frame (its own fiducials may all be hidden). Four leftover
//! fiducials laid out like a template block's anchors count as a block
//! the template does not know about. Any difference from the
//! template's block count is a request-level error, since answer
//! numbering would otherwise be silently wrong.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::binarize;
use crate::config::PipelineConfig;
use crate::deadline::Deadline;
use crate::downsample;
use crate::fiducial::{self, Candidate};
use crate::geometry::{self, Affine};
use crate::template::{ANCHORS_PER_BLOCK, BubbleTemplate};
use crate::types::{Dimensions, PipelineError, Point};

/// A resolved corner anchor in full-resolution image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    /// Fiducial centroid.
    pub center: Point,
    /// Fiducial confidence.
    pub confidence: f64,
}

/// One template block as found on the sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatedBlock {
    /// 1-based block number.
    pub number: usize,
    /// Anchors in template order (TL, TR, BR, BL); `None` when unresolved.
    pub anchors: [Option<Anchor>; ANCHORS_PER_BLOCK],
    /// Area of the anchor quad predicted by the final sheet-to-image
    /// map, in full-resolution pixels.
    pub expected_area: f64,
}

impl LocatedBlock {
    /// Number of resolved anchors.
    #[must_use]
    pub fn resolved_count(&self) -> usize {
        self.anchors.iter().flatten().count()
    }

    /// All four anchor centers, when every anchor resolved.
    #[must_use]
    pub fn corners(&self) -> Option<[Point; ANCHORS_PER_BLOCK]> {
        let [a, b, c, d] = self.anchors;
        Some([a?.center, b?.center, c?.center, d?.center])
    }
}

/// Result of the locate stage.
#[derive(Debug, Clone)]
pub struct LocateOutcome {
    /// Blocks in template order.
    pub blocks: Vec<LocatedBlock>,
    /// Fiducial candidates found in the working image.
    pub candidate_count: usize,
    /// Candidates not assigned to any template anchor.
    pub orphan_count: usize,
    /// Working-image size used for the search.
    pub working: Dimensions,
    /// Whether the working image was downsampled.
    pub downsampled: bool,
    /// Whether an affine refinement pass was applied.
    pub refined: bool,
}

/// Locate every template block on the sheet.
///
/// # Errors
///
/// Returns [`PipelineError::BlockCountMismatch`] when the number of blocks
/// found differs from the template's, and
/// [`PipelineError::DeadlineExceeded`] when the budget runs out.
pub fn locate(
    gray: &image::GrayImage,
    template: &BubbleTemplate,
    config: &PipelineConfig,
    deadline: &Deadline,
) -> Result<LocateOutcome, PipelineError> {
    let working = downsample::downsample(gray, config.working_resolution, config.downsample_filter);
    let (ww, wh) = working.image.dimensions();

    // Initial guess: the sheet fills the frame.
    let initial = Affine::scale(
        f64::from(ww) / template.sheet.width,
        f64::from(wh) / template.sheet.height,
    );
    let expected_side = template.fiducial_size * initial.determinant().abs().sqrt();

    let blurred = binarize::gaussian_blur(&working.image, config.blur_sigma);
    deadline.check("blur")?;
    let binary = binarize::adaptive_threshold(
        &blurred,
        binarize::window_radius(expected_side),
        config.threshold_offset,
        deadline,
    )?;
    let candidates = fiducial::find_candidates(&binary, expected_side, config.min_anchor_confidence);
    deadline.check("fiducial search")?;

    let targets: Vec<Point> = template.blocks.iter().flat_map(|b| b.anchors).collect();
    let radius = config.anchor_search_radius * f64::from(ww.min(wh));

    let first = match_anchors(&targets, &candidates, &initial, radius);
    let mut transform = initial;
    let mut assignment = first;
    let mut refined = false;

    if let Some(fitted) = fit_transform(&targets, &candidates, &assignment) {
        let second = match_anchors(&targets, &candidates, &fitted, radius / 2.0);
        if matched(&second) >= matched(&assignment) {
            assignment = second;
            transform = fitted;
            refined = true;
        }
    }

    // Sheet pose, when enough anchors matched to fit one. It places blocks
    // whose own fiducials are all hidden.
    let pose = fit_transform(&targets, &candidates, &assignment);
    let model = pose.unwrap_or(transform);

    let orphan_count = candidates.len() - matched(&assignment);
    let (to_full_x, to_full_y) = (1.0 / working.scale_x, 1.0 / working.scale_y);
    let full_transform = model.then_scale(to_full_x, to_full_y);

    let blocks: Vec<LocatedBlock> = template
        .blocks
        .iter()
        .enumerate()
        .map(|(i, layout)| {
            let anchors = std::array::from_fn(|k| {
                assignment[i * ANCHORS_PER_BLOCK + k].map(|c| {
                    let cand = &candidates[c];
                    Anchor {
                        center: Point::new(cand.center.x * to_full_x, cand.center.y * to_full_y),
                        confidence: cand.confidence,
                    }
                })
            });
            let predicted = layout.anchors.map(|p| full_transform.apply(p));
            LocatedBlock {
                number: i + 1,
                anchors,
                expected_area: geometry::area(&predicted),
            }
        })
        .collect();

    let in_frame = |p: Point| {
        (0.0..=f64::from(ww)).contains(&p.x) && (0.0..=f64::from(wh)).contains(&p.y)
    };
    let present = template
        .blocks
        .iter()
        .zip(&blocks)
        .filter(|(layout, block)| {
            block.resolved_count() >= config.min_anchors_for_presence
                || pose.is_some_and(|pose| layout.anchors.iter().all(|&p| in_frame(pose.apply(p))))
        })
        .count();
    let unknown = unknown_blocks(template, &candidates, &assignment, &model);
    let found = present + unknown;

    debug!(
        candidates = candidates.len(),
        matched = matched(&assignment),
        orphans = orphan_count,
        present,
        unknown,
        refined,
        "located fiducials"
    );

    if found != template.block_count() {
        return Err(PipelineError::BlockCountMismatch {
            expected: template.block_count(),
            found,
        });
    }

    Ok(LocateOutcome {
        blocks,
        candidate_count: candidates.len(),
        orphan_count,
        working: Dimensions {
            width: ww,
            height: wh,
        },
        downsampled: working.applied,
        refined,
    })
}

fn matched(assignment: &[Option<usize>]) -> usize {
    assignment.iter().flatten().count()
}

/// Greedy unique assignment of candidates to predicted anchor positions.
///
/// Returns, per target, the index of the assigned candidate.
fn match_anchors(
    targets: &[Point],
    candidates: &[Candidate],
    transform: &Affine,
    radius: f64,
) -> Vec<Option<usize>> {
    let radius2 = radius * radius;
    let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
    for (t, target) in targets.iter().enumerate() {
        let predicted = transform.apply(*target);
        for (c, cand) in candidates.iter().enumerate() {
            let d2 = predicted.distance_squared(cand.center);
            if d2 <= radius2 {
                pairs.push((d2, t, c));
            }
        }
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut assignment = vec![None; targets.len()];
    let mut taken = vec![false; candidates.len()];
    for (_, t, c) in pairs {
        if assignment[t].is_none() && !taken[c] {
            assignment[t] = Some(c);
            taken[c] = true;
        }
    }
    assignment
}

/// Count blocks the template does not describe: groups of four unclaimed,
/// fiducial-sized candidates laid out like the anchors of some template
/// block under the sheet pose. Stray squares, logos and bubbles that do
/// not complete such a quad are ignored.
fn unknown_blocks(
    template: &BubbleTemplate,
    candidates: &[Candidate],
    assignment: &[Option<usize>],
    pose: &Affine,
) -> usize {
    let side = template.fiducial_size * pose.determinant().abs().sqrt();
    let expected_area = side * side;
    let tolerance = side * 0.75;

    let mut claimed = vec![false; candidates.len()];
    for &c in assignment.iter().flatten() {
        claimed[c] = true;
    }
    for (c, cand) in candidates.iter().enumerate() {
        let area = f64::from(cand.area);
        if area < expected_area * 0.5 || area > expected_area * 2.0 {
            claimed[c] = true;
        }
    }

    let mut found = 0;
    for first in 0..candidates.len() {
        if claimed[first] {
            continue;
        }
        let group = template
            .blocks
            .iter()
            .find_map(|layout| anchor_quad(&layout.anchors, first, candidates, &claimed, pose, tolerance));
        if let Some(group) = group {
            for c in group {
                claimed[c] = true;
            }
            found += 1;
        }
    }
    found
}

/// Candidates completing the anchor pattern `anchors` with candidate
/// `first` as its top-left corner.
fn anchor_quad(
    anchors: &[Point; ANCHORS_PER_BLOCK],
    first: usize,
    candidates: &[Candidate],
    claimed: &[bool],
    pose: &Affine,
    tolerance: f64,
) -> Option<[usize; ANCHORS_PER_BLOCK]> {
    let origin = pose.apply(anchors[0]);
    let start = candidates[first].center;
    let tolerance2 = tolerance * tolerance;

    let mut group = [first; ANCHORS_PER_BLOCK];
    for (k, &anchor) in anchors.iter().enumerate().skip(1) {
        let offset = pose.apply(anchor);
        let target = Point::new(start.x + offset.x - origin.x, start.y + offset.y - origin.y);
        group[k] = candidates
            .iter()
            .enumerate()
            .filter(|&(c, _)| !claimed[c] && !group[..k].contains(&c))
            .map(|(c, cand)| (cand.center.distance_squared(target), c))
            .filter(|&(d2, _)| d2 <= tolerance2)
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))?
            .1;
    }

    let corners = group.map(|c| candidates[c].center);
    geometry::is_convex(&corners).then_some(group)
}

fn fit_transform(
    targets: &[Point],
    candidates: &[Candidate],
    assignment: &[Option<usize>],
) -> Option<Affine> {
    let (from, to): (Vec<Point>, Vec<Point>) = assignment
        .iter()
        .enumerate()
        .filter_map(|(t, c)| c.map(|c| (targets[t], candidates[c].center)))
        .unzip();
    Affine::fit(&from, &to)
}
