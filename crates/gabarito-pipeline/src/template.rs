//! Sheet layout templates.
//!
//! A [`BubbleTemplate`] describes one sheet family: the abstract sheet
//! size, the ordered alternative labels, the fiducial anchors of each
//! block, and the normalized bubble grid inside each block. Templates are
//! loaded once (TOML or JSON), validated, and then shared read-only
//! between requests through a [`TemplateSet`] snapshot.
//!
//! Sheet coordinates are in arbitrary template units (millimetres or
//! pixels of a reference scan); only their ratios matter. Grid
//! coordinates are normalized to the block's anchor rectangle: `(0, 0)`
//! is the top-left anchor center and `(1, 1)` the bottom-right one.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::geometry;
use crate::types::Point;

/// Answer labels that are reserved for sentinel answers and therefore
/// cannot be used as alternatives (compared case-insensitively).
pub const RESERVED_LABELS: [&str; 3] = ["none", "multiple", "undetermined"];

/// Number of corner anchors per block.
pub const ANCHORS_PER_BLOCK: usize = 4;

/// Errors raised while loading or validating templates.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// The TOML document could not be parsed.
    #[error("failed to parse template TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// The JSON document could not be parsed.
    #[error("failed to parse template JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A template violates a layout rule.
    #[error("invalid template {id:?}: {reason}")]
    Invalid {
        /// Offending template identifier.
        id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Two templates share the same identifier.
    #[error("duplicate template id {0:?}")]
    DuplicateId(String),

    /// The document defines no templates.
    #[error("no templates defined")]
    Empty,
}

/// Abstract sheet size in template units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SheetSize {
    /// Sheet width.
    pub width: f64,
    /// Sheet height.
    pub height: f64,
}

/// Mark classification thresholds. Tunable per template because they
/// depend on the printed bubble style and the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarkThresholds {
    /// Fill score a cell must exceed to count as marked.
    pub marked_threshold: f32,
    /// Minimum gap between the best and second-best fill scores for a
    /// single answer.
    pub separation_margin: f32,
    /// A pixel is dark when darker than the point `dark_ratio` of the way
    /// from the block's ink level to its paper level.
    pub dark_ratio: f32,
    /// Fraction of the cell's inscribed ellipse that is sampled, which
    /// keeps the printed bubble outline out of the score.
    pub inner_ratio: f32,
}

impl MarkThresholds {
    /// Default marked threshold.
    pub const DEFAULT_MARKED_THRESHOLD: f32 = 0.5;
    /// Default separation margin.
    pub const DEFAULT_SEPARATION_MARGIN: f32 = 0.25;
    /// Default dark ratio.
    pub const DEFAULT_DARK_RATIO: f32 = 0.6;
    /// Default inner sampling ratio.
    pub const DEFAULT_INNER_RATIO: f32 = 0.7;
}

impl Default for MarkThresholds {
    fn default() -> Self {
        Self {
            marked_threshold: Self::DEFAULT_MARKED_THRESHOLD,
            separation_margin: Self::DEFAULT_SEPARATION_MARGIN,
            dark_ratio: Self::DEFAULT_DARK_RATIO,
            inner_ratio: Self::DEFAULT_INNER_RATIO,
        }
    }
}

/// Bubble grid of one block, in normalized block coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridSpec {
    /// Center of the first alternative of the first question.
    pub origin: Point,
    /// Offset from one question to the next.
    pub question_step: Point,
    /// Offset from one alternative to the next.
    pub alternative_step: Point,
    /// Cell width and height.
    pub cell_size: Point,
}

impl GridSpec {
    /// Normalized center of the cell for `question` and `alternative`
    /// (both 0-based).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cell_center(&self, question: usize, alternative: usize) -> Point {
        let q = question as f64;
        let a = alternative as f64;
        Point::new(
            a.mul_add(
                self.alternative_step.x,
                q.mul_add(self.question_step.x, self.origin.x),
            ),
            a.mul_add(
                self.alternative_step.y,
                q.mul_add(self.question_step.y, self.origin.y),
            ),
        )
    }
}

/// Layout of one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockLayout {
    /// Number of questions in this block.
    pub questions: usize,
    /// Anchor centers in sheet units: top-left, top-right,
    /// bottom-right, bottom-left.
    pub anchors: [Point; ANCHORS_PER_BLOCK],
    /// Bubble grid.
    pub grid: GridSpec,
}

impl BlockLayout {
    /// Size of the anchor rectangle in sheet units, averaging opposite
    /// edges.
    #[must_use]
    pub fn anchor_extent(&self) -> (f64, f64) {
        let [tl, tr, br, bl] = self.anchors;
        let width = f64::midpoint(tl.distance(tr), bl.distance(br));
        let height = f64::midpoint(tl.distance(bl), tr.distance(br));
        (width, height)
    }
}

/// Immutable layout description of one sheet family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BubbleTemplate {
    /// Unique identifier requests refer to.
    pub id: String,
    /// Sheet size in template units.
    pub sheet: SheetSize,
    /// Alternative labels in grid order.
    pub alternatives: Vec<String>,
    /// Side length of a square fiducial in template units.
    pub fiducial_size: f64,
    /// Rectified pixels per template unit.
    #[serde(default = "default_rectify_scale")]
    pub rectify_scale: f64,
    /// Mark classification thresholds.
    #[serde(default)]
    pub marks: MarkThresholds,
    /// Blocks in reading order. Block `n` is `blocks[n - 1]`.
    pub blocks: Vec<BlockLayout>,
}

const fn default_rectify_scale() -> f64 {
    1.0
}

impl BubbleTemplate {
    /// Number of blocks on the sheet.
    #[must_use]
    pub const fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Size in pixels of the rectified raster for `layout`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn rectified_size(&self, layout: &BlockLayout) -> (u32, u32) {
        let (w, h) = layout.anchor_extent();
        let to_px = |v: f64| (v * self.rectify_scale).round().clamp(1.0, f64::from(u32::MAX)) as u32;
        (to_px(w), to_px(h))
    }

    /// Check every layout rule.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Invalid`] naming the first violated rule.
    pub fn validate(&self) -> Result<(), TemplateError> {
        let invalid = |reason: String| TemplateError::Invalid {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".to_owned()));
        }
        if !(self.sheet.width > 0.0 && self.sheet.height > 0.0) {
            return Err(invalid("sheet size must be positive".to_owned()));
        }
        self.validate_alternatives().map_err(invalid)?;
        if !(self.fiducial_size > 0.0) {
            return Err(invalid("fiducial_size must be positive".to_owned()));
        }
        if !(self.rectify_scale > 0.0 && self.rectify_scale.is_finite()) {
            return Err(invalid("rectify_scale must be positive".to_owned()));
        }
        self.validate_marks().map_err(invalid)?;
        if self.blocks.is_empty() {
            return Err(invalid("at least one block is required".to_owned()));
        }
        for (i, block) in self.blocks.iter().enumerate() {
            self.validate_block(block)
                .map_err(|reason| invalid(format!("block {}: {reason}", i + 1)))?;
        }
        Ok(())
    }

    fn validate_alternatives(&self) -> Result<(), String> {
        if self.alternatives.len() < 2 {
            return Err("at least two alternatives are required".to_owned());
        }
        let mut seen = std::collections::BTreeSet::new();
        for label in &self.alternatives {
            if label.trim().is_empty() {
                return Err("alternative labels must not be empty".to_owned());
            }
            let folded = label.to_lowercase();
            if RESERVED_LABELS.contains(&folded.as_str()) {
                return Err(format!("alternative {label:?} collides with a sentinel answer"));
            }
            if !seen.insert(folded) {
                return Err(format!("alternative {label:?} is repeated"));
            }
        }
        Ok(())
    }

    fn validate_marks(&self) -> Result<(), String> {
        let m = &self.marks;
        if !(m.marked_threshold > 0.0 && m.marked_threshold <= 1.0) {
            return Err("marks.marked_threshold must be in (0, 1]".to_owned());
        }
        if !(m.separation_margin > 0.0 && m.separation_margin <= 1.0) {
            return Err("marks.separation_margin must be in (0, 1]".to_owned());
        }
        if !(m.dark_ratio > 0.0 && m.dark_ratio < 1.0) {
            return Err("marks.dark_ratio must be in (0, 1)".to_owned());
        }
        if !(m.inner_ratio > 0.0 && m.inner_ratio <= 1.0) {
            return Err("marks.inner_ratio must be in (0, 1]".to_owned());
        }
        Ok(())
    }

    fn validate_block(&self, block: &BlockLayout) -> Result<(), String> {
        if block.questions == 0 {
            return Err("questions must be at least 1".to_owned());
        }
        if block.anchors.iter().any(|p| !(p.x.is_finite() && p.y.is_finite())) {
            return Err("anchor coordinates must be finite".to_owned());
        }
        if !geometry::is_convex(&block.anchors) {
            return Err("anchors must form a convex quadrilateral (TL, TR, BR, BL)".to_owned());
        }
        let grid = &block.grid;
        if !(grid.cell_size.x > 0.0 && grid.cell_size.y > 0.0) {
            return Err("grid.cell_size must be positive".to_owned());
        }
        let half = Point::new(grid.cell_size.x / 2.0, grid.cell_size.y / 2.0);
        for q in 0..block.questions {
            for a in 0..self.alternatives.len() {
                let c = grid.cell_center(q, a);
                let inside = |v: f64, h: f64| v - h >= 0.0 && v + h <= 1.0;
                if !(inside(c.x, half.x) && inside(c.y, half.y)) {
                    return Err(format!(
                        "cell for question {} alternative {} lies outside the anchor rectangle",
                        q + 1,
                        self.alternatives[a],
                    ));
                }
            }
        }
        Ok(())
    }
}

/// File layout of a template document: `[[templates]]` entries.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TemplateDocument {
    templates: Vec<BubbleTemplate>,
}

/// A validated, immutable collection of templates keyed by id.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: BTreeMap<String, Arc<BubbleTemplate>>,
}

impl TemplateSet {
    /// Build a set from already-parsed templates, validating each one.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Empty`] for an empty list,
    /// [`TemplateError::DuplicateId`] for repeated ids, or the first
    /// validation failure.
    pub fn from_templates(
        templates: impl IntoIterator<Item = BubbleTemplate>,
    ) -> Result<Self, TemplateError> {
        let mut map = BTreeMap::new();
        for template in templates {
            template.validate()?;
            let id = template.id.clone();
            if map.insert(id.clone(), Arc::new(template)).is_some() {
                return Err(TemplateError::DuplicateId(id));
            }
        }
        if map.is_empty() {
            return Err(TemplateError::Empty);
        }
        Ok(Self { templates: map })
    }

    /// Parse a TOML document of `[[templates]]` tables.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Toml`] on syntax or schema errors, or any
    /// error from [`TemplateSet::from_templates`].
    pub fn from_toml_str(source: &str) -> Result<Self, TemplateError> {
        let doc: TemplateDocument = toml::from_str(source)?;
        Self::from_templates(doc.templates)
    }

    /// Parse a JSON document `{"templates": [...]}`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Json`] on syntax or schema errors, or any
    /// error from [`TemplateSet::from_templates`].
    pub fn from_json_str(source: &str) -> Result<Self, TemplateError> {
        let doc: TemplateDocument = serde_json::from_str(source)?;
        Self::from_templates(doc.templates)
    }

    /// Look up a template by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<BubbleTemplate>> {
        self.templates.get(id)
    }

    /// Template ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// The only template, when exactly one is loaded.
    #[must_use]
    pub fn sole(&self) -> Option<&Arc<BubbleTemplate>> {
        if self.templates.len() == 1 {
            self.templates.values().next()
        } else {
            None
        }
    }

    /// Number of templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Returns `true` when no templates are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Shared handle to the current [`TemplateSet`].
///
/// Readers take a cheap [`Arc`] snapshot and keep using it for the whole
/// request. Reloading builds a new set and swaps it in whole, so a
/// request never observes a half-updated set.
#[derive(Debug, Default)]
pub struct TemplateStore {
    current: RwLock<Arc<TemplateSet>>,
}

impl TemplateStore {
    /// Create a store holding `set`.
    #[must_use]
    pub fn new(set: TemplateSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<TemplateSet> {
        // The lock only guards an Arc swap, so a poisoned lock still
        // holds a complete set.
        let guard = self
            .current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Atomically replace the set. Snapshots taken earlier are unaffected.
    pub fn replace(&self, set: TemplateSet) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Arc::new(set);
    }
}
