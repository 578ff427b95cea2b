//! Pipeline configuration.
//!
//! Everything that is a property of the capture setup rather than of the
//! sheet layout lives here. Layout-dependent thresholds (mark fill and
//! separation) live on the template instead.

use serde::{Deserialize, Serialize};

use crate::downsample::DownsampleFilter;
use crate::types::PipelineError;

/// What to report when no block on the sheet could be rectified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreadablePolicy {
    /// Keep `status = "success"` with every block invalid.
    #[default]
    Degrade,
    /// Fail the request with [`PipelineError::UnreadableSheet`].
    Fail,
}

/// Per-block image quality floors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Minimum length in pixels of the shorter side of a block region.
    pub min_block_side_px: u32,
    /// Minimum variance of the 3x3 Laplacian response.
    pub min_sharpness: f64,
    /// Minimum RMS contrast (standard deviation of grey levels).
    pub min_contrast: f64,
    /// Minimum spread between the 1st and 99th percentile grey levels.
    pub min_dynamic_range: u8,
    /// The 1st percentile must be at most this dark level (ink present).
    pub max_ink_level: u8,
    /// The 99th percentile must be at least this bright level (paper
    /// visible).
    pub min_paper_level: u8,
}

impl QualityConfig {
    /// Default shorter-side floor.
    pub const DEFAULT_MIN_BLOCK_SIDE_PX: u32 = 48;
    /// Default sharpness floor.
    pub const DEFAULT_MIN_SHARPNESS: f64 = 40.0;
    /// Default contrast floor.
    pub const DEFAULT_MIN_CONTRAST: f64 = 12.0;
    /// Default dynamic-range floor.
    pub const DEFAULT_MIN_DYNAMIC_RANGE: u8 = 60;
    /// Default ink ceiling.
    pub const DEFAULT_MAX_INK_LEVEL: u8 = 160;
    /// Default paper floor.
    pub const DEFAULT_MIN_PAPER_LEVEL: u8 = 90;
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_block_side_px: Self::DEFAULT_MIN_BLOCK_SIDE_PX,
            min_sharpness: Self::DEFAULT_MIN_SHARPNESS,
            min_contrast: Self::DEFAULT_MIN_CONTRAST,
            min_dynamic_range: Self::DEFAULT_MIN_DYNAMIC_RANGE,
            max_ink_level: Self::DEFAULT_MAX_INK_LEVEL,
            min_paper_level: Self::DEFAULT_MIN_PAPER_LEVEL,
        }
    }
}

/// Configuration for the decoding pipeline.
///
/// All parameters have defaults; partial TOML/JSON documents fill the
/// rest from [`PipelineConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum accepted input size in bytes.
    pub max_input_bytes: usize,

    /// Maximum accepted image width or height in pixels.
    pub max_dimension: u32,

    /// Longest side, in pixels, of the raster used for fiducial search.
    /// Larger images are downsampled first; rectification always samples
    /// the full-resolution image.
    pub working_resolution: u32,

    /// Resampling filter used when downsampling for fiducial search.
    pub downsample_filter: DownsampleFilter,

    /// Gaussian blur sigma applied before binarization. Non-positive
    /// disables the blur.
    pub blur_sigma: f32,

    /// Adaptive threshold offset: a pixel is ink when darker than its
    /// local mean minus this value.
    pub threshold_offset: u8,

    /// Anchor search radius as a fraction of the working image's shorter
    /// side.
    pub anchor_search_radius: f64,

    /// Minimum fiducial confidence in `[0, 1]` for a blob to be an anchor
    /// candidate.
    pub min_anchor_confidence: f64,

    /// Resolved anchors needed for a block to count as present on the
    /// sheet. Blocks below this count toward a block-count mismatch.
    pub min_anchors_for_presence: usize,

    /// Minimum ratio of the resolved anchor quad's area to the area
    /// predicted by the template.
    pub min_quad_area_ratio: f64,

    /// Per-block quality floors.
    pub quality: QualityConfig,

    /// What to report when every block fails anchor resolution.
    pub unreadable_policy: UnreadablePolicy,

    /// Wall-clock budget per request in milliseconds.
    pub time_budget_ms: Option<u64>,

    /// Worker pool size. `None` uses the available core count.
    pub worker_threads: Option<usize>,
}

impl PipelineConfig {
    /// Default input size limit (25 MiB).
    pub const DEFAULT_MAX_INPUT_BYTES: usize = 25 * 1024 * 1024;
    /// Default dimension limit.
    pub const DEFAULT_MAX_DIMENSION: u32 = 10_000;
    /// Default working resolution.
    pub const DEFAULT_WORKING_RESOLUTION: u32 = 1600;
    /// Default downsample filter.
    pub const DEFAULT_DOWNSAMPLE_FILTER: DownsampleFilter = DownsampleFilter::Triangle;
    /// Default blur sigma.
    pub const DEFAULT_BLUR_SIGMA: f32 = 1.0;
    /// Default adaptive threshold offset.
    pub const DEFAULT_THRESHOLD_OFFSET: u8 = 10;
    /// Default anchor search radius.
    pub const DEFAULT_ANCHOR_SEARCH_RADIUS: f64 = 0.08;
    /// Default anchor confidence floor.
    pub const DEFAULT_MIN_ANCHOR_CONFIDENCE: f64 = 0.35;
    /// Default presence threshold.
    pub const DEFAULT_MIN_ANCHORS_FOR_PRESENCE: usize = 1;
    /// Default quad area ratio floor.
    pub const DEFAULT_MIN_QUAD_AREA_RATIO: f64 = 0.25;

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] describing the first
    /// out-of-range field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: &str| Err(PipelineError::InvalidConfig(msg.to_owned()));
        if self.max_input_bytes == 0 {
            return invalid("max_input_bytes must be positive");
        }
        if self.max_dimension == 0 {
            return invalid("max_dimension must be positive");
        }
        if self.working_resolution < 64 {
            return invalid("working_resolution must be at least 64");
        }
        if !self.blur_sigma.is_finite() {
            return invalid("blur_sigma must be finite");
        }
        if !(self.anchor_search_radius > 0.0 && self.anchor_search_radius <= 0.5) {
            return invalid("anchor_search_radius must be in (0, 0.5]");
        }
        if !(0.0..=1.0).contains(&self.min_anchor_confidence) {
            return invalid("min_anchor_confidence must be in [0, 1]");
        }
        if !(1..=4).contains(&self.min_anchors_for_presence) {
            return invalid("min_anchors_for_presence must be in 1..=4");
        }
        if !(0.0..=1.0).contains(&self.min_quad_area_ratio) {
            return invalid("min_quad_area_ratio must be in [0, 1]");
        }
        if self.worker_threads == Some(0) {
            return invalid("worker_threads must be positive");
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: Self::DEFAULT_MAX_INPUT_BYTES,
            max_dimension: Self::DEFAULT_MAX_DIMENSION,
            working_resolution: Self::DEFAULT_WORKING_RESOLUTION,
            downsample_filter: Self::DEFAULT_DOWNSAMPLE_FILTER,
            blur_sigma: Self::DEFAULT_BLUR_SIGMA,
            threshold_offset: Self::DEFAULT_THRESHOLD_OFFSET,
            anchor_search_radius: Self::DEFAULT_ANCHOR_SEARCH_RADIUS,
            min_anchor_confidence: Self::DEFAULT_MIN_ANCHOR_CONFIDENCE,
            min_anchors_for_presence: Self::DEFAULT_MIN_ANCHORS_FOR_PRESENCE,
            min_quad_area_ratio: Self::DEFAULT_MIN_QUAD_AREA_RATIO,
            quality: QualityConfig::default(),
            unreadable_policy: UnreadablePolicy::default(),
            time_budget_ms: None,
            worker_threads: None,
        }
    }
}
