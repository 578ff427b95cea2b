//! Shared types for the gabarito decoding pipeline.

use serde::{Deserialize, Serialize};

use crate::quality::QualityReport;
use crate::template::TemplateError;

/// Re-export `GrayImage` so downstream crates can reference
/// rectified block rasters without depending on `image` directly.
pub use image::GrayImage;

/// A 2D point.
///
/// Used both for sheet-space coordinates (template units) and for
/// image-space coordinates (pixels, with pixel `i` covering `[i, i + 1)`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    ///
    /// Avoids the square root for comparison purposes.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Dimensions of a raster image.
    #[must_use]
    pub fn of(image: &GrayImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }

    /// Total pixel count.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// The detected answer for one question.
///
/// No-mark and ambiguous outcomes are distinct variants so consumers
/// cannot conflate "nothing detected" with "nothing marked".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "label", rename_all = "snake_case")]
pub enum Answer {
    /// Exactly one alternative was marked with sufficient separation.
    Marked(String),
    /// No cell reached the marked threshold.
    NoMark,
    /// Two or more cells reached the threshold without enough separation.
    Ambiguous,
}

impl Answer {
    /// Returns `true` for a confidently marked alternative.
    #[must_use]
    pub const fn is_marked(&self) -> bool {
        matches!(self, Self::Marked(_))
    }
}

/// One decoded question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// 1-based question number within its block.
    pub number: usize,
    /// Classified answer.
    pub answer: Answer,
    /// Fill score per alternative in `[0, 1]`, in alternative order.
    ///
    /// Empty when the block could not be rectified.
    pub scores: Vec<f32>,
    /// Mean grey level per alternative cell, in alternative order.
    ///
    /// Empty when the block could not be rectified.
    pub intensities: Vec<f32>,
}

impl Question {
    /// A question with no evidence: answered [`Answer::NoMark`] with
    /// empty audit vectors.
    #[must_use]
    pub const fn undetermined(number: usize) -> Self {
        Self {
            number,
            answer: Answer::NoMark,
            scores: Vec::new(),
            intensities: Vec::new(),
        }
    }
}

/// Block-level failure. Recorded on the [`Block`] instead of aborting the
/// request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockError {
    /// Fewer than four corner anchors were resolved with sufficient
    /// confidence.
    #[error("only {resolved} of {required} corner anchors resolved")]
    AnchorNotFound {
        /// Number of anchors that were resolved.
        resolved: usize,
        /// Number of anchors needed for rectification.
        required: usize,
    },

    /// All four anchors resolved but they do not form a plausible
    /// convex quadrilateral.
    #[error("resolved anchors form a degenerate quadrilateral")]
    DegenerateAnchors,
}

/// One decoded block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// 1-based block number in template reading order.
    pub number: usize,
    /// Whether the answers can be trusted. When `false` the questions
    /// are still listed but are advisory only.
    pub is_valid_img: bool,
    /// Questions in number order.
    pub questions: Vec<Question>,
    /// Image quality measured over the block region, when the block
    /// could be rectified.
    pub quality: Option<QualityReport>,
    /// Why the block could not be read, if it could not.
    pub defect: Option<BlockError>,
}

impl Block {
    /// A block whose anchors could not be resolved: invalid, with every
    /// question undetermined.
    #[must_use]
    pub fn unreadable(number: usize, question_count: usize, defect: BlockError) -> Self {
        Self {
            number,
            is_valid_img: false,
            questions: (1..=question_count).map(Question::undetermined).collect(),
            quality: None,
            defect: Some(defect),
        }
    }
}

/// Request outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Request-level stages succeeded.
    Success,
    /// A request-level failure occurred.
    Error,
}

/// Terminal output of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// Overall status.
    pub status: Status,
    /// Decoded blocks in template order. Empty on error.
    pub blocks: Vec<Block>,
    /// Human-readable error message, present only on error.
    pub message: Option<String>,
}

impl ProcessingResult {
    /// A successful result carrying the given blocks.
    #[must_use]
    pub const fn success(blocks: Vec<Block>) -> Self {
        Self {
            status: Status::Success,
            blocks,
            message: None,
        }
    }

    /// An error result carrying the error's display string.
    #[must_use]
    pub fn failure(error: &PipelineError) -> Self {
        Self {
            status: Status::Error,
            blocks: Vec::new(),
            message: Some(error.to_string()),
        }
    }

    /// Returns `true` when `status` is [`Status::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Errors raised while ingesting image bytes.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The input bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// The input exceeded the configured byte limit.
    #[error("input is {bytes} bytes, exceeding the {max} byte limit")]
    InputTooLarge {
        /// Input length.
        bytes: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The image exceeded the configured maximum width or height.
    #[error("image exceeds the maximum dimension of {max} pixels")]
    ImageTooLarge {
        /// Configured maximum width/height.
        max: u32,
    },

    /// The declared content type is not an image type.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// The bytes are truncated, corrupt, or in an unsupported format.
    #[error("failed to decode image: {0}")]
    Format(#[from] image::ImageError),
}

/// Request-level errors. Any of these turns the whole result into
/// `status = "error"`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The image could not be ingested.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The request referenced a template that is not loaded.
    #[error("unknown template: {id}")]
    UnknownTemplate {
        /// Requested template identifier.
        id: String,
    },

    /// The template failed validation.
    #[error(transparent)]
    InvalidTemplate(#[from] TemplateError),

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// The number of blocks found on the sheet differs from the template.
    #[error("expected {expected} blocks but found {found}")]
    BlockCountMismatch {
        /// Template block count.
        expected: usize,
        /// Blocks found on the sheet.
        found: usize,
    },

    /// The per-request time budget ran out.
    #[error("time budget of {budget_ms} ms exceeded during {stage}")]
    DeadlineExceeded {
        /// Stage that observed the overrun.
        stage: &'static str,
        /// Configured budget.
        budget_ms: u64,
    },

    /// Every block failed anchor resolution and the configured policy
    /// treats that as a request failure.
    #[error("no block on the sheet could be read")]
    UnreadableSheet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_block_lists_every_question_as_no_mark() {
        let block = Block::unreadable(
            2,
            4,
            BlockError::AnchorNotFound {
                resolved: 2,
                required: 4,
            },
        );
        assert!(!block.is_valid_img);
        assert_eq!(block.questions.len(), 4);
        assert!(block.questions.iter().all(|q| q.answer == Answer::NoMark));
        let numbers: Vec<usize> = block.questions.iter().map(|q| q.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn failure_carries_message_and_no_blocks() {
        let result = ProcessingResult::failure(&PipelineError::BlockCountMismatch {
            expected: 2,
            found: 1,
        });
        assert_eq!(result.status, Status::Error);
        assert!(result.blocks.is_empty());
        assert_eq!(
            result.message.as_deref(),
            Some("expected 2 blocks but found 1")
        );
    }

    #[test]
    fn decode_error_message_is_not_wrapped_twice() {
        let err = PipelineError::from(DecodeError::EmptyInput);
        assert_eq!(err.to_string(), "input image data is empty");
    }

    #[test]
    fn answer_serializes_as_tagged_value() {
        let marked = serde_json::to_value(Answer::Marked("c".to_owned())).ok();
        assert_eq!(
            marked,
            Some(serde_json::json!({"kind": "marked", "label": "c"}))
        );
        let none = serde_json::to_value(Answer::NoMark).ok();
        assert_eq!(none, Some(serde_json::json!({"kind": "no_mark"})));
    }

    #[test]
    fn point_distance() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert!((a.distance(b) - 5.0).abs() < 1e-12);
        assert!((a.distance_squared(b) - 25.0).abs() < 1e-12);
    }
}
