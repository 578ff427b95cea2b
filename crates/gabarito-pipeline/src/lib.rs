//! gabarito-pipeline: Pure optical-mark decoding pipeline (sans-IO).
//!
//! Turns a photographed or scanned answer sheet into per-question answers
//! through:
//! decode -> downsample -> binarize -> fiducial search -> block location
//! -> per-block rectification -> quality assessment -> grid extraction ->
//! mark classification -> result assembly.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! byte slices and returns structured data. Wire formatting lives in
//! `gabarito-export`; file and process handling lives in `gabarito-cli`.

pub mod assemble;
pub mod binarize;
pub mod config;
pub mod deadline;
pub mod diagnostics;
pub mod downsample;
pub mod engine;
pub mod fiducial;
pub mod geometry;
pub mod grid;
pub mod ingest;
pub mod locate;
pub mod marks;
pub mod pipeline;
pub mod quality;
pub mod rectify;
pub mod template;
pub mod types;

#[cfg(test)]
mod fixtures;

use tracing::{info, instrument, warn};

pub use config::{PipelineConfig, QualityConfig, UnreadablePolicy};
pub use diagnostics::{
    Clock, PipelineDiagnostics, inspect_with_diagnostics, process_with_diagnostics,
};
pub use downsample::DownsampleFilter;
pub use engine::{Engine, SheetRequest};
pub use ingest::AnswerSheetImage;
pub use pipeline::{BlocksRead, Decoded, Located, Pending, Pipeline, PipelineStage};
pub use quality::{QualityIssue, QualityReport};
pub use template::{
    BlockLayout, BubbleTemplate, GridSpec, MarkThresholds, RESERVED_LABELS, SheetSize,
    TemplateError, TemplateSet, TemplateStore,
};
pub use types::{
    Answer, Block, BlockError, DecodeError, Dimensions, GrayImage, PipelineError, Point,
    ProcessingResult, Question, Status,
};

/// Decode one answer sheet.
///
/// Takes raw image bytes (PNG, JPEG, BMP, WebP), an optional declared
/// media type, the template the sheet was printed from, and a
/// configuration. Never fails: request-level errors are reported as a
/// [`ProcessingResult`] with [`Status::Error`] and a message, and
/// block-level failures are recorded on the affected [`Block`].
///
/// # Pipeline steps
///
/// 1. Validate configuration and template
/// 2. Decode the image and convert to grayscale
/// 3. Find fiducials on a downsampled, binarized copy
/// 4. Resolve each block's four corner anchors and check the block count
/// 5. Per block, in parallel: rectify, assess quality, extract the
///    bubble grid, and classify marks
/// 6. Assemble the result, applying the unreadable-sheet policy
#[instrument(skip_all, fields(template = %template.id, bytes = bytes.len()))]
pub fn process(
    bytes: &[u8],
    content_type: Option<&str>,
    template: &BubbleTemplate,
    config: &PipelineConfig,
) -> ProcessingResult {
    let result = Pipeline::new(bytes, content_type, template, config)
        .decode()
        .and_then(Decoded::locate)
        .and_then(Located::read_blocks)
        .map_or_else(
            |e| assemble::assemble(Err(e), config.unreadable_policy),
            BlocksRead::into_result,
        );

    match &result.message {
        Some(message) => warn!(%message, "sheet rejected"),
        None => info!(
            blocks = result.blocks.len(),
            valid = result.blocks.iter().filter(|b| b.is_valid_img).count(),
            "sheet decoded"
        ),
    }
    result
}
