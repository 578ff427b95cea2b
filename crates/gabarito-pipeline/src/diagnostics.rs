//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! Diagnostics are opt-in instrumentation for threshold tuning and
//! throughput measurement. [`process_with_diagnostics`] runs the staged
//! pipeline and records each stage's duration and metrics alongside the
//! normal [`ProcessingResult`].
//!
//! Time is read through the [`Clock`] trait so callers choose the time
//! source and tests can use a deterministic one.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::pipeline::{BlocksRead, Pipeline, PipelineStage};
use crate::template::BubbleTemplate;
use crate::types::{PipelineError, ProcessingResult, Status};

/// A monotonic time source.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single pipeline run.
///
/// Stages after a request-level failure never run, so their fields are
/// `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Stage 1: validation and image decoding.
    pub decode: Option<StageDiagnostics>,
    /// Stage 2: fiducial search and block location.
    pub locate: Option<StageDiagnostics>,
    /// Stage 3: rectification, quality, and mark detection.
    pub read_blocks: Option<StageDiagnostics>,
    /// Total wall-clock duration of the entire pipeline (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics (counts, sizes, etc.).
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Image decoding metrics.
    Decode {
        /// Size of the input image bytes.
        input_bytes: usize,
        /// Decoded image width in pixels.
        width: u32,
        /// Decoded image height in pixels.
        height: u32,
        /// Total pixel count (`width * height`).
        pixel_count: u64,
        /// Channels in the encoded source (1 gray, 3 RGB, 4 RGBA).
        channels: u8,
        /// Bits per pixel in the encoded source.
        bits_per_pixel: u16,
    },
    /// Block location metrics.
    Locate {
        /// Working image width used for the search.
        working_width: u32,
        /// Working image height used for the search.
        working_height: u32,
        /// Whether the image was downsampled for the search.
        downsampled: bool,
        /// Whether the affine refinement pass was kept.
        refined: bool,
        /// Fiducial candidates found.
        candidates: usize,
        /// Candidates not assigned to a template anchor.
        orphans: usize,
        /// Anchors resolved across all blocks.
        anchors_resolved: usize,
        /// Blocks with all four anchors resolved.
        complete_blocks: usize,
    },
    /// Block reading metrics.
    ReadBlocks {
        /// Blocks read.
        blocks: usize,
        /// Blocks reported with `is_valid_img == true`.
        valid_blocks: usize,
        /// Blocks that could not be rectified.
        unreadable_blocks: usize,
        /// Questions across all blocks.
        questions: usize,
        /// Questions with a single marked alternative.
        marked: usize,
        /// Questions with no mark.
        no_mark: usize,
        /// Questions with an ambiguous mark.
        ambiguous: usize,
    },
}

/// High-level summary for the entire run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Final request status.
    pub status: Status,
    /// Source image width in pixels (0 when decoding failed).
    pub image_width: u32,
    /// Source image height in pixels (0 when decoding failed).
    pub image_height: u32,
    /// Total pixel count.
    pub pixel_count: u64,
    /// Blocks in the result.
    pub block_count: usize,
    /// Blocks reported valid.
    pub valid_block_count: usize,
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} ({} pixels)",
            self.summary.image_width, self.summary.image_height, self.summary.pixel_count,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        let stages = [
            ("Decode", &self.decode),
            ("Locate", &self.locate),
            ("Read Blocks", &self.read_blocks),
        ];
        for (name, diag) in stages {
            let Some(diag) = diag else {
                lines.push(format!("{name:<24} {:>10} {:>10}  not run", "-", "-"));
                continue;
            };
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Status: {:?}  |  Blocks: {} ({} valid)",
            self.summary.status, self.summary.block_count, self.summary.valid_block_count,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Decode {
            input_bytes,
            width,
            height,
            channels,
            bits_per_pixel,
            ..
        } => format!("{input_bytes} bytes -> {width}x{height} ({channels}ch {bits_per_pixel}bpp)"),
        StageMetrics::Locate {
            working_width,
            working_height,
            refined,
            candidates,
            orphans,
            anchors_resolved,
            complete_blocks,
            ..
        } => format!(
            "work={working_width}x{working_height} candidates={candidates} orphans={orphans} anchors={anchors_resolved} complete={complete_blocks}{}",
            if *refined { " refined" } else { "" },
        ),
        StageMetrics::ReadBlocks {
            blocks,
            valid_blocks,
            unreadable_blocks,
            questions,
            marked,
            no_mark,
            ambiguous,
        } => format!(
            "{blocks} blocks ({valid_blocks} valid, {unreadable_blocks} unreadable), {questions} questions: {marked} marked {no_mark} none {ambiguous} ambiguous",
        ),
    }
}

/// Time one stage transition.
fn timed<C: Clock, T>(clock: &C, f: impl FnOnce() -> T) -> (T, Duration) {
    let start = clock.now();
    let value = f();
    (value, clock.elapsed(&start))
}

fn stage<S: PipelineStage>(state: &S, duration: Duration) -> Option<StageDiagnostics> {
    state.metrics().map(|metrics| StageDiagnostics { duration, metrics })
}

/// Stage diagnostics gathered so far.
#[derive(Default)]
struct Collected {
    decode: Option<StageDiagnostics>,
    locate: Option<StageDiagnostics>,
    read_blocks: Option<StageDiagnostics>,
    dimensions: (u32, u32),
}

/// Run the pipeline and collect per-stage diagnostics.
///
/// The returned [`ProcessingResult`] is identical to what
/// [`crate::process`] returns for the same input.
pub fn process_with_diagnostics<C: Clock>(
    bytes: &[u8],
    content_type: Option<&str>,
    template: &BubbleTemplate,
    config: &PipelineConfig,
    clock: &C,
) -> (ProcessingResult, PipelineDiagnostics) {
    inspect_with_diagnostics(bytes, content_type, template, config, clock, |_| {})
}

/// [`process_with_diagnostics`], handing the final [`BlocksRead`] state to
/// `inspect` before the result is assembled. `inspect` is not called when
/// an earlier stage fails.
pub fn inspect_with_diagnostics<C: Clock>(
    bytes: &[u8],
    content_type: Option<&str>,
    template: &BubbleTemplate,
    config: &PipelineConfig,
    clock: &C,
    inspect: impl FnOnce(&BlocksRead),
) -> (ProcessingResult, PipelineDiagnostics) {
    let total_start = clock.now();
    let mut collected = Collected::default();
    let result = run_stages(bytes, content_type, template, config, clock, &mut collected, inspect)
        .unwrap_or_else(|e| ProcessingResult::failure(&e));

    let (image_width, image_height) = collected.dimensions;
    let summary = PipelineSummary {
        status: result.status,
        image_width,
        image_height,
        pixel_count: u64::from(image_width) * u64::from(image_height),
        block_count: result.blocks.len(),
        valid_block_count: result.blocks.iter().filter(|b| b.is_valid_img).count(),
    };
    let diagnostics = PipelineDiagnostics {
        decode: collected.decode,
        locate: collected.locate,
        read_blocks: collected.read_blocks,
        total_duration: clock.elapsed(&total_start),
        summary,
    };
    (result, diagnostics)
}

fn run_stages<C: Clock>(
    bytes: &[u8],
    content_type: Option<&str>,
    template: &BubbleTemplate,
    config: &PipelineConfig,
    clock: &C,
    collected: &mut Collected,
    inspect: impl FnOnce(&BlocksRead),
) -> Result<ProcessingResult, PipelineError> {
    let (decoded, d) = timed(clock, || {
        Pipeline::new(bytes, content_type, template, config).decode()
    });
    let decoded = decoded?;
    collected.dimensions = decoded.image().dimensions();
    collected.decode = stage(&decoded, d);

    let (located, d) = timed(clock, || decoded.locate());
    let located = located?;
    collected.locate = stage(&located, d);

    let (read, d) = timed(clock, || located.read_blocks());
    let read = read?;
    collected.read_blocks = stage(&read, d);

    inspect(&read);
    Ok(read.into_result())
}
