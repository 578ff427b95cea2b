//! Incremental pipeline: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! Unlike [`crate::process`], which runs the entire pipeline in one call
//! and only returns the terminal [`ProcessingResult`], [`Pipeline`] lets
//! the caller drive execution one step at a time:
//!
//! ```rust
//! # use gabarito_pipeline::{BubbleTemplate, Pipeline, PipelineConfig, PipelineError};
//! # fn run(png: &[u8], template: &BubbleTemplate) -> Result<(), PipelineError> {
//! let config = PipelineConfig::default();
//! let read = Pipeline::new(png, Some("image/png"), template, &config)
//!     .decode()?
//!     .locate()?
//!     .read_blocks()?;
//!
//! for (number, raster) in read.rectified() {
//!     println!("block {number}: {}x{}", raster.width(), raster.height());
//! }
//! let result = read.into_result();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next pipeline state.
//! Every stage shares one [`Deadline`] started in [`Pipeline::new`], so
//! the time budget covers the whole request no matter how the caller
//! drives it.
//!
//! # Memory
//!
//! [`BlocksRead`] keeps the rectified raster of every readable block
//! alongside the decoded answers, so audit tooling can dump or inspect
//! them. Callers that only need answers should prefer [`crate::process`].

use image::ColorType;
use rayon::prelude::*;
use tracing::{debug, instrument, warn};

use crate::assemble;
use crate::config::PipelineConfig;
use crate::deadline::Deadline;
use crate::diagnostics::StageMetrics;
use crate::geometry;
use crate::grid;
use crate::locate::{self, LocateOutcome, LocatedBlock};
use crate::marks;
use crate::quality::{self, QualityReport};
use crate::rectify;
use crate::template::{BlockLayout, BubbleTemplate};
use crate::types::{Answer, Block, GrayImage, PipelineError, ProcessingResult};

/// Borrowed request context shared by every stage.
#[derive(Debug, Clone, Copy)]
struct Context<'a> {
    template: &'a BubbleTemplate,
    config: &'a PipelineConfig,
    deadline: Deadline,
}

/// Entry point for the staged pipeline.
pub struct Pipeline;

impl Pipeline {
    /// Start a request. The time budget in `config.time_budget_ms`
    /// starts counting now.
    #[allow(clippy::new_ret_no_self)]
    pub fn new<'a>(
        source: &'a [u8],
        content_type: Option<&'a str>,
        template: &'a BubbleTemplate,
        config: &'a PipelineConfig,
    ) -> Pending<'a> {
        Pending {
            ctx: Context {
                template,
                config,
                deadline: Deadline::start(config.time_budget_ms),
            },
            source,
            content_type,
        }
    }
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
///
/// Call [`decode`](Self::decode) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .decode() to continue"]
pub struct Pending<'a> {
    ctx: Context<'a>,
    source: &'a [u8],
    content_type: Option<&'a str>,
}

impl<'a> Pending<'a> {
    /// The raw source image bytes.
    #[must_use]
    pub const fn source(&self) -> &[u8] {
        self.source
    }

    /// Validate the configuration and template, then decode the source
    /// image to grayscale.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`],
    /// [`PipelineError::InvalidTemplate`], [`PipelineError::Decode`], or
    /// [`PipelineError::DeadlineExceeded`].
    pub fn decode(self) -> Result<Decoded<'a>, PipelineError> {
        self.ctx.config.validate()?;
        self.ctx.template.validate()?;
        let sheet = crate::ingest::decode(self.source, self.content_type, self.ctx.config)?;
        self.ctx.deadline.check("decode")?;
        Ok(Decoded {
            ctx: self.ctx,
            image: sheet.pixels,
            source_color: sheet.source_color,
            source_len: self.source.len(),
        })
    }
}

// ───────────────────────── Stage 1: Decoded ──────────────────────────

/// Pipeline state after decoding the source image.
///
/// Call [`locate`](Self::locate) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .locate() to continue"]
pub struct Decoded<'a> {
    ctx: Context<'a>,
    image: GrayImage,
    source_color: ColorType,
    source_len: usize,
}

impl<'a> Decoded<'a> {
    /// The full-resolution grayscale image.
    #[must_use]
    pub const fn image(&self) -> &GrayImage {
        &self.image
    }

    /// Size of the encoded input in bytes.
    #[must_use]
    pub const fn source_len(&self) -> usize {
        self.source_len
    }

    /// Color type of the encoded source.
    #[must_use]
    pub const fn source_color(&self) -> ColorType {
        self.source_color
    }

    /// Find fiducials and resolve every block's anchors.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BlockCountMismatch`] or
    /// [`PipelineError::DeadlineExceeded`].
    pub fn locate(self) -> Result<Located<'a>, PipelineError> {
        let outcome = locate::locate(
            &self.image,
            self.ctx.template,
            self.ctx.config,
            &self.ctx.deadline,
        )?;
        Ok(Located {
            ctx: self.ctx,
            image: self.image,
            outcome,
        })
    }
}

// ───────────────────────── Stage 2: Located ──────────────────────────

/// Pipeline state after block location.
///
/// Call [`read_blocks`](Self::read_blocks) to advance to the final stage.
#[must_use = "pipeline stages are consumed by advancing — call .read_blocks() to continue"]
pub struct Located<'a> {
    ctx: Context<'a>,
    image: GrayImage,
    outcome: LocateOutcome,
}

impl Located<'_> {
    /// The full-resolution grayscale image.
    #[must_use]
    pub const fn image(&self) -> &GrayImage {
        &self.image
    }

    /// Located blocks and search statistics.
    #[must_use]
    pub const fn outcome(&self) -> &LocateOutcome {
        &self.outcome
    }

    /// Rectify, assess, and decode every block in parallel.
    ///
    /// A block that cannot be rectified is recorded as unreadable rather
    /// than failing the request.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DeadlineExceeded`] when the budget runs
    /// out before a block starts.
    pub fn read_blocks(self) -> Result<BlocksRead, PipelineError> {
        let ctx = self.ctx;
        let image = &self.image;
        let readings = self
            .outcome
            .blocks
            .par_iter()
            .zip(ctx.template.blocks.par_iter())
            .map(|(located, layout)| read_block(image, located, layout, &ctx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BlocksRead {
            readings,
            config: ctx.config.clone(),
        })
    }
}

// ───────────────────────── Stage 3: BlocksRead ───────────────────────

/// One decoded block together with its rectified raster.
#[derive(Debug, Clone)]
pub struct BlockReading {
    /// Decoded block.
    pub block: Block,
    /// Rectified raster, `None` when the block could not be rectified.
    pub rectified: Option<GrayImage>,
}

/// Final pipeline state: every block decoded.
#[must_use = "call .into_result() to obtain the processing result"]
pub struct BlocksRead {
    readings: Vec<BlockReading>,
    config: PipelineConfig,
}

impl BlocksRead {
    /// Decoded blocks in template order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.readings.iter().map(|r| &r.block)
    }

    /// Rectified rasters of readable blocks, with their block numbers.
    pub fn rectified(&self) -> impl Iterator<Item = (usize, &GrayImage)> {
        self.readings
            .iter()
            .filter_map(|r| r.rectified.as_ref().map(|img| (r.block.number, img)))
    }

    /// Per-block readings, including rasters.
    #[must_use]
    pub fn readings(&self) -> &[BlockReading] {
        &self.readings
    }

    /// Drop the rasters and keep only the decoded blocks.
    #[must_use]
    pub fn into_blocks(self) -> Vec<Block> {
        self.readings.into_iter().map(|r| r.block).collect()
    }

    /// Assemble the terminal result, applying the configured
    /// unreadable-sheet policy.
    #[must_use]
    pub fn into_result(self) -> ProcessingResult {
        let policy = self.config.unreadable_policy;
        assemble::assemble(Ok(self.into_blocks()), policy)
    }
}

#[instrument(level = "debug", skip_all, fields(block = located.number))]
fn read_block(
    gray: &GrayImage,
    located: &LocatedBlock,
    layout: &BlockLayout,
    ctx: &Context<'_>,
) -> Result<BlockReading, PipelineError> {
    ctx.deadline.check("read blocks")?;
    let template = ctx.template;
    let size = template.rectified_size(layout);

    let rectified = match rectify::rectify(gray, located, size, ctx.config) {
        Ok(raster) => raster,
        Err(defect) => {
            warn!(%defect, "block unreadable");
            return Ok(BlockReading {
                block: Block::unreadable(located.number, layout.questions, defect),
                rectified: None,
            });
        }
    };

    let quality = located.corners().map(|corners| {
        quality::assess_region(
            gray,
            &corners,
            anchor_margin(template, layout, located),
            &ctx.config.quality,
        )
    });
    let is_valid_img = quality.as_ref().is_some_and(QualityReport::is_acceptable);
    if let Some(report) = quality.as_ref().filter(|r| !r.is_acceptable()) {
        debug!(issues = ?report.issues, "block quality below floor");
    }

    let cells = grid::extract(layout, template.alternatives.len(), size);
    let questions = marks::detect(&rectified, &cells, &template.alternatives, &template.marks);

    Ok(BlockReading {
        block: Block {
            number: located.number,
            is_valid_img,
            questions,
            quality,
            defect: None,
        },
        rectified: Some(rectified),
    })
}

// ───────────────────────── Stage introspection ──────────────────────

/// Common introspection over pipeline states.
pub trait PipelineStage {
    /// Human-readable name of the stage that produced this state.
    const NAME: &'static str;

    /// Metrics describing the work done to reach this state. `None` for
    /// [`Pending`], which has not processed anything yet.
    fn metrics(&self) -> Option<StageMetrics>;
}

impl PipelineStage for Pending<'_> {
    const NAME: &'static str = "source";

    fn metrics(&self) -> Option<StageMetrics> {
        None
    }
}

impl PipelineStage for Decoded<'_> {
    const NAME: &'static str = "decode";

    fn metrics(&self) -> Option<StageMetrics> {
        let (width, height) = self.image.dimensions();
        Some(StageMetrics::Decode {
            input_bytes: self.source_len,
            width,
            height,
            pixel_count: u64::from(width) * u64::from(height),
            channels: self.source_color.channel_count(),
            bits_per_pixel: self.source_color.bits_per_pixel(),
        })
    }
}

impl PipelineStage for Located<'_> {
    const NAME: &'static str = "locate";

    fn metrics(&self) -> Option<StageMetrics> {
        let o = &self.outcome;
        Some(StageMetrics::Locate {
            working_width: o.working.width,
            working_height: o.working.height,
            downsampled: o.downsampled,
            refined: o.refined,
            candidates: o.candidate_count,
            orphans: o.orphan_count,
            anchors_resolved: o.blocks.iter().map(LocatedBlock::resolved_count).sum(),
            complete_blocks: o.blocks.iter().filter(|b| b.corners().is_some()).count(),
        })
    }
}

impl PipelineStage for BlocksRead {
    const NAME: &'static str = "read blocks";

    fn metrics(&self) -> Option<StageMetrics> {
        let blocks = || self.readings.iter().map(|r| &r.block);
        let answers = || blocks().flat_map(|b| b.questions.iter().map(|q| &q.answer));
        Some(StageMetrics::ReadBlocks {
            blocks: self.readings.len(),
            valid_blocks: blocks().filter(|b| b.is_valid_img).count(),
            unreadable_blocks: blocks().filter(|b| b.defect.is_some()).count(),
            questions: answers().count(),
            marked: answers().filter(|a| a.is_marked()).count(),
            no_mark: answers().filter(|a| **a == Answer::NoMark).count(),
            ambiguous: answers().filter(|a| **a == Answer::Ambiguous).count(),
        })
    }
}

/// Half a fiducial side in image pixels, so the assessed region covers
/// the anchors themselves.
fn anchor_margin(template: &BubbleTemplate, layout: &BlockLayout, located: &LocatedBlock) -> f64 {
    let template_area = geometry::area(&layout.anchors);
    let scale = if template_area > 0.0 && located.expected_area > 0.0 {
        (located.expected_area / template_area).sqrt()
    } else {
        1.0
    };
    template.fiducial_size * scale / 2.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Sheet};

    #[test]
    fn stages_expose_intermediates() {
        let template = fixtures::template();
        let config = PipelineConfig::default();
        let png = Sheet::answered().png();

        let decoded = Pipeline::new(&png, Some("image/png"), &template, &config)
            .decode()
            .unwrap();
        assert_eq!(decoded.source_len(), png.len());
        assert_eq!(
            decoded.image().dimensions(),
            (fixtures::SHEET_WIDTH, fixtures::SHEET_HEIGHT)
        );

        let located = decoded.locate().unwrap();
        assert_eq!(located.outcome().blocks.len(), 2);
        assert!(located.outcome().blocks.iter().all(|b| b.resolved_count() == 4));

        let read = located.read_blocks().unwrap();
        let rasters: Vec<(usize, (u32, u32))> = read
            .rectified()
            .map(|(n, img)| (n, img.dimensions()))
            .collect();
        assert_eq!(rasters, vec![(1, (240, 360)), (2, (240, 360))]);
        assert!(read.blocks().all(|b| b.is_valid_img));

        let metrics = read.metrics();
        assert!(
            matches!(
                metrics,
                Some(StageMetrics::ReadBlocks {
                    blocks: 2,
                    valid_blocks: 2,
                    unreadable_blocks: 0,
                    questions: 10,
                    marked: 9,
                    no_mark: 1,
                    ambiguous: 0,
                })
            ),
            "{metrics:?}"
        );
    }

    #[test]
    fn unreadable_block_has_no_raster() {
        let template = fixtures::template();
        let config = PipelineConfig::default();
        let png = Sheet::answered().occlude_anchors(2, &[1, 2]).png();

        let read = Pipeline::new(&png, None, &template, &config)
            .decode()
            .and_then(Decoded::locate)
            .and_then(Located::read_blocks)
            .unwrap();
        let numbers: Vec<usize> = read.rectified().map(|(n, _)| n).collect();
        assert_eq!(numbers, vec![1]);

        let second = &read.readings()[1];
        assert!(second.rectified.is_none());
        assert!(second.block.quality.is_none());
        assert!(second.block.questions.iter().all(|q| q.answer == Answer::NoMark));
    }

    #[test]
    fn stage_names_are_static() {
        fn name<S: PipelineStage>() -> &'static str {
            S::NAME
        }
        assert_eq!(name::<Pending<'_>>(), "source");
        assert_eq!(name::<Decoded<'_>>(), "decode");
        assert_eq!(name::<Located<'_>>(), "locate");
        assert_eq!(name::<BlocksRead>(), "read blocks");
    }

    #[test]
    fn invalid_config_fails_before_decoding() {
        let template = fixtures::template();
        let config = PipelineConfig {
            working_resolution: 0,
            ..PipelineConfig::default()
        };
        let err = Pipeline::new(&[], None, &template, &config).decode().err();
        assert!(matches!(err, Some(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn margin_scales_with_located_area() {
        let template = fixtures::template();
        let layout = &template.blocks[0];
        let located = LocatedBlock {
            number: 1,
            anchors: [None; 4],
            expected_area: geometry::area(&layout.anchors) * 4.0,
        };
        let margin = anchor_margin(&template, layout, &located);
        assert!((margin - template.fiducial_size).abs() < 1e-9);
    }
}
