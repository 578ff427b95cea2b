//! Synthetic answer sheets for tests.
//!
//! The reference layout is a 700x800 pixel sheet with two blocks of five
//! questions (alternatives a-e). Each block is framed by four solid 20 px
//! fiducial squares; bubbles are printed as grey rings of radius 8 on a
//! 40 px column and 60 px row pitch, starting 40/60 px inside the top-left
//! anchor. A mark is a filled disc inside the ring.

use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut};
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};
use imageproc::rect::Rect;

use crate::template::{BlockLayout, BubbleTemplate, GridSpec, MarkThresholds, SheetSize};
use crate::types::{Answer, Point};

pub const TEMPLATE_ID: &str = "two-block-a-e";
pub const SHEET_WIDTH: u32 = 700;
pub const SHEET_HEIGHT: u32 = 800;
pub const FIDUCIAL: i32 = 20;
pub const ALTERNATIVES: [&str; 5] = ["a", "b", "c", "d", "e"];

/// Top-left anchor center of each block, in sheet pixels.
const BLOCK_ORIGINS: [(i32, i32); 2] = [(60, 200), (400, 200)];
const BLOCK_WIDTH: i32 = 240;
const BLOCK_HEIGHT: i32 = 360;
const QUESTIONS: usize = 5;

/// Marked alternative per question, per block. `None` is left blank.
pub const ANSWER_KEY: [[Option<usize>; QUESTIONS]; 2] = [
    [Some(0), Some(2), Some(4), Some(1), Some(3)],
    [Some(1), None, Some(0), Some(3), Some(2)],
];

const PAPER: Luma<u8> = Luma([255]);
const PRINT: Luma<u8> = Luma([0]);
const OUTLINE: Luma<u8> = Luma([80]);
const PENCIL: Luma<u8> = Luma([20]);

pub fn template() -> BubbleTemplate {
    let step = 1.0 / 6.0;
    let grid = GridSpec {
        origin: Point::new(step, step),
        question_step: Point::new(0.0, step),
        alternative_step: Point::new(step, 0.0),
        cell_size: Point::new(16.0 / 240.0, 16.0 / 360.0),
    };
    let blocks = BLOCK_ORIGINS
        .iter()
        .map(|&(x, y)| {
            let (x, y) = (f64::from(x), f64::from(y));
            let (w, h) = (f64::from(BLOCK_WIDTH), f64::from(BLOCK_HEIGHT));
            BlockLayout {
                questions: QUESTIONS,
                anchors: [
                    Point::new(x, y),
                    Point::new(x + w, y),
                    Point::new(x + w, y + h),
                    Point::new(x, y + h),
                ],
                grid,
            }
        })
        .collect();
    BubbleTemplate {
        id: TEMPLATE_ID.to_owned(),
        sheet: SheetSize {
            width: f64::from(SHEET_WIDTH),
            height: f64::from(SHEET_HEIGHT),
        },
        alternatives: ALTERNATIVES.map(str::to_owned).to_vec(),
        fiducial_size: f64::from(FIDUCIAL),
        rectify_scale: 1.0,
        marks: MarkThresholds::default(),
        blocks,
    }
}

/// Expected answers for a sheet rendered from `key`.
pub fn expected_answers(key: &[[Option<usize>; QUESTIONS]]) -> Vec<Vec<Answer>> {
    key.iter()
        .map(|block| {
            block
                .iter()
                .map(|m| m.map_or(Answer::NoMark, |a| Answer::Marked(ALTERNATIVES[a].to_owned())))
                .collect()
        })
        .collect()
}

/// An all-white page with no printing.
pub fn blank_sheet() -> GrayImage {
    GrayImage::from_pixel(SHEET_WIDTH, SHEET_HEIGHT, PAPER)
}

/// Encode as PNG in memory.
pub fn encode_png(image: &GrayImage) -> Vec<u8> {
    let mut buf = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut buf);
    image::ImageEncoder::write_image(
        encoder,
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::L8,
    )
    .ok();
    buf
}

/// Builder for a synthetic sheet.
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    /// (block, question, alternative), all 1-based block, 0-based others.
    marks: Vec<(usize, usize, usize)>,
    /// (block, anchor index) pairs painted over.
    occluded: Vec<(usize, usize)>,
    /// Columns from `x` onward squeezed into `[lo, hi]`.
    washed: Option<(u32, u8, u8)>,
    rotation_deg: f32,
}

impl Sheet {
    /// Printed sheet with no marks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Printed sheet marked according to [`ANSWER_KEY`].
    pub fn answered() -> Self {
        let mut sheet = Self::new();
        for (b, block) in ANSWER_KEY.iter().enumerate() {
            for (q, mark) in block.iter().enumerate() {
                if let Some(a) = mark {
                    sheet = sheet.mark(b + 1, q, *a);
                }
            }
        }
        sheet
    }

    /// Fill the bubble for `question` / `alternative` (0-based) in `block`
    /// (1-based).
    pub fn mark(mut self, block: usize, question: usize, alternative: usize) -> Self {
        self.marks.push((block, question, alternative));
        self
    }

    /// Paint over the given anchors (0 = TL, 1 = TR, 2 = BR, 3 = BL) of
    /// `block` (1-based).
    pub fn occlude_anchors(mut self, block: usize, anchors: &[usize]) -> Self {
        self.occluded.extend(anchors.iter().map(|&a| (block, a)));
        self
    }

    /// Squeeze every grey level from column `from_x` rightwards into
    /// `[lo, hi]`, like a glare band across part of a photo.
    pub fn wash_out(mut self, from_x: u32, lo: u8, hi: u8) -> Self {
        self.washed = Some((from_x, lo, hi));
        self
    }

    /// Rotate the whole page about its center.
    pub fn rotated(mut self, degrees: f32) -> Self {
        self.rotation_deg = degrees;
        self
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn render(&self) -> GrayImage {
        let mut img = blank_sheet();

        for (b, &(ox, oy)) in BLOCK_ORIGINS.iter().enumerate() {
            let corners = [
                (ox, oy),
                (ox + BLOCK_WIDTH, oy),
                (ox + BLOCK_WIDTH, oy + BLOCK_HEIGHT),
                (ox, oy + BLOCK_HEIGHT),
            ];
            for (k, &(cx, cy)) in corners.iter().enumerate() {
                let half = FIDUCIAL / 2;
                draw_filled_rect_mut(
                    &mut img,
                    Rect::at(cx - half, cy - half).of_size(FIDUCIAL as u32, FIDUCIAL as u32),
                    PRINT,
                );
                if self.occluded.contains(&(b + 1, k)) {
                    let pad = FIDUCIAL;
                    draw_filled_rect_mut(
                        &mut img,
                        Rect::at(cx - pad, cy - pad).of_size(2 * pad as u32, 2 * pad as u32),
                        PAPER,
                    );
                }
            }
            for q in 0..QUESTIONS {
                for a in 0..ALTERNATIVES.len() {
                    draw_hollow_circle_mut(&mut img, bubble_center(b, q, a), 8, OUTLINE);
                }
            }
        }

        for &(b, q, a) in &self.marks {
            draw_filled_circle_mut(&mut img, bubble_center(b - 1, q, a), 7, PENCIL);
        }

        if let Some((from_x, lo, hi)) = self.washed {
            let span = u32::from(hi.saturating_sub(lo));
            for (x, _, p) in img.enumerate_pixels_mut() {
                if x >= from_x {
                    let v = u32::from(lo) + (u32::from(p.0[0]) * span + 127) / 255;
                    p.0[0] = v.min(255) as u8;
                }
            }
        }

        if self.rotation_deg == 0.0 {
            img
        } else {
            rotate_about_center(
                &img,
                self.rotation_deg.to_radians(),
                Interpolation::Bilinear,
                PAPER,
            )
        }
    }

    pub fn png(&self) -> Vec<u8> {
        encode_png(&self.render())
    }
}

/// Pixel center of a bubble; `block` is 0-based here.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn bubble_center(block: usize, question: usize, alternative: usize) -> (i32, i32) {
    let (ox, oy) = BLOCK_ORIGINS[block];
    (
        ox + 40 + 40 * alternative as i32,
        oy + 60 + 60 * question as i32,
    )
}
