use image::GrayImage;
use imageproc::contrast::equalize_histogram;
use log::debug;
use logging_timer::time;

use crate::config::{AlignmentParams, ThresholdParams, TuningConfig};
use crate::image_ops::{
    adjust_gamma, binarize, erode_rect, invert, normalize, open_rect, region_mean, resize_to,
    truncate_at,
};
use crate::template::Template;

/// Strip mean above this counts as a hit on a column rule.
const STRIP_HIT_MEAN: f64 = 100.0;

const PRE_OPEN_TRUNCATE: u8 = 220;
const POST_OPEN_TRUNCATE: u8 = 200;
const BINARIZE_LEVEL: u8 = 60;
const VERTICAL_KERNEL: [u32; 2] = [2, 10];
const OPEN_ITERATIONS: u32 = 3;
const FINAL_ERODE_KERNEL: u32 = 5;
const FINAL_ERODE_ITERATIONS: u32 = 2;

/// Distills the sheet down to its vertical column rules: a binary image
/// where the rules are white and everything else (bubbles, text, noise)
/// is black. The shift search runs against this image.
#[time]
pub fn structural_line_image(image: &GrayImage, params: &ThresholdParams) -> GrayImage {
    let leveled = adjust_gamma(&equalize_histogram(image), params.gamma_low);
    let leveled = normalize(&truncate_at(&leveled, PRE_OPEN_TRUNCATE));

    let opened = open_rect(
        &leveled,
        VERTICAL_KERNEL[0],
        VERTICAL_KERNEL[1],
        OPEN_ITERATIONS,
    );
    let lines = normalize(&truncate_at(&opened, POST_OPEN_TRUNCATE));
    let binary = binarize(&invert(&lines), BINARIZE_LEVEL);

    let mut out = binary;
    for _ in 0..FINAL_ERODE_ITERATIONS {
        out = erode_rect(&out, FINAL_ERODE_KERNEL, FINAL_ERODE_KERNEL);
    }
    out
}

/// Full per-sheet alignment pass. The sheet is brought into page space
/// first so strip coordinates and bubble coordinates agree; the shift
/// search is meaningless at any other resolution. Returns the structural
/// image for diagnostic output.
#[time]
pub fn auto_align(
    template: &mut Template,
    sheet: &GrayImage,
    config: &TuningConfig,
) -> GrayImage {
    template.reset_shifts();
    let [page_w, page_h] = template.page_dimensions;
    let page = resize_to(sheet, page_w, page_h);
    let lines = structural_line_image(&page, &config.threshold_params);
    align_template(template, &lines, &config.alignment_params);
    lines
}

/// Re-anchors every block against the structural line image, writing the
/// found horizontal shift onto the block for the read pass to consume.
#[time]
pub fn align_template(template: &mut Template, lines: &GrayImage, params: &AlignmentParams) {
    for block in &mut template.field_blocks {
        block.shift = find_block_shift(lines, block.origin, block.dimensions, params);
        debug!("block '{}' aligned with shift {}", block.name, block.shift);
    }
}

/// Bounded walk of a block window left or right until both of its edge
/// strips land on a column rule, or neither does. A strip hits when its
/// mean exceeds [`STRIP_HIT_MEAN`]; strips are clipped to the image and a
/// fully out-of-bounds strip is a miss.
pub fn find_block_shift(
    lines: &GrayImage,
    origin: [f64; 2],
    dimensions: [u32; 2],
    params: &AlignmentParams,
) -> i32 {
    let s_x = origin[0].round() as i64;
    let s_y = origin[1].round() as i64;
    let d_x = dimensions[0] as i64;
    let d_y = dimensions[1];
    let thickness = params.thickness as i64;
    let strip_w = params.match_col + params.thickness;

    let mut shift = 0i64;
    for _ in 0..params.max_steps {
        let left_x = s_x + shift - thickness;
        let right_x = s_x + shift + d_x - params.match_col as i64 + thickness;

        let left_hit = strip_mean(lines, left_x, s_y, strip_w, d_y) > STRIP_HIT_MEAN;
        let right_hit = strip_mean(lines, right_x, s_y, strip_w, d_y) > STRIP_HIT_MEAN;

        match (left_hit, right_hit) {
            (true, true) | (false, false) => break,
            (true, false) => shift += params.stride as i64,
            (false, true) => shift -= params.stride as i64,
        }
    }

    shift as i32
}

fn strip_mean(lines: &GrayImage, x: i64, y: i64, width: u32, height: u32) -> f64 {
    region_mean(lines, x, y, width, height).unwrap_or(0.0)
}
