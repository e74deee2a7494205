use std::collections::BTreeMap;

use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use log::info;
use logging_timer::time;

use crate::config::TuningConfig;
use crate::image_ops::{normalize, region_mean, resize_to};
use crate::template::Template;
use crate::threshold::{
    get_global_threshold, get_local_threshold, std_deviation,
};

const OVERLAY_ALPHA: f32 = 0.65;
const MARKED_OUTLINE: Rgb<u8> = Rgb([20, 20, 20]);
const UNMARKED_FILL: Rgb<u8> = Rgb([200, 200, 200]);
const LAYOUT_BLOCK_COLOR: Rgb<u8> = Rgb([60, 60, 255]);
const LAYOUT_BUBBLE_COLOR: Rgb<u8> = Rgb([60, 200, 60]);

/// Everything read off one sheet.
pub struct OmrResult {
    /// Field label -> detected value, one entry per label in the template.
    /// Multiple marks concatenate in row order; no marks yield the empty
    /// value sentinel.
    pub raw_response: BTreeMap<String, String>,
    /// True when any label's row had more than one detected mark.
    pub multi_marked: bool,
    /// Audit overlay, present when requested.
    pub marked_image: Option<RgbImage>,
}

/// Reads every bubble of the template off the sheet. The image is resized
/// to the template's page dimensions first, so bubble coordinates apply
/// directly (plus the per-block alignment shift).
#[time]
pub fn read_omr_response(
    template: &Template,
    image: &GrayImage,
    config: &TuningConfig,
    want_overlay: bool,
) -> OmrResult {
    let [page_w, page_h] = template.page_dimensions;
    let img = normalize(&resize_to(image, page_w, page_h));
    let params = &config.threshold_params;

    // first pass: sample every bubble and collect per-row statistics
    struct RowRead<'a> {
        block_index: usize,
        row: &'a [crate::template::Bubble],
        means: Vec<f64>,
        std: f64,
    }

    let mut rows: Vec<RowRead> = Vec::new();
    let mut all_means: Vec<f64> = Vec::new();
    let mut all_stds: Vec<f64> = Vec::new();

    for (block_index, block) in template.field_blocks.iter().enumerate() {
        let [bubble_w, bubble_h] = block.bubble_dimensions;
        for row in block.rows() {
            let means: Vec<f64> = row
                .iter()
                .map(|bubble| {
                    region_mean(
                        &img,
                        (bubble.x + block.shift) as i64,
                        bubble.y as i64,
                        bubble_w,
                        bubble_h,
                    )
                    // off-image bubbles read as blank paper
                    .unwrap_or(255.0)
                })
                .collect();
            let std = std_deviation(&means);
            all_means.extend_from_slice(&means);
            all_stds.push(std);
            rows.push(RowRead {
                block_index,
                row,
                means,
                std,
            });
        }
    }

    let global_std_threshold = get_global_threshold(&all_stds, params, 1).primary;
    let global_threshold = get_global_threshold(&all_means, params, 4).primary;
    info!(
        "thresholds: global {:.2}, row-spread {:.2}",
        global_threshold, global_std_threshold
    );

    // second pass: per-row local thresholds decide the marks
    let mut canvas = want_overlay.then(|| gray_to_rgb(&img));
    let mut raw_response = BTreeMap::new();
    let mut multi_marked = false;

    for read in &rows {
        let block = &template.field_blocks[read.block_index];
        let no_outliers = read.std < global_std_threshold;
        let local_threshold =
            get_local_threshold(&read.means, global_threshold, no_outliers, params);

        let mut detected: Vec<&str> = Vec::new();
        for (bubble, mean) in read.row.iter().zip(&read.means) {
            let marked = local_threshold > *mean;
            if marked {
                detected.push(&bubble.field_value);
            }
            if let Some(canvas) = canvas.as_mut() {
                let rect = bubble_rect(bubble, block.shift, block.bubble_dimensions);
                if marked {
                    draw_hollow_rect_mut(canvas, rect, MARKED_OUTLINE);
                } else {
                    draw_filled_rect_mut(canvas, rect, UNMARKED_FILL);
                }
            }
        }

        multi_marked |= detected.len() > 1;
        let value = if detected.is_empty() {
            block.empty_value.clone()
        } else {
            detected.concat()
        };
        raw_response.insert(read.row[0].field_label.clone(), value);
    }

    let marked_image = canvas.map(|canvas| blend(&canvas, &gray_to_rgb(&img), OVERLAY_ALPHA));

    OmrResult {
        raw_response,
        multi_marked,
        marked_image,
    }
}

/// Renders the template geometry over the sheet, for layout debugging.
/// `shifted` applies the current per-block alignment shifts.
pub fn draw_template_layout(template: &Template, image: &GrayImage, shifted: bool) -> RgbImage {
    let [page_w, page_h] = template.page_dimensions;
    let img = normalize(&resize_to(image, page_w, page_h));
    let mut canvas = gray_to_rgb(&img);

    for block in &template.field_blocks {
        let shift = if shifted { block.shift } else { 0 };
        let [w, h] = block.dimensions;
        canvas_rect(&mut canvas, block.origin[0].round() as i32 + shift,
            block.origin[1].round() as i32, w, h, LAYOUT_BLOCK_COLOR);
        for row in block.rows() {
            for bubble in row {
                let rect = bubble_rect(bubble, shift, block.bubble_dimensions);
                draw_hollow_rect_mut(&mut canvas, rect, LAYOUT_BUBBLE_COLOR);
            }
        }
    }

    canvas
}

fn canvas_rect(canvas: &mut RgbImage, x: i32, y: i32, w: u32, h: u32, color: Rgb<u8>) {
    draw_hollow_rect_mut(canvas, Rect::at(x, y).of_size(w.max(1), h.max(1)), color);
}

fn bubble_rect(bubble: &crate::template::Bubble, shift: i32, dimensions: [u32; 2]) -> Rect {
    Rect::at(bubble.x + shift, bubble.y).of_size(dimensions[0].max(1), dimensions[1].max(1))
}

fn gray_to_rgb(img: &GrayImage) -> RgbImage {
    let mut out = RgbImage::new(img.width(), img.height());
    for (x, y, pixel) in img.enumerate_pixels() {
        let v = pixel.0[0];
        out.put_pixel(x, y, Rgb([v, v, v]));
    }
    out
}

fn blend(top: &RgbImage, bottom: &RgbImage, alpha: f32) -> RgbImage {
    let mut out = top.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let base = bottom.get_pixel(x, y);
        for c in 0..3 {
            pixel.0[c] =
                (pixel.0[c] as f32 * alpha + base.0[c] as f32 * (1.0 - alpha)).round() as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::ProcessorRegistry;
    use image::Luma;
    use std::io::Write;
    use std::path::Path;

    fn write_template(dir: &Path) -> Template {
        let json = r#"{
            "pageDimensions": [300, 400],
            "fieldBlocks": {
                "Questions": {
                    "origin": [20, 30],
                    "bubblesGap": 40,
                    "labelsGap": 50,
                    "fieldLabels": ["q1..5"],
                    "bubbleValues": ["A", "B", "C", "D"],
                    "direction": "vertical"
                }
            }
        }"#;
        let path = dir.join("template.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(json.as_bytes()).unwrap();
        Template::load(
            &path,
            &ProcessorRegistry::with_builtins(),
            &TuningConfig::default(),
        )
        .unwrap()
    }

    fn fill_bubble(img: &mut GrayImage, label_index: u32, value_index: u32) {
        let x0 = 20 + 50 * label_index;
        let y0 = 30 + 40 * value_index;
        for y in y0..y0 + 32 {
            for x in x0..x0 + 32 {
                img.put_pixel(x, y, Luma([0]));
            }
        }
    }

    #[test]
    fn single_filled_bubble_is_detected_and_others_read_empty() {
        let dir = tempfile::tempdir().unwrap();
        let template = write_template(dir.path());
        let mut sheet = GrayImage::from_pixel(300, 400, Luma([255]));
        fill_bubble(&mut sheet, 2, 1); // q3 -> B

        let result = read_omr_response(&template, &sheet, &TuningConfig::default(), false);
        assert_eq!(result.raw_response.get("q3").map(String::as_str), Some("B"));
        assert_eq!(result.raw_response.get("q1").map(String::as_str), Some(""));
        assert_eq!(result.raw_response.len(), 5);
        assert!(!result.multi_marked);
        assert!(result.marked_image.is_none());
    }

    #[test]
    fn two_marks_in_one_row_concatenate_and_flag_the_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let template = write_template(dir.path());
        let mut sheet = GrayImage::from_pixel(300, 400, Luma([255]));
        fill_bubble(&mut sheet, 2, 1); // q3 -> B
        fill_bubble(&mut sheet, 2, 3); // q3 -> D

        let result = read_omr_response(&template, &sheet, &TuningConfig::default(), false);
        assert_eq!(result.raw_response.get("q3").map(String::as_str), Some("BD"));
        assert!(result.multi_marked);
    }

    #[test]
    fn reading_the_same_sheet_twice_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let template = write_template(dir.path());
        let mut sheet = GrayImage::from_pixel(300, 400, Luma([255]));
        fill_bubble(&mut sheet, 1, 2);
        fill_bubble(&mut sheet, 4, 0);

        let config = TuningConfig::default();
        let first = read_omr_response(&template, &sheet, &config, false);
        let second = read_omr_response(&template, &sheet, &config, false);
        assert_eq!(first.raw_response, second.raw_response);
        assert_eq!(first.multi_marked, second.multi_marked);
    }

    #[test]
    fn overlay_matches_page_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let template = write_template(dir.path());
        let mut sheet = GrayImage::from_pixel(300, 400, Luma([255]));
        fill_bubble(&mut sheet, 0, 0);

        let result = read_omr_response(&template, &sheet, &TuningConfig::default(), true);
        let overlay = result.marked_image.expect("overlay was requested");
        assert_eq!(overlay.dimensions(), (300, 400));
    }

    #[test]
    fn input_is_resized_to_page_dimensions_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let template = write_template(dir.path());
        // double-size sheet, bubbles drawn at double coordinates
        let mut sheet = GrayImage::from_pixel(600, 800, Luma([255]));
        for y in 140..204 {
            for x in 140..204 {
                sheet.put_pixel(x, y, Luma([0]));
            }
        }

        // (140/2, 140/2) = (70, 70) is q2's B bubble at (70, 70)
        let result = read_omr_response(&template, &sheet, &TuningConfig::default(), false);
        assert_eq!(result.raw_response.get("q2").map(String::as_str), Some("B"));
    }

    #[test]
    fn layout_rendering_matches_page_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let template = write_template(dir.path());
        let sheet = GrayImage::from_pixel(120, 160, Luma([255]));
        let layout = draw_template_layout(&template, &sheet, false);
        assert_eq!(layout.dimensions(), (300, 400));
    }
}
