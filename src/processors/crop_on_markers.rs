use std::path::Path;

use image::imageops::crop_imm;
use image::GrayImage;
use imageproc::filter::gaussian_blur_f32;
use imageproc::point::Point;
use imageproc::template_matching::{find_extremes, match_template, MatchTemplateMethod};
use log::{error, info, warn};
use rayon::prelude::*;
use serde::Deserialize;
use serde_json::Value;

use crate::config::TuningConfig;
use crate::geometry::is_plausible_rectangle;
use crate::image_ops::{
    erode_rect, four_point_transform, normalize, resize_to_height, resize_to_width,
};

use super::builtins::sigma_for;
use super::{parse_options, Preprocessor, ProcessorError};

const ERODE_KERNEL: u32 = 5;
const ERODE_ITERATIONS: u32 = 2;
const QUADRANT_HEIGHT_FACTOR: u32 = 3;
const QUADRANT_WIDTH_FACTOR: u32 = 2;
const MIN_MARKER_HEIGHT: u32 = 10;

/// Locates the four printed corner markers by multi-scale template
/// matching and perspective-crops the sheet to their centres. A missing
/// or low-confidence marker fails the sheet (routed to the error ledger).
pub struct CropOnMarkers {
    marker: GrayImage,
    relative_path: String,
    min_matching_threshold: f64,
    max_matching_variation: f64,
    rescale_range: [u32; 2],
    rescale_steps: u32,
    apply_erode_subtract: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CropOnMarkersOptions {
    #[serde(default = "default_relative_path", rename = "relativePath")]
    relative_path: String,
    #[serde(default = "default_min_matching_threshold")]
    min_matching_threshold: f64,
    #[serde(default = "default_max_matching_variation")]
    max_matching_variation: f64,
    #[serde(default = "default_rescale_range")]
    marker_rescale_range: [u32; 2],
    #[serde(default = "default_rescale_steps")]
    marker_rescale_steps: u32,
    #[serde(default = "default_apply_erode_subtract")]
    apply_erode_subtract: bool,
    #[serde(default, rename = "sheetToMarkerWidthRatio")]
    sheet_to_marker_width_ratio: Option<u32>,
}

fn default_relative_path() -> String {
    "omr_marker.jpg".to_string()
}
fn default_min_matching_threshold() -> f64 {
    0.3
}
fn default_max_matching_variation() -> f64 {
    0.41
}
fn default_rescale_range() -> [u32; 2] {
    [35, 100]
}
fn default_rescale_steps() -> u32 {
    10
}
fn default_apply_erode_subtract() -> bool {
    true
}

impl CropOnMarkers {
    pub fn factory(
        options: &Value,
        base_dir: &Path,
        config: &TuningConfig,
    ) -> Result<Box<dyn Preprocessor>, ProcessorError> {
        let options: CropOnMarkersOptions = parse_options("CropOnMarkers", options)?;

        let marker_path = base_dir.join(&options.relative_path);
        let mut marker = image::open(&marker_path)
            .map_err(|error| ProcessorError::MarkerUnreadable {
                path: marker_path.display().to_string(),
                error,
            })?
            .into_luma8();

        if let Some(ratio) = options.sheet_to_marker_width_ratio {
            let target_width = config.dimensions.processing_width / ratio.max(1);
            marker = resize_to_width(&marker, target_width.max(1));
        }
        marker = gaussian_blur_f32(&marker, sigma_for(5, 0.0));
        marker = normalize(&marker);
        if options.apply_erode_subtract {
            marker = subtract(&marker, &erode_iterated(&marker));
        }

        info!(
            "prepared corner marker '{}' ({}x{})",
            options.relative_path,
            marker.width(),
            marker.height()
        );

        Ok(Box::new(Self {
            marker,
            relative_path: options.relative_path,
            min_matching_threshold: options.min_matching_threshold,
            max_matching_variation: options.max_matching_variation,
            rescale_range: options.marker_rescale_range,
            rescale_steps: options.marker_rescale_steps.max(1),
            apply_erode_subtract: options.apply_erode_subtract,
        }))
    }

    /// Bounded search over the configured rescale range for the marker
    /// scale that correlates best with the whole sheet. Each step is an
    /// independent template match, evaluated in parallel.
    fn best_marker_scale(&self, image: &GrayImage) -> (Option<f64>, f64) {
        let [low, high] = self.rescale_range;
        let descent = (high.saturating_sub(low)) as f64 / self.rescale_steps as f64;

        let scales: Vec<f64> = (0..self.rescale_steps)
            .map(|i| (high as f64 - i as f64 * descent) / 100.0)
            .filter(|s| *s > low as f64 / 100.0)
            .collect();

        let best = scales
            .par_iter()
            .filter_map(|&scale| {
                let target_height = (self.marker.height() as f64 * scale).floor() as u32;
                if target_height < MIN_MARKER_HEIGHT || target_height > image.height() {
                    return None;
                }
                let rescaled = resize_to_height(&self.marker, target_height);
                if rescaled.width() > image.width() {
                    return None;
                }
                let result = match_template(
                    image,
                    &rescaled,
                    MatchTemplateMethod::CrossCorrelationNormalized,
                );
                Some((scale, find_extremes(&result).max_value as f64))
            })
            .reduce_with(|a, b| if a.1 >= b.1 { a } else { b });

        match best {
            Some((scale, max_t)) => (Some(scale), max_t),
            None => (None, 0.0),
        }
    }
}

impl Preprocessor for CropOnMarkers {
    fn name(&self) -> &'static str {
        "CropOnMarkers"
    }

    fn exclude_files(&self) -> Vec<String> {
        vec![self.relative_path.clone()]
    }

    fn apply_filter(&self, image: &GrayImage, file_path: &Path) -> Option<GrayImage> {
        let normalized = normalize(image);
        // erode-subtract lands on exactly one side of the match: the
        // marker when the flag is on, the sheet otherwise
        let search_image = if self.apply_erode_subtract {
            normalized
        } else {
            normalize(&subtract(&normalized, &erode_iterated(&normalized)))
        };

        let (width, height) = search_image.dimensions();
        let mid_h = height / QUADRANT_HEIGHT_FACTOR;
        let mid_w = width / QUADRANT_WIDTH_FACTOR;

        let (best_scale, all_max_t) = self.best_marker_scale(&search_image);
        let Some(best_scale) = best_scale else {
            error!(
                "failed to find a marker scale match for {}",
                file_path.display()
            );
            return None;
        };

        let optimal_height = ((self.marker.height() as f64 * best_scale).floor() as u32).max(1);
        let marker = resize_to_height(&self.marker, optimal_height);
        let (marker_w, marker_h) = marker.dimensions();

        let quadrants = [
            (0, 0, mid_w, mid_h),
            (mid_w, 0, width - mid_w, mid_h),
            (0, mid_h, mid_w, height - mid_h),
            (mid_w, mid_h, width - mid_w, height - mid_h),
        ];

        let mut centres = Vec::with_capacity(4);
        let mut quarter_log = String::from("marker matches:");
        for (i, &(qx, qy, qw, qh)) in quadrants.iter().enumerate() {
            if marker_w > qw || marker_h > qh {
                error!(
                    "marker larger than quadrant {} of {}",
                    i + 1,
                    file_path.display()
                );
                return None;
            }
            let quadrant = crop_imm(&search_image, qx, qy, qw, qh).to_image();
            let result = match_template(
                &quadrant,
                &marker,
                MatchTemplateMethod::CrossCorrelationNormalized,
            );
            let extremes = find_extremes(&result);
            let max_t = extremes.max_value as f64;
            quarter_log.push_str(&format!(" Q{}:{:.2}", i + 1, max_t));

            if max_t < self.min_matching_threshold
                || (all_max_t - max_t).abs() >= self.max_matching_variation
            {
                error!(
                    "low marker match {:.2} in quadrant {} of {}",
                    max_t,
                    i + 1,
                    file_path.display()
                );
                return None;
            }

            let (mx, my) = extremes.max_value_location;
            centres.push(Point::new(
                (qx + mx) as f32 + marker_w as f32 / 2.0,
                (qy + my) as f32 + marker_h as f32 / 2.0,
            ));
        }
        info!("{}", quarter_log);

        // quadrant order is TL, TR, BL, BR
        if !is_plausible_rectangle(
            centres[0],
            centres[1],
            centres[2],
            centres[3],
            width as f32,
            height as f32,
        ) {
            warn!(
                "detected markers form an implausible shape for {}, skipping marker crop",
                file_path.display()
            );
            return Some(image.clone());
        }

        four_point_transform(image, &[centres[0], centres[1], centres[2], centres[3]])
    }
}

fn erode_iterated(img: &GrayImage) -> GrayImage {
    let mut out = img.clone();
    for _ in 0..ERODE_ITERATIONS {
        out = erode_rect(&out, ERODE_KERNEL, ERODE_KERNEL);
    }
    out
}

fn subtract(a: &GrayImage, b: &GrayImage) -> GrayImage {
    let mut out = a.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        pixel.0[0] = pixel.0[0].saturating_sub(b.get_pixel(x, y).0[0]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn stamp_square(img: &mut GrayImage, x: u32, y: u32, size: u32, value: u8) {
        for dy in 0..size {
            for dx in 0..size {
                img.put_pixel(x + dx, y + dy, Luma([value]));
            }
        }
    }

    fn marker_on_disk(dir: &Path) -> std::path::PathBuf {
        let mut marker = GrayImage::from_pixel(20, 20, Luma([255]));
        stamp_square(&mut marker, 4, 4, 12, 0);
        let path = dir.join("omr_marker.jpg");
        marker.save(&path).unwrap();
        path
    }

    fn build(dir: &Path, options: Value) -> Box<dyn Preprocessor> {
        CropOnMarkers::factory(&options, dir, &TuningConfig::default()).unwrap()
    }

    #[test]
    fn missing_marker_file_is_a_construction_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = CropOnMarkers::factory(
            &Value::Null,
            dir.path(),
            &TuningConfig::default(),
        );
        assert!(matches!(
            result,
            Err(ProcessorError::MarkerUnreadable { .. })
        ));
    }

    #[test]
    fn marker_file_is_excluded_from_sheet_listing() {
        let dir = tempfile::tempdir().unwrap();
        marker_on_disk(dir.path());
        let step = build(dir.path(), Value::Null);
        assert_eq!(step.exclude_files(), vec!["omr_marker.jpg".to_string()]);
    }

    #[test]
    fn finds_markers_in_all_four_quadrants() {
        let dir = tempfile::tempdir().unwrap();
        marker_on_disk(dir.path());
        let step = build(
            dir.path(),
            serde_json::json!({
                "marker_rescale_range": [90, 100],
                "marker_rescale_steps": 2
            }),
        );

        let mut sheet = GrayImage::from_pixel(300, 400, Luma([255]));
        for (x, y) in [(10u32, 10u32), (270, 10), (10, 370), (270, 370)] {
            stamp_square(&mut sheet, x + 4, y + 4, 12, 0);
        }

        let out = step.apply_filter(&sheet, Path::new("sheet.png"));
        let out = out.expect("markers should be found");
        // crop spans the marker centres: roughly 260x360
        assert!((out.width() as i32 - 260).abs() <= 6);
        assert!((out.height() as i32 - 360).abs() <= 6);
    }

    #[test]
    fn sheet_without_markers_fails_the_sheet() {
        let dir = tempfile::tempdir().unwrap();
        marker_on_disk(dir.path());
        let step = build(
            dir.path(),
            serde_json::json!({ "min_matching_threshold": 0.9 }),
        );
        let sheet = GrayImage::from_pixel(300, 400, Luma([255]));
        assert!(step.apply_filter(&sheet, Path::new("blank.png")).is_none());
    }
}
