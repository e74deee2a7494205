use std::path::Path;

use image::GrayImage;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometry::{approximate_polygon_dp, convex_hull};
use imageproc::point::Point;
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::config::TuningConfig;
use crate::geometry::{max_corner_cosine, polygon_area};
use crate::image_ops::{close_rect, four_point_transform, normalize, truncate_at};

use super::builtins::sigma_for;
use super::{parse_options, Preprocessor, ProcessorError};

const TRUNCATE_LEVEL: u8 = 200;
const CANNY_LOW: f32 = 75.0;
const CANNY_HIGH: f32 = 200.0;
const MIN_PAGE_AREA_RATIO: f32 = 0.05;
const MAX_CANDIDATE_CONTOURS: usize = 5;
const MAX_CORNER_COSINE: f32 = 0.5;

/// Finds the page boundary in a photographed sheet and perspective-crops
/// to it. Falls back to the best imperfect quadrilateral, then to the
/// full image, so this step never fails a sheet on its own.
pub struct CropPage {
    morph_kernel: [u32; 2],
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CropPageOptions {
    #[serde(default = "default_morph_kernel", rename = "morphKernel")]
    morph_kernel: [u32; 2],
}

fn default_morph_kernel() -> [u32; 2] {
    [10, 10]
}

impl CropPage {
    pub fn factory(
        options: &Value,
        _base_dir: &Path,
        _config: &TuningConfig,
    ) -> Result<Box<dyn Preprocessor>, ProcessorError> {
        let options: CropPageOptions = parse_options("CropPage", options)?;
        Ok(Box::new(Self {
            morph_kernel: options.morph_kernel,
        }))
    }

    fn find_page(&self, image: &GrayImage, file_path: &Path) -> [Point<f32>; 4] {
        let truncated = truncate_at(image, TRUNCATE_LEVEL);
        let leveled = normalize(&truncated);
        let closed = close_rect(&leveled, self.morph_kernel[0], self.morph_kernel[1]);
        let edges = canny(&closed, CANNY_LOW, CANNY_HIGH);

        let mut contours: Vec<(Vec<Point<i32>>, f32)> =
            imageproc::contours::find_contours::<i32>(&edges)
                .into_iter()
                .map(|c| {
                    let area = polygon_area(&to_f32_points(&c.points));
                    (c.points, area)
                })
                .collect();
        contours.sort_by(|(_, a), (_, b)| b.partial_cmp(a).expect("contour areas are not NaN"));

        let total_area = (image.width() * image.height()) as f32;
        let min_area = total_area * MIN_PAGE_AREA_RATIO;
        let mut best_fallback: Option<([Point<f32>; 4], f32)> = None;

        for (contour, _) in contours.iter().take(MAX_CANDIDATE_CONTOURS) {
            let hull = convex_hull(contour.as_slice());
            let area = polygon_area(&to_f32_points(&hull));
            if area < min_area {
                continue;
            }

            let perimeter = closed_perimeter(&to_f32_points(&hull));
            let approx = approximate_polygon_dp(&hull, (0.025 * perimeter) as f64, true);
            if approx.len() != 4 {
                continue;
            }
            let approx = to_f32_points(&approx);
            let quad = [approx[0], approx[1], approx[2], approx[3]];

            if max_corner_cosine(&quad) < MAX_CORNER_COSINE {
                info!(
                    "found page boundary in {} covering {:.1}% of the image",
                    file_path.display(),
                    area / total_area * 100.0
                );
                return quad;
            }

            // imperfect rectangle, keep the largest as a fallback
            if best_fallback.as_ref().map_or(true, |(_, a)| area > *a) {
                best_fallback = Some((quad, area));
            }
        }

        if let Some((quad, _)) = best_fallback {
            warn!(
                "strict page boundary failed for {}, using best 4-corner shape",
                file_path.display()
            );
            return quad;
        }

        warn!(
            "no page boundary found in {}, assuming the full image is the page",
            file_path.display()
        );
        let (w, h) = (image.width() as f32, image.height() as f32);
        [
            Point::new(0.0, 0.0),
            Point::new(w - 1.0, 0.0),
            Point::new(w - 1.0, h - 1.0),
            Point::new(0.0, h - 1.0),
        ]
    }
}

fn to_f32_points(points: &[Point<i32>]) -> Vec<Point<f32>> {
    points
        .iter()
        .map(|p| Point::new(p.x as f32, p.y as f32))
        .collect()
}

fn closed_perimeter(points: &[Point<f32>]) -> f32 {
    if points.len() < 2 {
        return 0.0;
    }
    let mut length = 0.0;
    for i in 0..points.len() {
        let p = points[i];
        let q = points[(i + 1) % points.len()];
        length += crate::geometry::distance(p, q);
    }
    length
}

impl Preprocessor for CropPage {
    fn name(&self) -> &'static str {
        "CropPage"
    }

    fn apply_filter(&self, image: &GrayImage, file_path: &Path) -> Option<GrayImage> {
        let blurred = gaussian_blur_f32(image, sigma_for(5, 0.0));
        let normalized = normalize(&blurred);
        let corners = self.find_page(&normalized, file_path);
        four_point_transform(image, &corners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn crops_to_a_bright_page_on_dark_background() {
        let mut img = GrayImage::from_pixel(200, 260, Luma([60]));
        for y in 20..240 {
            for x in 20..180 {
                img.put_pixel(x, y, Luma([250]));
            }
        }

        let step = CropPage::factory(&Value::Null, Path::new("."), &TuningConfig::default())
            .unwrap();
        let out = step.apply_filter(&img, Path::new("sheet.png")).unwrap();

        // output should be close to the page region, much smaller than the input
        assert!(out.width() >= 140 && out.width() <= 185);
        assert!(out.height() >= 200 && out.height() <= 245);
        // and mostly bright page content
        let mean = crate::image_ops::region_mean(&out, 0, 0, out.width(), out.height()).unwrap();
        assert!(mean > 200.0);
    }

    #[test]
    fn featureless_image_falls_back_to_full_frame() {
        let img = GrayImage::from_pixel(64, 48, Luma([128]));
        let step = CropPage::factory(&Value::Null, Path::new("."), &TuningConfig::default())
            .unwrap();
        let out = step.apply_filter(&img, Path::new("flat.png")).unwrap();
        assert_eq!(out.dimensions(), (63, 47));
    }
}
