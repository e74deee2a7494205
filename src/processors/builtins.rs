use std::path::Path;

use image::{GrayImage, Luma};
use imageproc::filter::{gaussian_blur_f32, median_filter};
use serde::Deserialize;
use serde_json::Value;

use crate::config::TuningConfig;

use super::{parse_options, Preprocessor, ProcessorError};

/// Low/high/gamma lookup-table remap, the classic "levels" adjustment.
pub struct Levels {
    lut: [u8; 256],
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LevelsOptions {
    #[serde(default)]
    low: f64,
    #[serde(default = "default_high")]
    high: f64,
    #[serde(default = "default_gamma")]
    gamma: f64,
}

fn default_high() -> f64 {
    1.0
}
fn default_gamma() -> f64 {
    1.0
}

impl Levels {
    pub fn factory(
        options: &Value,
        _base_dir: &Path,
        _config: &TuningConfig,
    ) -> Result<Box<dyn Preprocessor>, ProcessorError> {
        let options: LevelsOptions = parse_options("Levels", options)?;
        let low = (255.0 * options.low).floor();
        let high = (255.0 * options.high).floor();
        let inv_gamma = 1.0 / options.gamma;

        let mut lut = [0u8; 256];
        for (i, entry) in lut.iter_mut().enumerate() {
            let i = i as f64;
            *entry = if i <= low {
                0
            } else if i >= high {
                255
            } else {
                (((i - low) / (high - low)).powf(inv_gamma) * 255.0).clamp(0.0, 255.0) as u8
            };
        }

        Ok(Box::new(Self { lut }))
    }
}

impl Preprocessor for Levels {
    fn name(&self) -> &'static str {
        "Levels"
    }

    fn apply_filter(&self, image: &GrayImage, _file_path: &Path) -> Option<GrayImage> {
        let mut out = image.clone();
        for Luma([v]) in out.pixels_mut() {
            *v = self.lut[*v as usize];
        }
        Some(out)
    }
}

pub struct MedianBlur {
    radius: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MedianBlurOptions {
    #[serde(default = "default_median_k_size", rename = "kSize")]
    k_size: u32,
}

fn default_median_k_size() -> u32 {
    5
}

impl MedianBlur {
    pub fn factory(
        options: &Value,
        _base_dir: &Path,
        _config: &TuningConfig,
    ) -> Result<Box<dyn Preprocessor>, ProcessorError> {
        let options: MedianBlurOptions = parse_options("MedianBlur", options)?;
        Ok(Box::new(Self {
            radius: options.k_size / 2,
        }))
    }
}

impl Preprocessor for MedianBlur {
    fn name(&self) -> &'static str {
        "MedianBlur"
    }

    fn apply_filter(&self, image: &GrayImage, _file_path: &Path) -> Option<GrayImage> {
        Some(median_filter(image, self.radius, self.radius))
    }
}

pub struct GaussianBlur {
    sigma: f32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GaussianBlurOptions {
    #[serde(default = "default_gaussian_k_size", rename = "kSize")]
    k_size: [u32; 2],
    #[serde(default, rename = "sigmaX")]
    sigma_x: f64,
}

fn default_gaussian_k_size() -> [u32; 2] {
    [3, 3]
}

impl GaussianBlur {
    pub fn factory(
        options: &Value,
        _base_dir: &Path,
        _config: &TuningConfig,
    ) -> Result<Box<dyn Preprocessor>, ProcessorError> {
        let options: GaussianBlurOptions = parse_options("GaussianBlur", options)?;
        Ok(Box::new(Self {
            sigma: sigma_for(options.k_size[0], options.sigma_x),
        }))
    }
}

/// Derives a blur sigma from a kernel size when none is given, using the
/// same rule OpenCV applies for sigma 0.
pub(crate) fn sigma_for(k_size: u32, sigma_x: f64) -> f32 {
    if sigma_x > 0.0 {
        return sigma_x as f32;
    }
    let k = k_size.max(1) as f64;
    (0.3 * ((k - 1.0) * 0.5 - 1.0) + 0.8).max(0.1) as f32
}

impl Preprocessor for GaussianBlur {
    fn name(&self) -> &'static str {
        "GaussianBlur"
    }

    fn apply_filter(&self, image: &GrayImage, _file_path: &Path) -> Option<GrayImage> {
        Some(gaussian_blur_f32(image, self.sigma))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient() -> GrayImage {
        GrayImage::from_fn(16, 1, |x, _| Luma([(x * 16) as u8]))
    }

    #[test]
    fn levels_clips_below_low_and_above_high() {
        let step = Levels::factory(
            &serde_json::json!({ "low": 0.25, "high": 0.75 }),
            Path::new("."),
            &TuningConfig::default(),
        )
        .unwrap();
        let out = step.apply_filter(&gradient(), Path::new("x.png")).unwrap();
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
        assert_eq!(out.get_pixel(15, 0).0[0], 255);
    }

    #[test]
    fn identity_levels_keeps_midtones_near_input() {
        let step = Levels::factory(&Value::Null, Path::new("."), &TuningConfig::default()).unwrap();
        let out = step.apply_filter(&gradient(), Path::new("x.png")).unwrap();
        let got = out.get_pixel(8, 0).0[0] as i32;
        assert!((got - 128).abs() <= 2);
    }

    #[test]
    fn gaussian_sigma_follows_kernel_when_unset() {
        assert!((sigma_for(5, 0.0) - 1.1).abs() < 1e-6);
        assert_eq!(sigma_for(3, 2.0), 2.0);
    }
}
