use std::path::Path;

use serde::Deserialize;

/// Fully-typed tuning configuration. Every field has a documented default;
/// a partial `config.json` overrides only the fields it names.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TuningConfig {
    #[serde(default)]
    pub dimensions: Dimensions,
    #[serde(default)]
    pub threshold_params: ThresholdParams,
    #[serde(default)]
    pub alignment_params: AlignmentParams,
    #[serde(default)]
    pub outputs: Outputs,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimensions {
    #[serde(default = "default_processing_height")]
    pub processing_height: u32,
    #[serde(default = "default_processing_width")]
    pub processing_width: u32,
}

/// Background shade of the sheet, used to pick the fallback global
/// threshold when no intensity jump is confident enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageType {
    White,
    Black,
}

impl PageType {
    pub const fn default_global_threshold(self) -> f64 {
        match self {
            PageType::White => 200.0,
            PageType::Black => 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdParams {
    #[serde(default = "default_gamma_low", rename = "GAMMA_LOW")]
    pub gamma_low: f64,
    #[serde(default = "default_min_gap", rename = "MIN_GAP")]
    pub min_gap: f64,
    #[serde(default = "default_min_jump", rename = "MIN_JUMP")]
    pub min_jump: f64,
    #[serde(default = "default_confident_surplus", rename = "CONFIDENT_SURPLUS")]
    pub confident_surplus: f64,
    #[serde(default = "default_jump_delta", rename = "JUMP_DELTA")]
    pub jump_delta: f64,
    #[serde(default = "default_page_type", rename = "PAGE_TYPE_FOR_THRESHOLD")]
    pub page_type: PageType,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlignmentParams {
    #[serde(default)]
    pub auto_align: bool,
    #[serde(default = "default_match_col")]
    pub match_col: u32,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_stride")]
    pub stride: i32,
    #[serde(default = "default_thickness")]
    pub thickness: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Outputs {
    /// Staged debug images: 0 saves none, 1 saves the preprocessed sheet,
    /// 2 also saves the alignment line image.
    #[serde(default)]
    pub save_image_level: u8,
    #[serde(default = "default_save_detections")]
    pub save_detections: bool,
    #[serde(default)]
    pub filter_out_multimarked_files: bool,
}

fn default_processing_height() -> u32 {
    820
}
fn default_processing_width() -> u32 {
    666
}
fn default_gamma_low() -> f64 {
    0.7
}
fn default_min_gap() -> f64 {
    30.0
}
fn default_min_jump() -> f64 {
    25.0
}
fn default_confident_surplus() -> f64 {
    5.0
}
fn default_jump_delta() -> f64 {
    30.0
}
fn default_page_type() -> PageType {
    PageType::White
}
fn default_match_col() -> u32 {
    5
}
fn default_max_steps() -> u32 {
    20
}
fn default_stride() -> i32 {
    1
}
fn default_thickness() -> u32 {
    3
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            processing_height: default_processing_height(),
            processing_width: default_processing_width(),
        }
    }
}

impl Default for ThresholdParams {
    fn default() -> Self {
        Self {
            gamma_low: default_gamma_low(),
            min_gap: default_min_gap(),
            min_jump: default_min_jump(),
            confident_surplus: default_confident_surplus(),
            jump_delta: default_jump_delta(),
            page_type: default_page_type(),
        }
    }
}

impl Default for AlignmentParams {
    fn default() -> Self {
        Self {
            auto_align: false,
            match_col: default_match_col(),
            max_steps: default_max_steps(),
            stride: default_stride(),
            thickness: default_thickness(),
        }
    }
}

impl Default for Outputs {
    fn default() -> Self {
        Self {
            save_image_level: 0,
            save_detections: default_save_detections(),
            filter_out_multimarked_files: false,
        }
    }
}

fn default_save_detections() -> bool {
    true
}

impl TuningConfig {
    /// Loads `config.json` from `dir` if present, merging user overrides
    /// over the defaults. A missing file yields the defaults.
    pub fn load_from_dir(dir: &Path) -> Result<Self, String> {
        let path = dir.join("config.json");
        if !path.exists() {
            return Ok(TuningConfig::default());
        }

        let json = std::fs::read_to_string(&path)
            .map_err(|e| format!("error reading {}: {}", path.display(), e))?;
        serde_json::from_str(&json)
            .map_err(|e| format!("error parsing {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TuningConfig::default();
        assert_eq!(config.dimensions.processing_width, 666);
        assert_eq!(config.threshold_params.min_jump, 25.0);
        assert_eq!(config.threshold_params.page_type, PageType::White);
        assert!(!config.alignment_params.auto_align);
        assert_eq!(config.alignment_params.max_steps, 20);
        assert!(config.outputs.save_detections);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let config: TuningConfig = serde_json::from_str(
            r#"{
                "threshold_params": { "MIN_JUMP": 20 },
                "alignment_params": { "auto_align": true }
            }"#,
        )
        .unwrap();
        assert_eq!(config.threshold_params.min_jump, 20.0);
        assert_eq!(config.threshold_params.jump_delta, 30.0);
        assert!(config.alignment_params.auto_align);
        assert_eq!(config.alignment_params.stride, 1);
    }

    #[test]
    fn page_type_picks_fallback_threshold() {
        assert_eq!(PageType::White.default_global_threshold(), 200.0);
        assert_eq!(PageType::Black.default_global_threshold(), 100.0);
    }
}
