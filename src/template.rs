use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::path::Path;

use serde::Deserialize;

use crate::config::TuningConfig;
use crate::fields::{output_column_sort_key, parse_fields, FieldParseError};
use crate::processors::{Preprocessor, ProcessorError, ProcessorRegistry};

/// Axis along which a block's bubbles grow. Labels grow along the other
/// axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Vertical,
    Horizontal,
}

/// A single fillable region: one candidate value for one field label.
/// Position is relative to the owning block's shift at read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bubble {
    pub x: i32,
    pub y: i32,
    pub field_label: String,
    pub field_value: String,
}

#[derive(Debug)]
pub enum TemplateError {
    Io(String, std::io::Error),
    Parse(String, serde_json::Error),
    Field(FieldParseError),
    EmptyFieldLabels(String),
    EmptyBubbleValues(String),
    MissingBubbleValues(String),
    UnknownFieldType { block: String, field_type: String },
    DuplicateLabelAcrossBlocks { block: String, label: String },
    Processor(ProcessorError),
}

impl Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::Io(path, e) => write!(f, "error reading {}: {}", path, e),
            TemplateError::Parse(path, e) => write!(f, "error parsing {}: {}", path, e),
            TemplateError::Field(e) => write!(f, "{}", e),
            TemplateError::EmptyFieldLabels(block) => {
                write!(f, "block '{}' has no field labels", block)
            }
            TemplateError::EmptyBubbleValues(block) => {
                write!(f, "block '{}' has no bubble values", block)
            }
            TemplateError::MissingBubbleValues(block) => write!(
                f,
                "block '{}' has neither a fieldType nor explicit bubbleValues",
                block
            ),
            TemplateError::UnknownFieldType { block, field_type } => {
                write!(f, "block '{}' has unknown fieldType '{}'", block, field_type)
            }
            TemplateError::DuplicateLabelAcrossBlocks { block, label } => write!(
                f,
                "field label '{}' in block '{}' is already claimed by another block",
                label, block
            ),
            TemplateError::Processor(e) => write!(f, "{}", e),
        }
    }
}

impl From<FieldParseError> for TemplateError {
    fn from(e: FieldParseError) -> Self {
        TemplateError::Field(e)
    }
}

impl From<ProcessorError> for TemplateError {
    fn from(e: ProcessorError) -> Self {
        TemplateError::Processor(e)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TemplateJson {
    #[serde(default = "default_page_dimensions")]
    page_dimensions: [u32; 2],
    #[serde(default = "default_bubble_dimensions")]
    bubble_dimensions: [u32; 2],
    #[serde(default)]
    field_blocks: BTreeMap<String, FieldBlockJson>,
    #[serde(default)]
    pre_processors: Vec<PreProcessorJson>,
    #[serde(default)]
    custom_labels: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    output_columns: Vec<String>,
    #[serde(default)]
    empty_value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FieldBlockJson {
    origin: [f64; 2],
    bubbles_gap: f64,
    labels_gap: f64,
    field_labels: Vec<String>,
    #[serde(default)]
    bubble_dimensions: Option<[u32; 2]>,
    #[serde(default)]
    field_type: Option<String>,
    #[serde(default)]
    bubble_values: Option<Vec<String>>,
    #[serde(default)]
    direction: Option<Direction>,
    #[serde(default)]
    empty_value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PreProcessorJson {
    name: String,
    #[serde(default)]
    options: serde_json::Value,
}

fn default_page_dimensions() -> [u32; 2] {
    [1640, 2332]
}

fn default_bubble_dimensions() -> [u32; 2] {
    [32, 32]
}

/// Built-in field type presets: bubble value set plus growth direction.
fn field_type_preset(field_type: &str) -> Option<(&'static [&'static str], Direction)> {
    match field_type {
        "QTYPE_INT" => Some((
            &["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"],
            Direction::Vertical,
        )),
        "QTYPE_INT_FROM_1" => Some((
            &["1", "2", "3", "4", "5", "6", "7", "8", "9", "0"],
            Direction::Vertical,
        )),
        "QTYPE_MCQ4" => Some((&["A", "B", "C", "D"], Direction::Horizontal)),
        "QTYPE_MCQ5" => Some((&["A", "B", "C", "D", "E"], Direction::Horizontal)),
        _ => None,
    }
}

/// A rectangular group of bubble rows sharing layout parameters. `shift`
/// is the only mutable part: the alignment engine overwrites it once per
/// image.
#[derive(Debug, Clone)]
pub struct FieldBlock {
    pub name: String,
    pub origin: [f64; 2],
    pub dimensions: [u32; 2],
    pub bubble_dimensions: [u32; 2],
    pub bubble_values: Vec<String>,
    pub direction: Direction,
    pub empty_value: String,
    pub shift: i32,
    rows: Vec<Vec<Bubble>>,
}

impl FieldBlock {
    fn new(
        name: &str,
        json: FieldBlockJson,
        template_bubble_dimensions: [u32; 2],
        template_empty_value: &str,
    ) -> Result<Self, TemplateError> {
        let labels = parse_fields(&format!("Block {}", name), &json.field_labels)?;
        if labels.is_empty() {
            return Err(TemplateError::EmptyFieldLabels(name.to_string()));
        }

        let (preset_values, preset_direction) = match &json.field_type {
            Some(field_type) => {
                let (values, direction) = field_type_preset(field_type).ok_or_else(|| {
                    TemplateError::UnknownFieldType {
                        block: name.to_string(),
                        field_type: field_type.clone(),
                    }
                })?;
                (Some(values), Some(direction))
            }
            None => (None, None),
        };

        let bubble_values = match (&json.bubble_values, preset_values) {
            (Some(values), _) => values.clone(),
            (None, Some(preset)) => preset.iter().map(|v| v.to_string()).collect(),
            (None, None) => return Err(TemplateError::MissingBubbleValues(name.to_string())),
        };
        if bubble_values.is_empty() {
            return Err(TemplateError::EmptyBubbleValues(name.to_string()));
        }

        let direction = json
            .direction
            .or(preset_direction)
            .unwrap_or(Direction::Vertical);
        let bubble_dimensions = json.bubble_dimensions.unwrap_or(template_bubble_dimensions);
        let empty_value = json
            .empty_value
            .clone()
            .unwrap_or_else(|| template_empty_value.to_string());

        let mut block = Self {
            name: name.to_string(),
            origin: json.origin,
            dimensions: [0, 0],
            bubble_dimensions,
            bubble_values,
            direction,
            empty_value,
            shift: 0,
            rows: Vec::new(),
        };
        block.dimensions = block.footprint(&labels, json.bubbles_gap, json.labels_gap);
        block.rows = block.generate_grid(&labels, json.bubbles_gap, json.labels_gap);
        Ok(block)
    }

    /// Total pixel footprint: labels span the outer axis, values the
    /// inner axis; orientation flips with `direction`.
    fn footprint(&self, labels: &[String], bubbles_gap: f64, labels_gap: f64) -> [u32; 2] {
        let [bubble_w, bubble_h] = self.bubble_dimensions;
        let (inner_size, outer_size) = match self.direction {
            Direction::Vertical => (bubble_h, bubble_w),
            Direction::Horizontal => (bubble_w, bubble_h),
        };

        let values_span =
            bubbles_gap * (self.bubble_values.len() as f64 - 1.0) + inner_size as f64;
        let labels_span = labels_gap * (labels.len() as f64 - 1.0) + outer_size as f64;

        match self.direction {
            Direction::Vertical => [labels_span.round() as u32, values_span.round() as u32],
            Direction::Horizontal => [values_span.round() as u32, labels_span.round() as u32],
        }
    }

    /// Expands the declarative descriptor into concrete bubble rows, one
    /// row per field label with one bubble per value.
    fn generate_grid(&self, labels: &[String], bubbles_gap: f64, labels_gap: f64) -> Vec<Vec<Bubble>> {
        let mut rows = Vec::with_capacity(labels.len());
        let mut lead_x = self.origin[0];
        let mut lead_y = self.origin[1];

        for label in labels {
            let mut row = Vec::with_capacity(self.bubble_values.len());
            let mut x = lead_x;
            let mut y = lead_y;

            for value in &self.bubble_values {
                row.push(Bubble {
                    x: x.round() as i32,
                    y: y.round() as i32,
                    field_label: label.clone(),
                    field_value: value.clone(),
                });
                match self.direction {
                    Direction::Vertical => y += bubbles_gap,
                    Direction::Horizontal => x += bubbles_gap,
                }
            }
            rows.push(row);

            match self.direction {
                Direction::Vertical => lead_x += labels_gap,
                Direction::Horizontal => lead_y += labels_gap,
            }
        }

        rows
    }

    pub fn rows(&self) -> &[Vec<Bubble>] {
        &self.rows
    }

    pub fn field_labels(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|row| row[0].field_label.as_str())
    }
}

/// Immutable per-job sheet descriptor (aside from per-block shifts).
/// Built once per directory of sheets and reused across images.
pub struct Template {
    pub page_dimensions: [u32; 2],
    pub field_blocks: Vec<FieldBlock>,
    pub pre_processors: Vec<Box<dyn Preprocessor>>,
    pub custom_labels: BTreeMap<String, Vec<String>>,
    pub non_custom_labels: Vec<String>,
    pub output_columns: Vec<String>,
    pub empty_value: String,
}

impl Template {
    pub fn load(
        path: &Path,
        registry: &ProcessorRegistry,
        config: &TuningConfig,
    ) -> Result<Self, TemplateError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| TemplateError::Io(path.display().to_string(), e))?;
        let parsed: TemplateJson = serde_json::from_str(&json)
            .map_err(|e| TemplateError::Parse(path.display().to_string(), e))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(parsed, base_dir, registry, config)
    }

    fn from_json(
        json: TemplateJson,
        base_dir: &Path,
        registry: &ProcessorRegistry,
        config: &TuningConfig,
    ) -> Result<Self, TemplateError> {
        let mut pre_processors = Vec::with_capacity(json.pre_processors.len());
        for pp in &json.pre_processors {
            pre_processors.push(registry.build(&pp.name, &pp.options, base_dir, config)?);
        }

        let mut field_blocks = Vec::with_capacity(json.field_blocks.len());
        let mut all_labels = HashSet::new();
        for (name, block_json) in json.field_blocks.clone() {
            let block = FieldBlock::new(
                &name,
                block_json,
                json.bubble_dimensions,
                &json.empty_value,
            )?;
            for label in block.field_labels() {
                if !all_labels.insert(label.to_string()) {
                    return Err(TemplateError::DuplicateLabelAcrossBlocks {
                        block: name.clone(),
                        label: label.to_string(),
                    });
                }
            }
            field_blocks.push(block);
        }

        let mut custom_labels = BTreeMap::new();
        let mut custom_members = HashSet::new();
        for (label, field_strings) in &json.custom_labels {
            let members = parse_fields(&format!("Custom Label: {}", label), field_strings)?;
            for member in &members {
                custom_members.insert(member.clone());
            }
            custom_labels.insert(label.clone(), members);
        }

        let mut non_custom_labels: Vec<String> = field_blocks
            .iter()
            .flat_map(|b| b.field_labels().map(str::to_string))
            .filter(|l| !custom_members.contains(l))
            .collect();
        non_custom_labels.sort_by_key(|l| output_column_sort_key(l));

        let output_columns = if json.output_columns.is_empty() {
            let mut columns = non_custom_labels.clone();
            columns.extend(custom_labels.keys().cloned());
            columns.sort_by_key(|l| output_column_sort_key(l));
            columns
        } else {
            parse_fields("Output Columns", &json.output_columns)?
        };

        Ok(Self {
            page_dimensions: json.page_dimensions,
            field_blocks,
            pre_processors,
            custom_labels,
            non_custom_labels,
            output_columns,
            empty_value: json.empty_value,
        })
    }

    /// Files named by preprocessors (marker images and the like) that must
    /// not be treated as sheets.
    pub fn excluded_files(&self) -> Vec<String> {
        self.pre_processors
            .iter()
            .flat_map(|pp| pp.exclude_files())
            .collect()
    }

    /// Resets per-image state left behind by the alignment engine.
    pub fn reset_shifts(&mut self) {
        for block in &mut self.field_blocks {
            block.shift = 0;
        }
    }
}

/// Folds the raw label -> value map into output form: custom labels
/// concatenate their members' values, everything else passes through.
pub fn concatenate_response(
    raw: &BTreeMap<String, String>,
    template: &Template,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (label, members) in &template.custom_labels {
        let joined: String = members
            .iter()
            .map(|m| raw.get(m).map(String::as_str).unwrap_or(""))
            .collect();
        out.insert(label.clone(), joined);
    }
    for label in &template.non_custom_labels {
        if let Some(value) = raw.get(label) {
            out.insert(label.clone(), value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(json: &str) -> Result<Template, TemplateError> {
        let parsed: TemplateJson = serde_json::from_str(json).unwrap();
        Template::from_json(
            parsed,
            Path::new("."),
            &ProcessorRegistry::with_builtins(),
            &TuningConfig::default(),
        )
    }

    fn vertical_block_json() -> &'static str {
        r#"{
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
        }"#
    }

    #[test]
    fn grid_has_labels_times_values_entries() {
        let template = build(vertical_block_json()).unwrap();
        let block = &template.field_blocks[0];
        assert_eq!(block.rows().len(), 5);
        assert!(block.rows().iter().all(|row| row.len() == 4));
    }

    #[test]
    fn vertical_block_grows_bubbles_down_and_labels_right() {
        let template = build(vertical_block_json()).unwrap();
        let block = &template.field_blocks[0];
        let rows = block.rows();

        // bubbles within a row are spaced by bubblesGap along y
        assert_eq!(rows[0][0].x, 20);
        assert_eq!(rows[0][0].y, 30);
        assert_eq!(rows[0][1].y - rows[0][0].y, 40);
        assert_eq!(rows[0][1].x, rows[0][0].x);

        // rows are spaced by labelsGap along x
        assert_eq!(rows[1][0].x - rows[0][0].x, 50);
        assert_eq!(rows[1][0].y, rows[0][0].y);
    }

    #[test]
    fn footprint_matches_gap_arithmetic() {
        let template = build(vertical_block_json()).unwrap();
        let block = &template.field_blocks[0];
        // outer: 50 * (5-1) + 32, inner: 40 * (4-1) + 32
        assert_eq!(block.dimensions, [232, 152]);
    }

    #[test]
    fn horizontal_direction_flips_axes() {
        let template = build(
            r#"{
                "fieldBlocks": {
                    "MCQ": {
                        "origin": [0, 0],
                        "bubblesGap": 30,
                        "labelsGap": 60,
                        "fieldLabels": ["q1..3"],
                        "fieldType": "QTYPE_MCQ4"
                    }
                }
            }"#,
        )
        .unwrap();
        let block = &template.field_blocks[0];
        assert_eq!(block.direction, Direction::Horizontal);
        let rows = block.rows();
        assert_eq!(rows[0][1].x - rows[0][0].x, 30);
        assert_eq!(rows[1][0].y - rows[0][0].y, 60);
        assert_eq!(rows[0][0].field_value, "A");
        assert_eq!(rows[0][3].field_value, "D");
    }

    #[test]
    fn duplicate_labels_across_blocks_fail_to_load() {
        let result = build(
            r#"{
                "fieldBlocks": {
                    "A": {
                        "origin": [0, 0], "bubblesGap": 30, "labelsGap": 30,
                        "fieldLabels": ["q1..4"], "fieldType": "QTYPE_MCQ4"
                    },
                    "B": {
                        "origin": [200, 0], "bubblesGap": 30, "labelsGap": 30,
                        "fieldLabels": ["q4..8"], "fieldType": "QTYPE_MCQ4"
                    }
                }
            }"#,
        );
        assert!(matches!(
            result,
            Err(TemplateError::DuplicateLabelAcrossBlocks { .. })
        ));
    }

    #[test]
    fn unknown_field_type_fails_to_load() {
        let result = build(
            r#"{
                "fieldBlocks": {
                    "A": {
                        "origin": [0, 0], "bubblesGap": 30, "labelsGap": 30,
                        "fieldLabels": ["q1"], "fieldType": "QTYPE_BOGUS"
                    }
                }
            }"#,
        );
        assert!(matches!(result, Err(TemplateError::UnknownFieldType { .. })));
    }

    #[test]
    fn empty_bubble_values_fail_to_load() {
        let result = build(
            r#"{
                "fieldBlocks": {
                    "A": {
                        "origin": [0, 0], "bubblesGap": 30, "labelsGap": 30,
                        "fieldLabels": ["q1"], "bubbleValues": []
                    }
                }
            }"#,
        );
        assert!(matches!(result, Err(TemplateError::EmptyBubbleValues(_))));
    }

    #[test]
    fn output_columns_default_to_sorted_labels_plus_custom() {
        let template = build(
            r#"{
                "fieldBlocks": {
                    "Roll": {
                        "origin": [0, 0], "bubblesGap": 30, "labelsGap": 30,
                        "fieldLabels": ["r1..2"], "fieldType": "QTYPE_INT"
                    },
                    "Qs": {
                        "origin": [200, 0], "bubblesGap": 30, "labelsGap": 30,
                        "fieldLabels": ["q2", "q10", "q1"], "fieldType": "QTYPE_MCQ4"
                    }
                },
                "customLabels": { "roll": ["r1..2"] }
            }"#,
        )
        .unwrap();
        assert_eq!(template.output_columns, vec!["q1", "q2", "q10", "roll"]);
    }

    #[test]
    fn concatenated_response_joins_custom_label_members() {
        let template = build(
            r#"{
                "fieldBlocks": {
                    "Roll": {
                        "origin": [0, 0], "bubblesGap": 30, "labelsGap": 30,
                        "fieldLabels": ["r1..3"], "fieldType": "QTYPE_INT"
                    }
                },
                "customLabels": { "roll": ["r1..3"] }
            }"#,
        )
        .unwrap();
        let mut raw = BTreeMap::new();
        raw.insert("r1".to_string(), "4".to_string());
        raw.insert("r2".to_string(), "2".to_string());
        raw.insert("r3".to_string(), "7".to_string());
        let out = concatenate_response(&raw, &template);
        assert_eq!(out.get("roll").map(String::as_str), Some("427"));
        assert!(!out.contains_key("r1"));
    }
}
