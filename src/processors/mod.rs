use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;

use image::GrayImage;
use serde_json::Value;

use crate::config::TuningConfig;

mod builtins;
mod crop_on_markers;
mod crop_page;

pub use builtins::{GaussianBlur, Levels, MedianBlur};
pub use crop_on_markers::CropOnMarkers;
pub use crop_page::CropPage;

/// Construction-time failures for preprocessing steps. Fatal to loading
/// the template that names the step.
#[derive(Debug)]
pub enum ProcessorError {
    UnknownProcessor(String),
    BadOptions {
        name: String,
        error: serde_json::Error,
    },
    MarkerUnreadable {
        path: String,
        error: image::ImageError,
    },
}

impl Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorError::UnknownProcessor(name) => {
                write!(f, "unknown preprocessor '{}'", name)
            }
            ProcessorError::BadOptions { name, error } => {
                write!(f, "invalid options for preprocessor '{}': {}", name, error)
            }
            ProcessorError::MarkerUnreadable { path, error } => {
                write!(f, "could not read marker image '{}': {}", path, error)
            }
        }
    }
}

/// One step of the preprocessing pipeline. Steps are applied in template
/// order before recognition; a `None` result is the failure sentinel that
/// excludes the sheet from scoring.
pub trait Preprocessor {
    fn name(&self) -> &'static str;

    fn apply_filter(&self, image: &GrayImage, file_path: &Path) -> Option<GrayImage>;

    /// Sidecar files this step consumes (relative to the input directory)
    /// that must not be treated as sheets.
    fn exclude_files(&self) -> Vec<String> {
        Vec::new()
    }
}

type ProcessorFactory =
    fn(&Value, &Path, &TuningConfig) -> Result<Box<dyn Preprocessor>, ProcessorError>;

/// Explicit step-name -> factory registry, constructed once at startup
/// and passed into the template loader.
pub struct ProcessorRegistry {
    factories: BTreeMap<&'static str, ProcessorFactory>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("Levels", builtins::Levels::factory);
        registry.register("MedianBlur", builtins::MedianBlur::factory);
        registry.register("GaussianBlur", builtins::GaussianBlur::factory);
        registry.register("CropPage", crop_page::CropPage::factory);
        registry.register("CropOnMarkers", crop_on_markers::CropOnMarkers::factory);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: ProcessorFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().copied()
    }

    pub fn build(
        &self,
        name: &str,
        options: &Value,
        base_dir: &Path,
        config: &TuningConfig,
    ) -> Result<Box<dyn Preprocessor>, ProcessorError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ProcessorError::UnknownProcessor(name.to_string()))?;
        factory(options, base_dir, config)
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

pub(crate) fn parse_options<T: serde::de::DeserializeOwned>(
    name: &str,
    options: &Value,
) -> Result<T, ProcessorError> {
    let value = if options.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        options.clone()
    };
    serde_json::from_value(value).map_err(|error| ProcessorError::BadOptions {
        name: name.to_string(),
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_the_standard_steps() {
        let registry = ProcessorRegistry::with_builtins();
        let names: Vec<&str> = registry.names().collect();
        assert!(names.contains(&"Levels"));
        assert!(names.contains(&"CropPage"));
        assert!(names.contains(&"CropOnMarkers"));
    }

    #[test]
    fn unknown_step_is_a_construction_error() {
        let registry = ProcessorRegistry::with_builtins();
        let result = registry.build(
            "Nonexistent",
            &Value::Null,
            Path::new("."),
            &TuningConfig::default(),
        );
        assert!(matches!(result, Err(ProcessorError::UnknownProcessor(_))));
    }

    #[test]
    fn builds_builtin_with_default_options() {
        let registry = ProcessorRegistry::with_builtins();
        let step = registry
            .build(
                "GaussianBlur",
                &Value::Null,
                Path::new("."),
                &TuningConfig::default(),
            )
            .unwrap();
        assert_eq!(step.name(), "GaussianBlur");
    }
}
