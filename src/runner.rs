use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::GrayImage;
use log::{info, warn};
use logging_timer::time;

use crate::alignment::auto_align;
use crate::config::TuningConfig;
use crate::detection::{draw_template_layout, read_omr_response};
use crate::evaluation::{EvaluationConfig, EvaluationError};
use crate::image_ops::resize_to;
use crate::processors::ProcessorRegistry;
use crate::template::{concatenate_response, Template, TemplateError};

const TEMPLATE_FILE: &str = "template.json";
const EVALUATION_FILE: &str = "evaluation.json";
const MARKED_DIR: &str = "marked";
const DEBUG_DIR: &str = "debug";
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug)]
pub enum RunnerError {
    Config(String),
    Template(TemplateError),
    Evaluation(EvaluationError),
    Io(String, std::io::Error),
}

impl Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::Config(e) => write!(f, "{}", e),
            RunnerError::Template(e) => write!(f, "{}", e),
            RunnerError::Evaluation(e) => write!(f, "{}", e),
            RunnerError::Io(path, e) => write!(f, "io error at {}: {}", path, e),
        }
    }
}

impl From<TemplateError> for RunnerError {
    fn from(e: TemplateError) -> Self {
        RunnerError::Template(e)
    }
}

impl From<EvaluationError> for RunnerError {
    fn from(e: EvaluationError) -> Self {
        RunnerError::Evaluation(e)
    }
}

/// Explicit tally of where every input image ended up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingStats {
    pub processed: u32,
    pub scored: u32,
    pub errors: u32,
    pub multi_marked: u32,
}

impl ProcessingStats {
    fn absorb(&mut self, other: ProcessingStats) {
        self.processed += other.processed;
        self.scored += other.scored;
        self.errors += other.errors;
        self.multi_marked += other.multi_marked;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunnerOptions {
    /// Render template geometry over each sheet instead of reading it.
    pub set_layout: bool,
    /// Force auto-alignment on regardless of the directory's config.
    pub force_auto_align: bool,
}

/// Walks `input_dir` and every subdirectory, processing each directory
/// that carries a `template.json`. Output ledgers and marked images land
/// in the mirrored location under `output_dir`.
pub fn process_dir(
    input_dir: &Path,
    output_dir: &Path,
    registry: &ProcessorRegistry,
    options: &RunnerOptions,
) -> Result<ProcessingStats, RunnerError> {
    let mut stats = ProcessingStats::default();
    walk(input_dir, output_dir, registry, options, &mut stats)?;
    info!(
        "finished: {} processed, {} scored, {} errors, {} multi-marked",
        stats.processed, stats.scored, stats.errors, stats.multi_marked
    );
    Ok(stats)
}

fn walk(
    dir: &Path,
    out_dir: &Path,
    registry: &ProcessorRegistry,
    options: &RunnerOptions,
    stats: &mut ProcessingStats,
) -> Result<(), RunnerError> {
    if dir.join(TEMPLATE_FILE).exists() {
        stats.absorb(process_sheet_dir(dir, out_dir, registry, options)?);
    }

    let entries = std::fs::read_dir(dir)
        .map_err(|e| RunnerError::Io(dir.display().to_string(), e))?;
    let mut subdirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    subdirs.sort();

    for subdir in subdirs {
        let name = subdir.file_name().unwrap_or_default();
        walk(&subdir, &out_dir.join(name), registry, options, stats)?;
    }
    Ok(())
}

struct Ledgers {
    results: BufWriter<File>,
    errors: BufWriter<File>,
    multi_marked: BufWriter<File>,
}

impl Ledgers {
    fn open(out_dir: &Path, output_columns: &[String]) -> std::io::Result<Self> {
        let mut header = vec![
            "file_id".to_string(),
            "input_path".to_string(),
            "output_path".to_string(),
            "score".to_string(),
        ];
        header.extend(output_columns.iter().cloned());

        let open = |name: &str| -> std::io::Result<BufWriter<File>> {
            let mut writer = BufWriter::new(File::create(out_dir.join(name))?);
            writeln!(writer, "{}", csv_row(&header))?;
            Ok(writer)
        };

        Ok(Self {
            results: open("results.csv")?,
            errors: open("errors.csv")?,
            multi_marked: open("multi_marked.csv")?,
        })
    }
}

fn csv_row(cells: &[String]) -> String {
    cells
        .iter()
        .map(|cell| {
            if cell.contains(',') || cell.contains('"') {
                format!("\"{}\"", cell.replace('"', "\"\""))
            } else {
                cell.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[time]
fn process_sheet_dir(
    dir: &Path,
    out_dir: &Path,
    registry: &ProcessorRegistry,
    options: &RunnerOptions,
) -> Result<ProcessingStats, RunnerError> {
    let mut config = TuningConfig::load_from_dir(dir).map_err(RunnerError::Config)?;
    if options.force_auto_align {
        config.alignment_params.auto_align = true;
    }

    let mut template = Template::load(&dir.join(TEMPLATE_FILE), registry, &config)?;
    let evaluation_path = dir.join(EVALUATION_FILE);
    let evaluation = if evaluation_path.exists() {
        Some(EvaluationConfig::load(&evaluation_path, &template.empty_value)?)
    } else {
        None
    };

    let excluded = template.excluded_files();
    let images = list_images(dir, &excluded)?;
    info!(
        "processing {} sheets in {} ({} with an answer key)",
        images.len(),
        dir.display(),
        if evaluation.is_some() { "each" } else { "none" }
    );

    std::fs::create_dir_all(out_dir)
        .map_err(|e| RunnerError::Io(out_dir.display().to_string(), e))?;
    let marked_dir = out_dir.join(MARKED_DIR);
    if !options.set_layout && config.outputs.save_detections {
        std::fs::create_dir_all(&marked_dir)
            .map_err(|e| RunnerError::Io(marked_dir.display().to_string(), e))?;
    }

    let mut ledgers = if options.set_layout {
        None
    } else {
        Some(
            Ledgers::open(out_dir, &template.output_columns)
                .map_err(|e| RunnerError::Io(out_dir.display().to_string(), e))?,
        )
    };

    let mut stats = ProcessingStats::default();
    for image_path in images {
        stats.processed += 1;
        let file_id = image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Some(sheet) = load_and_preprocess(&image_path, &template, &config) else {
            stats.errors += 1;
            if let Some(ledgers) = ledgers.as_mut() {
                write_row(
                    &mut ledgers.errors,
                    &file_id,
                    &image_path,
                    "",
                    None,
                    &BTreeMap::new(),
                    &template.output_columns,
                );
            }
            continue;
        };

        if options.set_layout {
            let layout = draw_template_layout(&template, &sheet, false);
            let layout_path = out_dir.join(format!("{}_layout.png", file_stem(&image_path)));
            if let Err(e) = layout.save(&layout_path) {
                warn!("could not save {}: {}", layout_path.display(), e);
            }
            continue;
        }

        if config.outputs.save_image_level >= 1 {
            save_debug_image(&sheet, out_dir, &format!("{}_input.png", file_stem(&image_path)));
        }

        if config.alignment_params.auto_align {
            let lines = auto_align(&mut template, &sheet, &config);
            if config.outputs.save_image_level >= 2 {
                save_debug_image(
                    &lines,
                    out_dir,
                    &format!("{}_lines.png", file_stem(&image_path)),
                );
            }
        }

        let result = read_omr_response(
            &template,
            &sheet,
            &config,
            config.outputs.save_detections,
        );
        let response = concatenate_response(&result.raw_response, &template);
        let score = evaluation.as_ref().map(|e| e.evaluate(&response));
        if score.is_some() {
            stats.scored += 1;
        }

        let mut output_path = String::new();
        if let Some(marked) = &result.marked_image {
            let path = marked_dir.join(format!("{}.png", file_stem(&image_path)));
            match marked.save(&path) {
                Ok(()) => output_path = path.display().to_string(),
                Err(e) => warn!("could not save {}: {}", path.display(), e),
            }
        }

        if result.multi_marked {
            stats.multi_marked += 1;
        }

        let ledgers = ledgers.as_mut().expect("ledgers exist outside layout mode");
        if result.multi_marked && config.outputs.filter_out_multimarked_files {
            write_row(
                &mut ledgers.multi_marked,
                &file_id,
                &image_path,
                &output_path,
                score,
                &response,
                &template.output_columns,
            );
        } else {
            write_row(
                &mut ledgers.results,
                &file_id,
                &image_path,
                &output_path,
                score,
                &response,
                &template.output_columns,
            );
        }
    }

    Ok(stats)
}

/// Opens the sheet, shrinks it to processing size, and runs the template's
/// preprocessing pipeline. `None` routes the sheet to the error ledger.
fn load_and_preprocess(
    path: &Path,
    template: &Template,
    config: &TuningConfig,
) -> Option<GrayImage> {
    let image = match image::open(path) {
        Ok(image) => image.into_luma8(),
        Err(e) => {
            warn!("could not read {}: {}", path.display(), e);
            return None;
        }
    };

    let mut sheet = resize_to(
        &image,
        config.dimensions.processing_width,
        config.dimensions.processing_height,
    );
    for step in &template.pre_processors {
        match step.apply_filter(&sheet, path) {
            Some(filtered) => sheet = filtered,
            None => {
                warn!("{} failed on {}", step.name(), path.display());
                return None;
            }
        }
    }
    Some(sheet)
}

fn list_images(dir: &Path, excluded: &[String]) -> Result<Vec<PathBuf>, RunnerError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| RunnerError::Io(dir.display().to_string(), e))?;

    let mut images: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| {
                        let ext = ext.to_ascii_lowercase();
                        IMAGE_EXTENSIONS.contains(&ext.as_str())
                    })
                    .unwrap_or(false)
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| !excluded.iter().any(|e| e == name))
                    .unwrap_or(false)
        })
        .collect();
    images.sort();
    Ok(images)
}

/// Staged intermediate images land under `debug/` next to the ledgers,
/// gated by `outputs.save_image_level`.
fn save_debug_image(image: &GrayImage, out_dir: &Path, name: &str) {
    let debug_dir = out_dir.join(DEBUG_DIR);
    if let Err(e) = std::fs::create_dir_all(&debug_dir) {
        warn!("could not create {}: {}", debug_dir.display(), e);
        return;
    }
    let path = debug_dir.join(name);
    if let Err(e) = image.save(&path) {
        warn!("could not save {}: {}", path.display(), e);
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn write_row(
    writer: &mut BufWriter<File>,
    file_id: &str,
    input_path: &Path,
    output_path: &str,
    score: Option<f64>,
    response: &BTreeMap<String, String>,
    output_columns: &[String],
) {
    let mut cells = vec![
        file_id.to_string(),
        input_path.display().to_string(),
        output_path.to_string(),
        score.map(|s| format!("{}", s)).unwrap_or_else(|| "NA".to_string()),
    ];
    for column in output_columns {
        cells.push(response.get(column).cloned().unwrap_or_default());
    }
    if let Err(e) = writeln!(writer, "{}", csv_row(&cells)) {
        warn!("could not append ledger row for {}: {}", file_id, e);
    }
}
