extern crate log;
extern crate pretty_env_logger;

use std::path::Path;
use std::process::exit;

use clap::{arg, command, Command};

use crate::processors::ProcessorRegistry;
use crate::runner::{process_dir, RunnerOptions};

mod alignment;
mod config;
mod detection;
mod evaluation;
mod fields;
mod geometry;
mod image_ops;
mod processors;
mod runner;
mod template;
mod threshold;

fn main() {
    pretty_env_logger::init_custom_env("LOG");

    let matches = cli().get_matches();
    let input_dir = matches
        .get_one::<String>("input_dir")
        .expect("input directory is required");
    let output_dir = matches
        .get_one::<String>("output")
        .expect("output directory has a default");
    let options = RunnerOptions {
        set_layout: matches.get_flag("set-layout"),
        force_auto_align: matches.get_flag("auto-align"),
    };

    let registry = ProcessorRegistry::with_builtins();
    match process_dir(
        Path::new(input_dir),
        Path::new(output_dir),
        &registry,
        &options,
    ) {
        Ok(stats) => {
            println!(
                "Processed {} sheets: {} scored, {} errors, {} multi-marked",
                stats.processed, stats.scored, stats.errors, stats.multi_marked
            );
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    }
}

fn cli() -> Command {
    command!()
        .arg(
            arg!(input_dir: <INPUT_DIR> "Directory of sheet images and their template.json")
                .required(true),
        )
        .arg(arg!(-o --output <OUTPUT_DIR> "Directory for ledgers and marked sheets")
            .default_value("outputs"))
        .arg(arg!(--"set-layout" "Render template layouts over the sheets instead of reading them"))
        .arg(arg!(-a --"auto-align" "Force per-block auto-alignment on"))
}
