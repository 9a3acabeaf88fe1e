#[macro_use]
extern crate log;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use leaktrace::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON heap snapshot to analyze.
    #[arg(required = true)]
    snapshot: PathBuf,

    /// Element count above which a container becomes a leak candidate.
    #[arg(short, long, default_value_t = 500)]
    size_threshold: u64,

    /// Recorded-edge cap per (target, referring class).
    #[arg(long, default_value_t = 5)]
    max_fan_in: u32,

    /// Heap scan budget; 0 reports candidates without building the graph.
    #[arg(short, long, default_value_t = 0)]
    max_passes: u32,

    /// Accept stack and native locals as chain roots.
    #[arg(long)]
    consider_local_references: bool,

    /// Report candidates that have no chain to a root.
    #[arg(long)]
    show_unreachables: bool,

    /// Class never flagged as a candidate (repeatable).
    #[arg(long = "ignore-class")]
    ignore_classes: Vec<String>,

    /// Field exclusion as Class.field=threshold (repeatable).
    #[arg(short, long = "exclude")]
    exclusions: Vec<String>,

    /// Report destination; stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

pub fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = AnalysisConfig {
        size_threshold: args.size_threshold,
        max_fan_in: args.max_fan_in,
        max_passes: args.max_passes,
        consider_local_refs: args.consider_local_references,
        show_unreachable: args.show_unreachables,
        ..AnalysisConfig::default()
    };
    config.ignore_classes.extend(args.ignore_classes);
    for spec in &args.exclusions {
        config.add_exclusion(spec)?;
    }

    let mut heap = SnapshotHeap::from_path(&args.snapshot)?;
    info!("loaded snapshot {}", args.snapshot.display());

    let out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    };
    let mut sink = XmlWriter::new(out);
    run_analysis(&mut heap, &config, &mut sink)
}
