//! Top-level CLI definition and dispatch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use colored::Colorize;

use deepglass::core::config::ScanConfig;
use deepglass::core::errors::Result;
use deepglass::platform::Sources;
use deepglass::report::ReportSet;
use deepglass::scan::{ScanSummary, run_scan};

/// DEEPGLASS — host forensic scanner.
#[derive(Debug, Parser)]
#[command(
    name = "deepglass",
    author,
    version,
    about = "DEEPGLASS - persistence, sideloading, and in-memory tampering scanner",
    long_about = None
)]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Override the results directory.
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,
    /// Worker-thread count (0 = number of CPUs).
    #[arg(long, value_name = "N")]
    threads: Option<usize>,
    /// Skip the registry engine.
    #[arg(long)]
    no_registry: bool,
    /// Skip the filesystem engine.
    #[arg(long)]
    no_filesystem: bool,
    /// Skip the module/handle engine.
    #[arg(long)]
    no_handles: bool,
    /// Skip the memory-consistency engine.
    #[arg(long)]
    no_memory: bool,
    /// Do not copy suspects into the results directory.
    #[arg(long)]
    no_collect: bool,
    /// Disable colored output.
    #[arg(long)]
    no_color: bool,
}

/// Build the effective configuration and run the scan.
pub fn run(args: &Cli) -> Result<()> {
    if args.no_color {
        colored::control::set_override(false);
    }

    let mut config = match &args.config {
        Some(path) => ScanConfig::load(path)?,
        None => ScanConfig::default(),
    };
    if let Some(output) = &args.output {
        config.output_dir.clone_from(output);
    }
    if let Some(threads) = args.threads {
        config.worker_threads = threads;
    }
    config.engines.registry &= !args.no_registry;
    config.engines.filesystem &= !args.no_filesystem;
    config.engines.handles &= !args.no_handles;
    config.engines.memory &= !args.no_memory;
    config.collect_files &= !args.no_collect;
    config.validate()?;

    // Results-directory initialization is the one fatal step.
    let reports = Arc::new(ReportSet::initialize(&config.output_dir)?);

    let started = Instant::now();
    let summary = run_scan(&config, reports, Sources::system())?;
    print_summary(&config, &summary, started.elapsed().as_secs_f64());
    Ok(())
}

fn print_summary(config: &ScanConfig, summary: &ScanSummary, elapsed_secs: f64) {
    println!("{}", "scan complete".bold());
    println!("  registry suspects:    {}", summary.registry_suspects);
    println!("  filesystem suspects:  {}", summary.filesystem_suspects);
    println!("  process suspects:     {}", summary.process_suspects);
    println!("  inconsistent images:  {}", count_colored(summary.inconsistent_images));
    println!("  total suspects:       {}", count_colored(summary.total_suspects));
    println!(
        "  reports under {} ({elapsed_secs:.1}s)",
        config.output_dir.display()
    );
}

fn count_colored(count: usize) -> String {
    if count == 0 {
        count.to_string().green().to_string()
    } else {
        count.to_string().red().bold().to_string()
    }
}
