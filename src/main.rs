//! FragSleuth: volume defragmenter and optimizer.
//!
//! Thin console entry point. All logic lives in the `fragsleuth-core` crate.

mod output;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use fragsleuth_core::io::sim::SimVolume;
use fragsleuth_core::io::VolumeIo;
use fragsleuth_core::job::options::{parse_duration, JobOptions};
use fragsleuth_core::job::progress::{JobFlags, JobKind, ProgressSnapshot};
use fragsleuth_core::job::{run_job, JobRequest};
use fragsleuth_core::map::SpaceColor;
use fragsleuth_core::model::size::parse_size;
use fragsleuth_core::report::format_results;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cells per line of the console cluster map.
const MAP_LINE_WIDTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum JobArg {
    Analyze,
    Defrag,
    QuickOpt,
    FullOpt,
    MftOpt,
}

impl From<JobArg> for JobKind {
    fn from(arg: JobArg) -> Self {
        match arg {
            JobArg::Analyze => JobKind::Analyze,
            JobArg::Defrag => JobKind::Defragment,
            JobArg::QuickOpt => JobKind::QuickOptimize,
            JobArg::FullOpt => JobKind::FullOptimize,
            JobArg::MftOpt => JobKind::OptimizeMft,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "FragSleuth", version, about = "Analyze, defragment and optimize volumes")]
struct Args {
    /// Drive letter, e.g. `C` or `C:`.
    #[arg(value_parser = parse_letter)]
    volume: char,

    #[arg(short, long, value_enum, default_value_t = JobArg::Analyze)]
    job: JobArg,

    /// Run against a simulated volume described by a JSON file.
    #[arg(long, value_name = "FILE")]
    sim: Option<PathBuf>,

    /// Write the simulated volume back after the job.
    #[arg(long, value_name = "FILE", requires = "sim")]
    save_sim: Option<PathBuf>,

    /// Job options as JSON; flags below override it.
    #[arg(long, value_name = "FILE")]
    options: Option<PathBuf>,

    /// Repeat passes while they keep moving clusters.
    #[arg(short, long)]
    repeat: bool,

    /// Count the moves without issuing them.
    #[arg(long)]
    dry_run: bool,

    /// `;`-separated patterns of paths to process.
    #[arg(long, value_name = "PATTERNS")]
    include: Option<String>,

    /// `;`-separated patterns of paths to skip.
    #[arg(long, value_name = "PATTERNS")]
    exclude: Option<String>,

    /// Skip files larger than this, e.g. `50M`.
    #[arg(long, value_name = "SIZE", value_parser = parse_size_arg)]
    size_limit: Option<u64>,

    /// Skip files with fewer fragments than this.
    #[arg(long, value_name = "N")]
    fragments_limit: Option<u64>,

    /// Only defragment fragments smaller than this, e.g. `20M`.
    #[arg(long, value_name = "SIZE", value_parser = parse_size_arg)]
    fragment_size_threshold: Option<u64>,

    /// Skip the job when fragmentation is below this percentage.
    #[arg(long, value_name = "PERCENT")]
    threshold: Option<f64>,

    /// Stop after this long, e.g. `1h 30m`.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration_arg)]
    time_limit: Option<u64>,

    /// Cells in the cluster map printed after the job; 0 disables it.
    #[arg(long, default_value_t = 0)]
    map_size: usize,

    /// Report file; `.json` selects JSON, anything else CSV.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Do not write a report.
    #[arg(long)]
    no_report: bool,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, options: &mut JobOptions) {
        if let Some(v) = &self.include {
            options.in_filter = v.clone();
        }
        if let Some(v) = &self.exclude {
            options.ex_filter = v.clone();
        }
        if let Some(v) = self.size_limit {
            options.size_limit = v;
        }
        if let Some(v) = self.fragments_limit {
            options.fragments_limit = v;
        }
        if let Some(v) = self.fragment_size_threshold {
            options.fragment_size_threshold = v;
        }
        if let Some(v) = self.threshold {
            options.fragmentation_threshold = v;
        }
        if let Some(v) = self.time_limit {
            options.time_limit = v;
        }
        options.dry_run |= self.dry_run;
        options.disable_reports |= self.no_report;
    }
}

fn parse_letter(text: &str) -> Result<char, String> {
    let trimmed = text.trim_end_matches(['\\', '/']).trim_end_matches(':');
    let mut chars = trimmed.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Ok(c.to_ascii_uppercase()),
        _ => Err(format!("`{text}` is not a drive letter")),
    }
}

fn parse_size_arg(text: &str) -> Result<u64, String> {
    parse_size(text).ok_or_else(|| format!("`{text}` is not a size"))
}

fn parse_duration_arg(text: &str) -> Result<u64, String> {
    parse_duration(text)
        .map(|d| d.as_secs())
        .ok_or_else(|| format!("`{text}` is not a duration"))
}

#[cfg(windows)]
fn open_live_volume(letter: char) -> Result<Arc<dyn VolumeIo>> {
    use fragsleuth_core::platform::{is_elevated, WinVolume};
    if !is_elevated() {
        tracing::warn!("not running as administrator; the volume will probably fail to open");
    }
    let volume = WinVolume::open(letter).with_context(|| format!("cannot open {letter}:"))?;
    Ok(Arc::new(volume))
}

#[cfg(not(windows))]
fn open_live_volume(_letter: char) -> Result<Arc<dyn VolumeIo>> {
    anyhow::bail!("live volumes are only supported on Windows; use --sim")
}

fn print_progress(snapshot: &ProgressSnapshot, last: &mut Option<(u32, u64)>) {
    let state = (snapshot.pass_number, snapshot.percentage as u64);
    if *last == Some(state) {
        return;
    }
    *last = Some(state);
    eprint!(
        "\r{:?} pass {}: {:>3}% done, {:.2}% fragmented   ",
        snapshot.phase, snapshot.pass_number, state.1, snapshot.fragmentation
    );
    let _ = std::io::stderr().flush();
}

fn print_map(cells: &[SpaceColor]) {
    for line in cells.chunks(MAP_LINE_WIDTH) {
        println!("  {}", line.iter().map(|c| c.glyph()).collect::<String>());
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    let mut options = output::load_options(args.options.as_deref())?;
    options.apply_env();
    args.apply(&mut options);

    let sim = match &args.sim {
        Some(path) => Some(Arc::new(
            SimVolume::load(path).with_context(|| format!("cannot load {}", path.display()))?,
        )),
        None => None,
    };
    let io: Arc<dyn VolumeIo> = match &sim {
        Some(sim) => sim.clone(),
        None => open_live_volume(args.volume)?,
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
            .context("cannot install the Ctrl+C handler")?;
    }

    let mut request = JobRequest::new(args.volume, args.job.into());
    if args.repeat {
        request.flags |= JobFlags::REPEAT;
    }
    request.map_size = args.map_size;
    request.options = options;
    let disable_reports = request.options.disable_reports;

    tracing::info!("FragSleuth {} starting", env!("CARGO_PKG_VERSION"));
    let mut last = None;
    let outcome = run_job(
        io,
        request,
        |snapshot| print_progress(snapshot, &mut last),
        || stop.load(Ordering::Relaxed),
    );
    eprintln!();

    println!("{}", format_results(&outcome.snapshot));
    if let Some(cells) = &outcome.snapshot.cluster_map {
        print_map(cells);
    }

    if !disable_reports {
        let generated = chrono::Local::now();
        let path = match &args.report {
            Some(path) => path.clone(),
            None => output::default_report_path(&std::env::current_dir()?, args.volume, generated),
        };
        output::write_report(&path, args.volume, &outcome.report, generated)?;
    }

    if let (Some(sim), Some(path)) = (&sim, &args.save_sim) {
        let json = serde_json::to_string_pretty(&sim.snapshot())?;
        std::fs::write(path, json).with_context(|| format!("cannot write {}", path.display()))?;
    }

    if outcome.cancelled {
        tracing::info!("job cancelled after {:.2?}", outcome.duration);
    }
    let kind = JobKind::from(args.job);
    outcome.result.map_err(|e| anyhow!("{} failed: {e}", kind.name()))
}
