/// Configuration loading and report files for the console front end.
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use fragsleuth_core::job::options::JobOptions;
use fragsleuth_core::report::ReportRow;
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Read job options from a JSON file; missing fields keep their defaults.
pub fn load_options(path: Option<&Path>) -> Result<JobOptions> {
    let Some(path) = path else {
        return Ok(JobOptions::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read options file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("invalid options file {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Csv,
    Json,
}

impl ReportFormat {
    /// `.json` selects JSON; anything else is written as CSV.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ReportFormat::Json,
            _ => ReportFormat::Csv,
        }
    }
}

/// Default report location: `fraglist_C_20240131_235959.csv` in `dir`.
pub fn default_report_path(dir: &Path, letter: char, at: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "fraglist_{}_{}.csv",
        letter.to_ascii_uppercase(),
        at.format("%Y%m%d_%H%M%S")
    ))
}

#[derive(Serialize)]
struct JsonReport<'a> {
    volume: String,
    generated: DateTime<Local>,
    files: &'a [ReportRow],
}

/// Write the fragmented file list to `path` in the format its extension
/// selects.
pub fn write_report(
    path: &Path,
    letter: char,
    rows: &[ReportRow],
    generated: DateTime<Local>,
) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("cannot create report {}", path.display()))?;
    match ReportFormat::from_path(path) {
        ReportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(file);
            for row in rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        ReportFormat::Json => {
            let report = JsonReport {
                volume: format!("{}:", letter.to_ascii_uppercase()),
                generated,
                files: rows,
            };
            serde_json::to_writer_pretty(BufWriter::new(file), &report)?;
        }
    }
    tracing::info!("report saved to {}", path.display());
    Ok(())
}
