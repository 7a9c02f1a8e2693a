/// Fragmentation report data and the plain-text job summary.
///
/// Writing reports to disk is the front end's business; this module only
/// produces the rows and the summary text.
use crate::engine::JobContext;
use crate::job::progress::ProgressSnapshot;
use crate::model::size::format_size;
use crate::model::{FileFlags, FileRecord};
use serde::Serialize;

/// One fragmented file as it appears in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub fragments: u64,
    /// Bytes.
    pub size: u64,
    pub comment: &'static str,
    pub status: &'static str,
    pub path: String,
}

impl ReportRow {
    fn from_record(file: &FileRecord, bytes_per_cluster: u64) -> Self {
        let comment = if file.is_dir() {
            "[DIR]"
        } else if file.is_compressed() {
            "[CMP]"
        } else if file.is_over_limit() {
            "[OVR]"
        } else {
            " - "
        };
        let status = if file.is_locked() {
            "locked"
        } else if file.flags.contains(FileFlags::MOVING_FAILED) {
            "move failed"
        } else if file.flags.contains(FileFlags::IMPROPER_STATE) {
            "invalid"
        } else {
            " - "
        };
        Self {
            fragments: file.disposition.fragments,
            size: file.size_bytes(bytes_per_cluster),
            comment,
            status,
            path: file.display_path().to_string(),
        }
    }
}

/// Rows for every fragmented file that is not excluded, most fragmented
/// first.
pub fn fragmented_rows(ctx: &JobContext) -> Vec<ReportRow> {
    let bpc = ctx.volume.bytes_per_cluster;
    ctx.catalog
        .fragmented()
        .iter()
        .map(|&id| ctx.catalog.get(id))
        .filter(|f| !f.is_excluded())
        .map(|f| ReportRow::from_record(f, bpc))
        .collect()
}

/// Short summary of the volume state.
pub fn format_results(snapshot: &ProgressSnapshot) -> String {
    let per_file = if snapshot.files == 0 {
        0.0
    } else {
        snapshot.fragments as f64 / snapshot.files as f64
    };
    // never below one fragment per file
    let hundredths = ((per_file * 100.0) as u64).max(100);
    format!(
        "Drive information:\n\n\
         \x20 Total space                  = {}\n\
         \x20 Free space                   = {}\n\n\
         \x20 Total number of files        = {}\n\
         \x20 Number of fragmented files   = {}\n\
         \x20 Fragments per file           = {}.{:02}\n",
        format_size(snapshot.total_space),
        format_size(snapshot.free_space),
        snapshot.files,
        snapshot.fragmented,
        hundredths / 100,
        hundredths % 100,
    )
}
