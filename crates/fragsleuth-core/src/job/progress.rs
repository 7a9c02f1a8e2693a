/// Job progress reporting: snapshots published by the worker and the
/// messages delivered to the caller over a crossbeam channel.
use crate::error::DefragError;
use crate::map::SpaceColor;
use crate::model::size::SizeCounters;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Analyze,
    Defragment,
    FullOptimize,
    QuickOptimize,
    OptimizeMft,
}

impl JobKind {
    pub fn is_analysis(self) -> bool {
        self == JobKind::Analyze
    }

    pub fn name(self) -> &'static str {
        match self {
            JobKind::Analyze => "analysis",
            JobKind::Defragment => "defragmentation",
            JobKind::FullOptimize => "full optimization",
            JobKind::QuickOptimize => "quick optimization",
            JobKind::OptimizeMft => "MFT optimization",
        }
    }
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
    pub struct JobFlags: u8 {
        /// Repeat passes while they keep moving clusters.
        const REPEAT       = 0b01;
        /// Started from a file manager context menu: count every file in
        /// the selection, resident ones included.
        const CONTEXT_MENU = 0b10;
    }
}

/// Operation currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Idle,
    Analysis,
    Defragmentation,
    Optimization,
}

/// Counters describing a job at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub files: u64,
    pub directories: u64,
    pub compressed: u64,
    pub fragmented: u64,
    pub fragments: u64,
    pub bad_fragments: u64,
    pub total_space: u64,
    pub free_space: u64,
    pub mft_size: u64,
    pub processed_clusters: u64,
    pub clusters_to_process: u64,
    pub moved_clusters: u64,
    pub total_moves: u64,
    pub pass_number: u32,
    pub phase: Phase,
    /// Zero while running; positive on success, negative error code on failure.
    pub completion_status: i32,
    pub percentage: f64,
    pub fragmentation: f64,
    pub size_counters: SizeCounters,
    #[serde(skip)]
    pub cluster_map: Option<Vec<SpaceColor>>,
}

impl ProgressSnapshot {
    /// Recompute the derived percentages from the counters.
    pub fn update_percentages(&mut self) {
        self.percentage = ratio(self.processed_clusters, self.clusters_to_process);
        self.fragmentation = ratio(self.bad_fragments, self.fragments);
    }
}

/// Both counts are halved first so the division stays well inside `f64`
/// precision for any volume size.
fn ratio(x: u64, y: u64) -> f64 {
    let (x, y) = (x / 2, y / 2);
    if y == 0 {
        0.0
    } else {
        x as f64 / y as f64 * 100.0
    }
}

/// Messages sent from the job to the caller.
#[derive(Debug)]
pub enum JobProgress {
    /// Periodic snapshot.
    Update(Box<ProgressSnapshot>),
    /// The job finished; moves may have been cut short by the time limit.
    Complete {
        snapshot: Box<ProgressSnapshot>,
        duration: Duration,
    },
    /// A volume-level error stopped the job.
    Failed {
        snapshot: Box<ProgressSnapshot>,
        error: DefragError,
    },
    /// The job was cancelled by the caller.
    Cancelled { snapshot: Box<ProgressSnapshot> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentages() {
        let mut snap = ProgressSnapshot {
            processed_clusters: 50,
            clusters_to_process: 200,
            bad_fragments: 3,
            fragments: 10,
            ..Default::default()
        };
        snap.update_percentages();
        assert!((snap.percentage - 25.0).abs() < 1e-9);
        assert!((snap.fragmentation - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_totals() {
        let mut snap = ProgressSnapshot {
            processed_clusters: 1,
            clusters_to_process: 1,
            ..Default::default()
        };
        snap.update_percentages();
        assert_eq!(snap.percentage, 0.0);
        assert_eq!(snap.fragmentation, 0.0);
    }
}
