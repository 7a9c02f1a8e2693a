/// Per-job state threaded through every engine routine.
///
/// A `JobContext` is created when a job starts and dropped when it ends.
/// It owns the catalog, the free-space index, the cluster map and the
/// block index; the analyzer fills them and the mover alone changes them
/// afterwards. The only state shared with other threads is the published
/// progress snapshot.
use super::filter::PathFilters;
use crate::io::{MoveError, VolumeIo};
use crate::job::options::JobOptions;
use crate::job::progress::{JobFlags, JobKind, ProgressSnapshot};
use crate::map::{file_color, ClusterMap, SpaceColor};
use crate::model::{Disposition, FileCatalog, FileFlags, FileId, Volume};
use crate::regions::{FreeRegion, FreeSpaceIndex};
use crate::error::Result;
use crate::search::{FileBlockIndex, IndexError, LinearScan, TreeIndex};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Which block index a job uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndexMode {
    /// Ordered tree for moving jobs, linear scan for analysis.
    #[default]
    Auto,
    /// Always scan linearly.
    Linear,
    /// Tree limited to the given number of blocks; falls back to the
    /// linear scan once the limit is hit.
    Bounded(usize),
}

/// Cancellation flags polled at every per-file, per-pass and per-chunk
/// boundary.
#[derive(Debug, Clone, Default)]
pub struct Terminator {
    /// Set by the caller.
    cancel: Arc<AtomicBool>,
    /// Set by the job controller when the time limit expires.
    kill: Arc<AtomicBool>,
}

impl Terminator {
    pub fn new(cancel: Arc<AtomicBool>, kill: Arc<AtomicBool>) -> Self {
        Self { cancel, kill }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || self.kill.load(Ordering::Relaxed)
    }

    /// `true` only when the caller asked to stop; an expired time limit
    /// does not count.
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Time spent in each kind of work.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfCounters {
    pub analysis: Duration,
    pub searching: Duration,
    pub moving: Duration,
    pub temp_space_release: Duration,
}

impl PerfCounters {
    pub fn log(&self, overall: Duration) {
        info!("volume processing completed in {overall:.2?}:");
        for (name, value) in [
            ("analysis", self.analysis),
            ("searching", self.searching),
            ("moving", self.moving),
            ("releasing temp space", self.temp_space_release),
        ] {
            let share = if overall.is_zero() {
                0.0
            } else {
                value.as_secs_f64() / overall.as_secs_f64() * 100.0
            };
            info!(" - {name:<22} {value:>10.2?} ({share:.2} %)");
        }
    }
}

/// A volume opened for cluster moves, closed again on drop.
///
/// Dry runs hold an empty session and never touch the volume.
#[must_use = "the volume closes as soon as the session is dropped"]
pub struct MoveSession {
    io: Option<Arc<dyn VolumeIo>>,
}

impl Drop for MoveSession {
    fn drop(&mut self) {
        if let Some(io) = self.io.take() {
            io.end_moves();
        }
    }
}

pub struct JobContext {
    pub io: Arc<dyn VolumeIo>,
    pub letter: char,
    pub kind: JobKind,
    pub flags: JobFlags,
    pub options: JobOptions,
    pub filters: PathFilters,
    pub volume: Volume,
    pub catalog: FileCatalog,
    pub free: FreeSpaceIndex,
    pub map: ClusterMap,
    pub stats: ProgressSnapshot,
    /// Fragment size threshold in bytes; zero when unset.
    pub fragment_size_threshold: u64,
    /// The threshold was chosen by the defragmenter, not by the user.
    pub algorithm_defined_fst: bool,
    pub mft_zone: Option<FreeRegion>,
    /// Failure reported by the last `move_clusters` call, if any.
    pub last_move_status: Option<MoveError>,
    pub counters: PerfCounters,
    /// Clusters of files the quick optimizer left in place.
    pub already_optimized_clusters: u64,
    map_size: usize,
    index: Box<dyn FileBlockIndex>,
    terminator: Terminator,
    shared: Option<Arc<Mutex<ProgressSnapshot>>>,
    last_publish: Option<Instant>,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        io: Arc<dyn VolumeIo>,
        letter: char,
        kind: JobKind,
        flags: JobFlags,
        map_size: usize,
        options: JobOptions,
        index_mode: IndexMode,
        terminator: Terminator,
    ) -> Self {
        let index: Box<dyn FileBlockIndex> = match index_mode {
            IndexMode::Auto if kind.is_analysis() => Box::new(LinearScan),
            IndexMode::Auto => Box::new(TreeIndex::new()),
            IndexMode::Linear => Box::new(LinearScan),
            IndexMode::Bounded(limit) => Box::new(TreeIndex::with_limit(limit)),
        };
        debug!("block search uses the {} index", index.name());
        let filters = PathFilters::new(&options.in_filter, &options.ex_filter, &options.cut_filter);
        Self {
            io,
            letter: letter.to_ascii_uppercase(),
            kind,
            flags,
            fragment_size_threshold: options.fragment_size_threshold,
            options,
            filters,
            volume: Volume::default(),
            catalog: FileCatalog::default(),
            free: FreeSpaceIndex::new(),
            map: ClusterMap::disabled(),
            stats: ProgressSnapshot::default(),
            algorithm_defined_fst: false,
            mft_zone: None,
            last_move_status: None,
            counters: PerfCounters::default(),
            already_optimized_clusters: 0,
            map_size,
            index,
            terminator,
            shared: None,
            last_publish: None,
        }
    }

    /// Publish snapshots into `shared` from now on.
    pub fn with_shared_progress(mut self, shared: Arc<Mutex<ProgressSnapshot>>) -> Self {
        self.shared = Some(shared);
        self
    }

    #[inline]
    pub fn terminated(&self) -> bool {
        self.terminator.is_set()
    }

    pub fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    pub fn map_size(&self) -> usize {
        self.map_size
    }

    /// Open the volume for the moves of one pass or routine.
    pub fn begin_moves(&self) -> Result<MoveSession> {
        if self.options.dry_run {
            return Ok(MoveSession { io: None });
        }
        self.io.begin_moves()?;
        Ok(MoveSession {
            io: Some(self.io.clone()),
        })
    }

    /// Threshold used by the fragment size filter, if the user set one.
    pub fn fragment_size_filter(&self) -> Option<u64> {
        (self.fragment_size_threshold != 0 && !self.algorithm_defined_fst)
            .then_some(self.fragment_size_threshold)
    }

    // ── Progress ────────────────────────────────────────────────────────────

    /// Current counters with percentages and the rendered map.
    pub fn snapshot(&mut self) -> ProgressSnapshot {
        self.stats.update_percentages();
        let mut snapshot = self.stats.clone();
        if self.map.is_enabled() {
            snapshot.cluster_map = Some(self.map.render());
        }
        snapshot
    }

    /// Publish a snapshot unless one went out less than half a refresh
    /// interval ago.
    pub fn publish(&mut self) {
        if self.shared.is_none() {
            return;
        }
        let min_gap = self.options.refresh() / 2;
        if self.last_publish.is_some_and(|t| t.elapsed() < min_gap) {
            return;
        }
        self.force_publish();
    }

    pub fn force_publish(&mut self) {
        if self.shared.is_none() {
            return;
        }
        let snapshot = self.snapshot();
        if let Some(shared) = &self.shared {
            *shared.lock() = snapshot;
        }
        self.last_publish = Some(Instant::now());
    }

    // ── Files ───────────────────────────────────────────────────────────────

    /// Repaint every block of the file from `old` to its current colour.
    pub fn colorize_file(&mut self, id: FileId, old: SpaceColor) {
        let file = self.catalog.get(id);
        let new = file_color(&self.volume, file);
        for block in &file.disposition.blocks {
            self.map.colorize(block.lcn, block.length, new, old);
        }
    }

    /// Check whether the file can be opened for moving. The answer is
    /// cached in the `LOCKED` / `NOT_LOCKED` flags; a locked file is
    /// repainted as system space.
    pub fn is_file_locked(&mut self, id: FileId) -> bool {
        let file = self.catalog.get(id);
        if file.flags.contains(FileFlags::NOT_LOCKED) {
            return false;
        }
        if file.flags.contains(FileFlags::LOCKED) {
            return true;
        }

        match self.io.open_for_move(&file.path) {
            Ok(handle) => {
                self.io.close(handle);
                self.catalog.get_mut(id).flags.insert(FileFlags::NOT_LOCKED);
                false
            }
            Err(e) => {
                debug!("{} is locked: {e}", file.display_path());
                let old = file_color(&self.volume, file);
                self.catalog.get_mut(id).flags.insert(FileFlags::LOCKED);
                self.colorize_file(id, old);
                true
            }
        }
    }

    /// Re-read the free regions so that space the file system held after
    /// earlier moves becomes usable. Skipped in dry-run mode.
    pub fn release_temp_space(&mut self) {
        if self.options.dry_run {
            return;
        }
        let started = Instant::now();
        match self.io.free_regions(true) {
            Ok(scan) => {
                if scan.partial {
                    debug!("free space refresh returned a partial bitmap");
                }
                self.free.replace_all(scan.regions);
            }
            Err(e) => warn!("cannot refresh free space: {e}"),
        }
        self.counters.temp_space_release += started.elapsed();
    }

    // ── Block index ─────────────────────────────────────────────────────────

    pub fn index(&self) -> &dyn FileBlockIndex {
        self.index.as_ref()
    }

    pub fn rebuild_index(&mut self) {
        if let Err(e) = self.index.rebuild(&self.catalog) {
            self.index_failed(e);
        }
    }

    /// Swap the indexed blocks of `id` from `old` to its current disposition.
    pub fn reindex_file(&mut self, id: FileId, old: &Disposition) {
        let result = self
            .index
            .remove(id, old)
            .and_then(|()| self.index.insert(id, &self.catalog.get(id).disposition));
        if let Err(e) = result {
            self.index_failed(e);
        }
    }

    fn index_failed(&mut self, error: IndexError) {
        warn!(
            "{} index failed ({error}), switching to linear block search",
            self.index.name()
        );
        self.index = Box::new(LinearScan);
    }
}
