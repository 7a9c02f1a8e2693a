/// Volume I/O: the collaborator interface the engine drives.
///
/// Everything that touches a real disk sits behind [`VolumeIo`]: geometry,
/// the free-space bitmap, file enumeration, the cluster-move primitive and
/// extent re-query. [`sim::SimVolume`] implements it in memory; the Windows
/// back-end lives in `platform::volume`.
pub mod sim;

use crate::error::Result;
use crate::model::{Block, FileRecord, VolumeGeometry};
use crate::regions::FreeRegion;
use thiserror::Error;

/// Free regions as reported by the volume bitmap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitmapScan {
    pub regions: Vec<FreeRegion>,
    /// `true` if the bitmap could only be read in part.
    pub partial: bool,
}

/// Which part of the volume a file scan covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanScope {
    /// Every file on the volume.
    Volume,
    /// Entries below `path` (native form, e.g. `\??\C:\dir`).
    Directory { path: String, recursive: bool },
}

/// Hooks invoked by [`VolumeIo::scan_files`] for every entry found.
pub trait ScanCallbacks {
    /// Inspect (and flag) an entry. Returning `true` skips its children.
    fn filter(&mut self, entry: &mut FileRecord) -> bool;

    /// Called for every entry kept in the result.
    fn progress(&mut self, entry: &FileRecord);

    /// Polled between entries; `true` stops the scan early.
    fn terminate(&self) -> bool;
}

/// Opaque handle of a file opened for moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MoveHandle(pub usize);

/// Failure of a single `move_clusters` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveError {
    /// The target clusters are still held by the file system.
    #[error("target clusters are already committed")]
    AlreadyCommitted,
    #[error("move rejected: {0}")]
    Rejected(String),
}

pub trait VolumeIo: Send + Sync {
    fn geometry(&self) -> Result<VolumeGeometry>;

    /// Enumerate free regions. With `allow_partial` a bitmap read error
    /// returns what was read so far instead of failing.
    fn free_regions(&self, allow_partial: bool) -> Result<BitmapScan>;

    /// Enumerate files in `scope`. Entries without clusters (resident
    /// streams) are offered to the filter but never returned.
    fn scan_files(
        &self,
        scope: &ScanScope,
        callbacks: &mut dyn ScanCallbacks,
    ) -> Result<Vec<FileRecord>>;

    /// Open the volume for cluster moves. Sessions nest; the volume stays
    /// open until every `begin_moves` has been matched by `end_moves`.
    fn begin_moves(&self) -> Result<()>;

    fn end_moves(&self);

    fn open_for_move(&self, path: &str) -> Result<MoveHandle>;

    fn close(&self, handle: MoveHandle);

    /// Move `count` clusters of the file starting at `vcn` to `lcn`.
    ///
    /// Only valid inside a `begin_moves` session. Success only means the
    /// call was accepted; callers re-query the extents to learn what
    /// actually happened.
    fn move_clusters(
        &self,
        handle: MoveHandle,
        vcn: u64,
        lcn: u64,
        count: u64,
    ) -> std::result::Result<(), MoveError>;

    /// Current extents of a file, or `None` when they cannot be read.
    fn query_extents(&self, path: &str) -> Option<Vec<Block>>;

    fn flush(&self) -> Result<()>;
}
