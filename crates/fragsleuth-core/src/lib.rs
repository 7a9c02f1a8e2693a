/// FragSleuth Core: the volume processing engine.
///
/// Everything that analyzes, defragments or optimizes a volume lives here,
/// independent of any front end. The engine talks to the disk only through
/// the [`io::VolumeIo`] trait, so the same code drives a live Windows
/// volume ([`platform::WinVolume`]) or an in-memory [`io::sim::SimVolume`].
///
/// # Modules
///
/// - [`model`]: files, blocks, dispositions and volume geometry.
/// - [`regions`]: the free space index.
/// - [`search`]: lookup of file blocks by cluster position.
/// - [`map`]: the cluster map shown by front ends.
/// - [`io`]: the volume access trait and the simulated volume.
/// - [`engine`]: analysis, the cluster mover, defragmentation and optimization.
/// - [`job`]: job options, progress snapshots and the job controller.
/// - [`report`]: fragmentation report rows and the results summary.
/// - [`platform`]: the Windows back-end.
pub mod engine;
pub mod error;
pub mod io;
pub mod job;
pub mod map;
pub mod model;
#[cfg(windows)]
pub mod platform;
pub mod regions;
pub mod report;
pub mod search;

pub use error::{DefragError, Result};
