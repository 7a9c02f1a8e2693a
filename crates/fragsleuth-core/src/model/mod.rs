/// Data model for the volume processing engine.
///
/// Re-exports the file catalog, extent maps, volume geometry and size
/// helpers.
pub mod catalog;
pub mod file_record;
pub mod size;
pub mod volume;

pub use catalog::FileCatalog;
pub use file_record::{Block, Disposition, FileAttributes, FileFlags, FileId, FileRecord};
pub use volume::{FsKind, NtfsLayout, Volume, VolumeGeometry};
