/// Windows back-end: the live [`VolumeIo`](crate::io::VolumeIo)
/// implementation and the elevation check the front end runs before
/// touching a volume.
pub mod permissions;
pub mod volume;

pub use permissions::is_elevated;
pub use volume::WinVolume;
