/// Error taxonomy for the volume processing engine.
///
/// Every variant maps onto a stable numeric code so that front ends can
/// look up a human readable description with [`describe_error`] without
/// holding on to the error value itself. Per-file move failures
/// (`Unmovable`, `MoveFailed`, `PartialMove`, `ImproperState`) are caught
/// by the pass routines and never abort a job; the remaining variants do.
use thiserror::Error;

pub const UNKNOWN_ERROR: i32 = -1;
pub const W2K_4KB_CLUSTERS: i32 = -3;
pub const NO_MEMORY: i32 = -4;
pub const CDROM: i32 = -5;
pub const REMOTE: i32 = -6;
pub const ASSIGNED_BY_SUBST: i32 = -7;
pub const REMOVABLE: i32 = -8;
pub const UDF_DEFRAG: i32 = -9;
pub const DIRTY_VOLUME: i32 = -12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefragError {
    #[error("unknown error")]
    Unknown,

    #[error("not enough memory")]
    NoMemory,

    #[error("CD-ROM drives cannot be processed")]
    CdRom,

    #[error("remote drives cannot be processed")]
    Remote,

    #[error("drives assigned by subst cannot be processed")]
    Subst,

    #[error("removable drive")]
    Removable,

    #[error("UDF volumes can neither be defragmented nor optimized")]
    UdfDefrag,

    #[error("volume is dirty, run CHKDSK to repair it")]
    DirtyVolume,

    #[error("volume reports zero clusters or a zero cluster size")]
    BadGeometry,

    #[error("volume error: {0}")]
    Volume(String),

    #[error("cannot move {0}")]
    Unmovable(String),

    #[error("move failed for {0}")]
    MoveFailed(String),

    #[error("{0} was moved only partially")]
    PartialMove(String),

    #[error("{0} is in an improper state")]
    ImproperState(String),

    #[error("job cancelled")]
    Cancelled,
}

impl DefragError {
    /// Stable numeric code. Variants without a dedicated code map onto
    /// [`UNKNOWN_ERROR`].
    pub fn code(&self) -> i32 {
        match self {
            DefragError::NoMemory => NO_MEMORY,
            DefragError::CdRom => CDROM,
            DefragError::Remote => REMOTE,
            DefragError::Subst => ASSIGNED_BY_SUBST,
            DefragError::Removable => REMOVABLE,
            DefragError::UdfDefrag => UDF_DEFRAG,
            DefragError::DirtyVolume => DIRTY_VOLUME,
            _ => UNKNOWN_ERROR,
        }
    }

    /// `true` for errors that concern a single file rather than the volume.
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            DefragError::Unmovable(_)
                | DefragError::MoveFailed(_)
                | DefragError::PartialMove(_)
                | DefragError::ImproperState(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DefragError>;

/// Human readable description of an error code.
///
/// Unrecognised codes (including success values) yield an empty string.
pub fn describe_error(code: i32) -> &'static str {
    match code {
        UNKNOWN_ERROR => {
            "Some unknown internal bug or some\n\
             rarely arising error has been encountered."
        }
        NO_MEMORY => "Not enough memory.",
        CDROM => "It is impossible to defragment CDROM drives.",
        REMOTE => "It is impossible to defragment remote disks.",
        ASSIGNED_BY_SUBST => {
            "It is impossible to defragment disks\n\
             assigned by the 'subst' command."
        }
        REMOVABLE => {
            "You are trying to defragment a removable disk.\n\
             If the disk type was wrongly identified, send\n\
             a bug report to the author, thanks."
        }
        UDF_DEFRAG => {
            "UDF disks can neither be defragmented nor optimized,\n\
             because the file system driver does not support FSCTL_MOVE_FILE."
        }
        DIRTY_VOLUME => "Disk is dirty, run CHKDSK to repair it.",
        _ => "",
    }
}
