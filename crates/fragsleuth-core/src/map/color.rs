/// Space colours of the cluster map and the per-file colour rule.
use crate::model::{FileRecord, Volume};
use serde::{Deserialize, Serialize};

/// Colour of a map cell. Later variants take precedence when a cell holds
/// equal counts of several colours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum SpaceColor {
    Unused = 0,
    Free,
    System,
    SystemOverLimit,
    Fragmented,
    FragmentedOverLimit,
    Unfragmented,
    UnfragmentedOverLimit,
    Directory,
    DirectoryOverLimit,
    Compressed,
    CompressedOverLimit,
    /// Reserved space after the MFT. Painting it never removes other colours.
    MftZone,
    Mft,
}

impl SpaceColor {
    pub const COUNT: usize = 14;

    /// Colour of cells nothing else has claimed.
    pub const DEFAULT: SpaceColor = SpaceColor::System;

    pub const ALL: [SpaceColor; Self::COUNT] = [
        SpaceColor::Unused,
        SpaceColor::Free,
        SpaceColor::System,
        SpaceColor::SystemOverLimit,
        SpaceColor::Fragmented,
        SpaceColor::FragmentedOverLimit,
        SpaceColor::Unfragmented,
        SpaceColor::UnfragmentedOverLimit,
        SpaceColor::Directory,
        SpaceColor::DirectoryOverLimit,
        SpaceColor::Compressed,
        SpaceColor::CompressedOverLimit,
        SpaceColor::MftZone,
        SpaceColor::Mft,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn from_index(index: usize) -> SpaceColor {
        Self::ALL[index.min(Self::COUNT - 1)]
    }

    /// Single-character glyph used by the console map.
    pub fn glyph(self) -> char {
        match self {
            SpaceColor::Unused => ' ',
            SpaceColor::Free => '.',
            SpaceColor::System | SpaceColor::SystemOverLimit => 's',
            SpaceColor::Fragmented | SpaceColor::FragmentedOverLimit => 'F',
            SpaceColor::Unfragmented | SpaceColor::UnfragmentedOverLimit => 'u',
            SpaceColor::Directory | SpaceColor::DirectoryOverLimit => 'd',
            SpaceColor::Compressed | SpaceColor::CompressedOverLimit => 'c',
            SpaceColor::MftZone => 'z',
            SpaceColor::Mft => 'M',
        }
    }
}

/// `true` for the NTFS `$Mft` file itself (`\??\X:\$Mft`).
pub fn is_mft(volume: &Volume, file: &FileRecord) -> bool {
    volume.is_ntfs()
        && file.path.chars().count() == 11
        && file.name.to_ascii_lowercase().contains("$mft")
}

/// Colour a file is painted with in its current state.
///
/// Excluded fragmented files are shown as not fragmented.
pub fn file_color(volume: &Volume, file: &FileRecord) -> SpaceColor {
    let over = file.is_over_limit();
    let pick = |normal, over_limit| if over { over_limit } else { normal };

    if is_mft(volume, file) {
        SpaceColor::Mft
    } else if file.is_locked() {
        pick(SpaceColor::System, SpaceColor::SystemOverLimit)
    } else if file.is_fragmented() && !file.is_excluded() {
        pick(SpaceColor::Fragmented, SpaceColor::FragmentedOverLimit)
    } else if file.is_dir() {
        pick(SpaceColor::Directory, SpaceColor::DirectoryOverLimit)
    } else if file.is_compressed() {
        pick(SpaceColor::Compressed, SpaceColor::CompressedOverLimit)
    } else {
        pick(SpaceColor::Unfragmented, SpaceColor::UnfragmentedOverLimit)
    }
}
