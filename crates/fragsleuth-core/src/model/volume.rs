/// Volume geometry and file-system recognition.
///
/// A `Volume` is refreshed once per analysis from the geometry the
/// volume I/O layer reports.
use serde::{Deserialize, Serialize};

/// Recognised file-system kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FsKind {
    Ntfs,
    Fat12,
    Fat16,
    Fat32,
    ExFat,
    Udf,
    #[default]
    Unknown,
}

impl FsKind {
    /// Recognise a file-system name reported by the volume (case-insensitive).
    ///
    /// Plain `FAT` is treated as FAT16.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "NTFS" => FsKind::Ntfs,
            "FAT12" => FsKind::Fat12,
            "FAT" | "FAT16" => FsKind::Fat16,
            "FAT32" => FsKind::Fat32,
            "EXFAT" => FsKind::ExFat,
            "UDF" => FsKind::Udf,
            _ => FsKind::Unknown,
        }
    }

    /// FAT-family volumes cannot move the first cluster of a directory.
    pub fn is_fat(self) -> bool {
        matches!(
            self,
            FsKind::Fat12 | FsKind::Fat16 | FsKind::Fat32 | FsKind::ExFat
        )
    }
}

/// NTFS-specific layout reported by `FSCTL_GET_NTFS_VOLUME_DATA`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NtfsLayout {
    pub mft_start_lcn: u64,
    pub mft_valid_data_length: u64,
    pub mft_zone_start: u64,
    pub mft_zone_end: u64,
    pub mft_mirror_lcn: u64,
    pub bytes_per_file_record_segment: u64,
}

/// Geometry as reported by the volume I/O layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeGeometry {
    pub total_clusters: u64,
    pub bytes_per_cluster: u64,
    pub device_capacity: u64,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub fs_name: String,
    pub is_dirty: bool,
    pub ntfs: Option<NtfsLayout>,
}

/// The volume being processed.
#[derive(Debug, Clone, Default)]
pub struct Volume {
    pub letter: char,
    pub total_clusters: u64,
    pub bytes_per_cluster: u64,
    pub device_capacity: u64,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub fs: FsKind,
    pub fs_name: String,
    pub is_fat: bool,
    pub is_dirty: bool,
    pub ntfs: Option<NtfsLayout>,
    /// Maximum number of clusters handed to one move call.
    pub clusters_at_once: u64,
}

impl Volume {
    pub fn from_geometry(letter: char, geometry: VolumeGeometry) -> Self {
        let fs = FsKind::from_name(&geometry.fs_name);
        let clusters_at_once = if geometry.bytes_per_cluster == 0 {
            1
        } else {
            clusters_at_once(geometry.device_capacity, geometry.bytes_per_cluster)
        };
        Self {
            letter: letter.to_ascii_uppercase(),
            total_clusters: geometry.total_clusters,
            bytes_per_cluster: geometry.bytes_per_cluster,
            device_capacity: geometry.device_capacity,
            total_bytes: geometry.total_bytes,
            free_bytes: geometry.free_bytes,
            fs,
            fs_name: geometry.fs_name,
            is_fat: fs.is_fat(),
            is_dirty: geometry.is_dirty,
            ntfs: if fs == FsKind::Ntfs { geometry.ntfs } else { None },
            clusters_at_once,
        }
    }

    #[inline]
    pub fn is_ntfs(&self) -> bool {
        self.fs == FsKind::Ntfs
    }

    /// `\??\X:\$Mft`
    pub fn mft_path(&self) -> String {
        format!(r"\??\{}:\$Mft", self.letter)
    }
}

/// How many clusters may be moved by one call so that a cancellation
/// request is honoured within about half a second.
pub fn clusters_at_once(device_capacity: u64, bytes_per_cluster: u64) -> u64 {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    let bytes_at_once = if device_capacity < 20 * GIB {
        256 * KIB
    } else if device_capacity < 100 * GIB {
        4 * MIB
    } else if device_capacity < 250 * GIB {
        8 * MIB
    } else if device_capacity < TIB {
        16 * MIB
    } else if device_capacity < 2 * TIB {
        32 * MIB
    } else {
        64 * MIB
    };
    (bytes_at_once / bytes_per_cluster.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_names() {
        assert_eq!(FsKind::from_name("ntfs"), FsKind::Ntfs);
        assert_eq!(FsKind::from_name("FAT"), FsKind::Fat16);
        assert_eq!(FsKind::from_name("exFAT"), FsKind::ExFat);
        assert_eq!(FsKind::from_name("ReFS"), FsKind::Unknown);
        assert!(FsKind::ExFat.is_fat());
        assert!(!FsKind::Udf.is_fat());
    }

    #[test]
    fn test_clusters_at_once() {
        const GIB: u64 = 1 << 30;
        assert_eq!(clusters_at_once(10 * GIB, 4096), 64);
        assert_eq!(clusters_at_once(50 * GIB, 4096), 1024);
        assert_eq!(clusters_at_once(3 * 1024 * GIB, 4096), 16_384);
        assert_eq!(clusters_at_once(GIB, 1 << 20), 1);
    }

    #[test]
    fn test_ntfs_layout_dropped_for_fat() {
        let geometry = VolumeGeometry {
            total_clusters: 100,
            bytes_per_cluster: 512,
            fs_name: "FAT32".into(),
            ntfs: Some(NtfsLayout::default()),
            ..Default::default()
        };
        let vol = Volume::from_geometry('c', geometry);
        assert_eq!(vol.letter, 'C');
        assert!(vol.is_fat);
        assert!(vol.ntfs.is_none());
    }
}
