/// Windows volume back-end built on the defragmentation ioctls.
///
/// - `FSCTL_GET_VOLUME_BITMAP` for free space.
/// - `FSCTL_GET_RETRIEVAL_POINTERS` for file extents.
/// - `FSCTL_MOVE_FILE` for the cluster-move primitive.
/// - `FSCTL_GET_NTFS_VOLUME_DATA` for the MFT layout.
///
/// Files are enumerated with `jwalk`; extents are queried per entry. The
/// volume device is held open for writing only during a move session;
/// geometry and bitmap reads use handles that close as soon as they are
/// done.
use crate::error::{DefragError, Result};
use crate::io::{BitmapScan, MoveError, MoveHandle, ScanCallbacks, ScanScope, VolumeIo};
use crate::model::{Block, FileAttributes, FileRecord, NtfsLayout, VolumeGeometry};
use crate::regions::FreeRegion;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::os::windows::fs::MetadataExt;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_HANDLE_EOF, ERROR_MORE_DATA, HANDLE, WIN32_ERROR,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, GetDiskFreeSpaceExW, GetDiskFreeSpaceW, GetDriveTypeW,
    GetVolumeInformationW, QueryDosDeviceW, FILE_ATTRIBUTE_COMPRESSED, FILE_ATTRIBUTE_DIRECTORY,
    FILE_ATTRIBUTE_REPARSE_POINT, FILE_ATTRIBUTE_SPARSE_FILE, FILE_ATTRIBUTE_TEMPORARY,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Ioctl::{
    FSCTL_GET_NTFS_VOLUME_DATA, FSCTL_GET_RETRIEVAL_POINTERS, FSCTL_GET_VOLUME_BITMAP,
    FSCTL_IS_VOLUME_DIRTY, FSCTL_MOVE_FILE, GET_LENGTH_INFORMATION, IOCTL_DISK_GET_LENGTH_INFO,
    MOVE_FILE_DATA, NTFS_VOLUME_DATA_BUFFER, STARTING_LCN_INPUT_BUFFER,
    STARTING_VCN_INPUT_BUFFER,
};
use windows::Win32::System::IO::DeviceIoControl;

const GENERIC_READ: u32 = 0x8000_0000;
const GENERIC_WRITE: u32 = 0x4000_0000;
const FILE_READ_ATTRIBUTES: u32 = 0x0080;
const SYNCHRONIZE: u32 = 0x0010_0000;

const DRIVE_REMOTE: u32 = 4;
const DRIVE_CDROM: u32 = 5;

const VOLUME_IS_DIRTY: u32 = 1;

/// Size of the buffers handed to the bitmap and extent ioctls.
const IOCTL_BUFFER_SIZE: usize = 64 * 1024;

/// A kernel handle closed on drop.
struct OwnedHandle(HANDLE);

// SAFETY: kernel handles may be used from any thread; access to the move
// handles is serialized through the `Mutex` in `WinVolume`.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn from_wide(buf: &[u16]) -> String {
    String::from_utf16_lossy(&buf[..buf.iter().position(|&c| c == 0).unwrap_or(buf.len())])
}

/// `\??\C:\dir` → `\\?\C:\dir`, the form `CreateFileW` accepts.
fn win32_path(native: &str) -> String {
    match native.strip_prefix(r"\??\") {
        Some(rest) => format!(r"\\?\{rest}"),
        None => native.to_string(),
    }
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(bytes)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn is_win32_error(e: &windows::core::Error, code: WIN32_ERROR) -> bool {
    e.code() == code.to_hresult()
}

/// Issue an ioctl with an input struct and a byte output buffer.
/// Returns the number of bytes written and whether more data is pending.
fn ioctl_into<T>(
    handle: HANDLE,
    code: u32,
    input: &T,
    output: &mut [u8],
) -> windows::core::Result<(usize, bool)> {
    let mut returned = 0u32;
    let result = unsafe {
        DeviceIoControl(
            handle,
            code,
            Some(input as *const T as *const c_void),
            std::mem::size_of::<T>() as u32,
            Some(output.as_mut_ptr() as *mut c_void),
            output.len() as u32,
            Some(&mut returned),
            None,
        )
    };
    match result {
        Ok(()) => Ok((returned as usize, false)),
        Err(e) if is_win32_error(&e, ERROR_MORE_DATA) => Ok((returned as usize, true)),
        Err(e) => Err(e),
    }
}

/// Volume handle shared by nested move sessions.
#[derive(Default)]
struct MoveSessionState {
    depth: usize,
    volume: Option<OwnedHandle>,
}

/// A mounted volume prepared for analysis and defragmentation.
pub struct WinVolume {
    letter: char,
    session: Mutex<MoveSessionState>,
    files: Mutex<HashMap<usize, OwnedHandle>>,
    next_handle: Mutex<usize>,
}

impl WinVolume {
    /// Check that `letter:` can be processed. CD-ROM, network and `subst`
    /// drives are refused, as is a volume that cannot be opened for writing.
    pub fn open(letter: char) -> Result<Self> {
        let letter = letter.to_ascii_uppercase();
        let root = wide(&format!("{letter}:\\"));
        match unsafe { GetDriveTypeW(PCWSTR(root.as_ptr())) } {
            DRIVE_CDROM => return Err(DefragError::CdRom),
            DRIVE_REMOTE => return Err(DefragError::Remote),
            _ => {}
        }

        let device = wide(&format!("{letter}:"));
        let mut target = [0u16; 512];
        let len = unsafe { QueryDosDeviceW(PCWSTR(device.as_ptr()), Some(&mut target)) };
        if len > 0 && from_wide(&target).starts_with(r"\??\") {
            return Err(DefragError::Subst);
        }

        drop(open_device(letter, GENERIC_READ | GENERIC_WRITE)?);
        info!("volume {letter}: is accessible");

        Ok(Self {
            letter,
            session: Mutex::new(MoveSessionState::default()),
            files: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
        })
    }

    fn root(&self) -> String {
        format!("{}:\\", self.letter)
    }

    fn open_file(&self, native: &str, access: u32) -> windows::core::Result<OwnedHandle> {
        let path = wide(&win32_path(native));
        let handle = unsafe {
            CreateFileW(
                PCWSTR(path.as_ptr()),
                access,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                None,
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS,
                None,
            )
        }?;
        Ok(OwnedHandle(handle))
    }

    fn ntfs_layout(volume: &OwnedHandle) -> Option<NtfsLayout> {
        let mut data: NTFS_VOLUME_DATA_BUFFER = unsafe { std::mem::zeroed() };
        let mut returned = 0u32;
        let ok = unsafe {
            DeviceIoControl(
                volume.0,
                FSCTL_GET_NTFS_VOLUME_DATA,
                None,
                0,
                Some(&mut data as *mut NTFS_VOLUME_DATA_BUFFER as *mut c_void),
                std::mem::size_of::<NTFS_VOLUME_DATA_BUFFER>() as u32,
                Some(&mut returned),
                None,
            )
        };
        ok.ok()?;
        Some(NtfsLayout {
            mft_start_lcn: data.MftStartLcn as u64,
            mft_valid_data_length: data.MftValidDataLength as u64,
            mft_zone_start: data.MftZoneStart as u64,
            mft_zone_end: data.MftZoneEnd as u64,
            mft_mirror_lcn: data.Mft2StartLcn as u64,
            bytes_per_file_record_segment: data.BytesPerFileRecordSegment as u64,
        })
    }

    fn is_dirty(volume: &OwnedHandle) -> bool {
        let mut flags = 0u32;
        let mut returned = 0u32;
        let ok = unsafe {
            DeviceIoControl(
                volume.0,
                FSCTL_IS_VOLUME_DIRTY,
                None,
                0,
                Some(&mut flags as *mut u32 as *mut c_void),
                std::mem::size_of::<u32>() as u32,
                Some(&mut returned),
                None,
            )
        };
        ok.is_ok() && flags & VOLUME_IS_DIRTY != 0
    }

    fn device_capacity(volume: &OwnedHandle) -> Option<u64> {
        let mut info = GET_LENGTH_INFORMATION::default();
        let mut returned = 0u32;
        let ok = unsafe {
            DeviceIoControl(
                volume.0,
                IOCTL_DISK_GET_LENGTH_INFO,
                None,
                0,
                Some(&mut info as *mut GET_LENGTH_INFORMATION as *mut c_void),
                std::mem::size_of::<GET_LENGTH_INFORMATION>() as u32,
                Some(&mut returned),
                None,
            )
        };
        ok.ok().map(|()| info.Length as u64)
    }

    fn attributes(metadata: &std::fs::Metadata) -> FileAttributes {
        let raw = metadata.file_attributes();
        let mut attrs = FileAttributes::empty();
        for (bit, attr) in [
            (FILE_ATTRIBUTE_DIRECTORY, FileAttributes::DIRECTORY),
            (FILE_ATTRIBUTE_COMPRESSED, FileAttributes::COMPRESSED),
            (FILE_ATTRIBUTE_SPARSE_FILE, FileAttributes::SPARSE),
            (FILE_ATTRIBUTE_REPARSE_POINT, FileAttributes::REPARSE_POINT),
            (FILE_ATTRIBUTE_TEMPORARY, FileAttributes::TEMPORARY),
        ] {
            if raw & bit.0 != 0 {
                attrs.insert(attr);
            }
        }
        attrs
    }
}

/// Open the volume device `\\.\X:`.
fn open_device(letter: char, access: u32) -> Result<OwnedHandle> {
    let path = wide(&format!(r"\\.\{letter}:"));
    let handle = unsafe {
        CreateFileW(
            PCWSTR(path.as_ptr()),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            None,
            OPEN_EXISTING,
            Default::default(),
            None,
        )
    }
    .map_err(|e| DefragError::Volume(format!("cannot open volume {letter}: {e}")))?;
    Ok(OwnedHandle(handle))
}

/// Free runs encoded in one chunk of the volume bitmap.
fn parse_bitmap(buf: &[u8], start_lcn: u64, clusters: u64, regions: &mut Vec<FreeRegion>) {
    let mut run_start: Option<u64> = None;
    for i in 0..clusters {
        let byte = buf[(i / 8) as usize];
        let used = byte & (1 << (i % 8)) != 0;
        let lcn = start_lcn + i;
        match (used, run_start) {
            (false, None) => run_start = Some(lcn),
            (true, Some(start)) => {
                push_region(regions, start, lcn - start);
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        push_region(regions, start, start_lcn + clusters - start);
    }
}

/// Append a region, merging it with the previous one across chunk borders.
fn push_region(regions: &mut Vec<FreeRegion>, lcn: u64, length: u64) {
    if let Some(last) = regions.last_mut() {
        if last.end() == lcn {
            last.length += length;
            return;
        }
    }
    regions.push(FreeRegion::new(lcn, length));
}

impl VolumeIo for WinVolume {
    fn geometry(&self) -> Result<VolumeGeometry> {
        let root = wide(&self.root());
        let root = PCWSTR(root.as_ptr());

        let (mut spc, mut bps, mut free_clusters, mut total_clusters) = (0u32, 0u32, 0u32, 0u32);
        unsafe {
            GetDiskFreeSpaceW(
                root,
                Some(&mut spc as *mut u32),
                Some(&mut bps as *mut u32),
                Some(&mut free_clusters as *mut u32),
                Some(&mut total_clusters as *mut u32),
            )
        }
        .map_err(|e| DefragError::Volume(format!("cannot get geometry of {}: {e}", self.letter)))?;

        let (mut free_caller, mut total_bytes, mut free_bytes) = (0u64, 0u64, 0u64);
        unsafe {
            GetDiskFreeSpaceExW(
                root,
                Some(&mut free_caller as *mut u64),
                Some(&mut total_bytes as *mut u64),
                Some(&mut free_bytes as *mut u64),
            )
        }
        .map_err(|e| DefragError::Volume(format!("cannot get free space of {}: {e}", self.letter)))?;

        let mut fs_buf = [0u16; 256];
        unsafe { GetVolumeInformationW(root, None, None, None, None, Some(&mut fs_buf)) }
            .map_err(|e| DefragError::Volume(format!("cannot get file system of {}: {e}", self.letter)))?;
        let fs_name = from_wide(&fs_buf);

        let bytes_per_cluster = spc as u64 * bps as u64;
        // GetDiskFreeSpaceW saturates on huge volumes
        let total_clusters = if bytes_per_cluster > 0 {
            (total_bytes / bytes_per_cluster).max(total_clusters as u64)
        } else {
            total_clusters as u64
        };
        let volume = open_device(self.letter, GENERIC_READ)?;
        let ntfs = if fs_name.eq_ignore_ascii_case("NTFS") {
            Self::ntfs_layout(&volume)
        } else {
            None
        };

        Ok(VolumeGeometry {
            total_clusters,
            bytes_per_cluster,
            device_capacity: Self::device_capacity(&volume).unwrap_or(total_bytes),
            total_bytes,
            free_bytes,
            fs_name,
            is_dirty: Self::is_dirty(&volume),
            ntfs,
        })
    }

    fn free_regions(&self, allow_partial: bool) -> Result<BitmapScan> {
        let volume = open_device(self.letter, GENERIC_READ)?;
        let mut regions = Vec::new();
        let mut buf = vec![0u8; IOCTL_BUFFER_SIZE];
        let mut next_lcn = 0i64;
        loop {
            let input = STARTING_LCN_INPUT_BUFFER { StartingLcn: next_lcn };
            match ioctl_into(volume.0, FSCTL_GET_VOLUME_BITMAP, &input, &mut buf) {
                Ok((returned, more)) => {
                    if returned < 16 {
                        break;
                    }
                    let start = read_i64(&buf, 0) as u64;
                    let size = read_i64(&buf, 8) as u64;
                    let available = ((returned - 16) * 8) as u64;
                    let clusters = size.min(available);
                    parse_bitmap(&buf[16..returned], start, clusters, &mut regions);
                    if !more || clusters == 0 {
                        break;
                    }
                    next_lcn = (start + clusters) as i64;
                }
                Err(e) if allow_partial && !regions.is_empty() => {
                    warn!("volume bitmap read stopped at lcn {next_lcn}: {e}");
                    return Ok(BitmapScan {
                        regions,
                        partial: true,
                    });
                }
                Err(e) => {
                    return Err(DefragError::Volume(format!("cannot read volume bitmap: {e}")));
                }
            }
        }
        Ok(BitmapScan {
            regions,
            partial: false,
        })
    }

    fn scan_files(
        &self,
        scope: &ScanScope,
        callbacks: &mut dyn ScanCallbacks,
    ) -> Result<Vec<FileRecord>> {
        let (root, recursive) = match scope {
            ScanScope::Volume => (PathBuf::from(self.root()), true),
            ScanScope::Directory { path, recursive } => (
                PathBuf::from(path.strip_prefix(r"\??\").unwrap_or(path)),
                *recursive,
            ),
        };

        let mut walker = jwalk::WalkDir::new(&root)
            .skip_hidden(false)
            .follow_links(false)
            .parallelism(jwalk::Parallelism::RayonNewPool(num_cpus::get()));
        if !recursive {
            walker = walker.max_depth(1);
        }

        let mut files = Vec::new();
        let mut skipped_dirs: Vec<PathBuf> = Vec::new();
        let mut errors = 0u64;

        // system files do not show up in directory listings
        if *scope == ScanScope::Volume {
            let mft = format!(r"\??\{}:\$Mft", self.letter);
            if let Some(blocks) = self.query_extents(&mft) {
                let mut record = FileRecord::new(mft.as_str(), "$Mft", FileAttributes::empty(), blocks);
                callbacks.filter(&mut record);
                if record.disposition.clusters > 0 {
                    callbacks.progress(&record);
                    files.push(record);
                }
            }
        }

        for entry in walker {
            if callbacks.terminate() {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    errors += 1;
                    debug!("cannot read directory entry: {e}");
                    continue;
                }
            };
            let path = entry.path();
            if path == root || skipped_dirs.iter().any(|dir| path.starts_with(dir)) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                errors += 1;
                continue;
            };

            let native = format!(r"\??\{}", path.display());
            let name = entry.file_name().to_string_lossy().to_string();
            let blocks = self.query_extents(&native).unwrap_or_default();
            let mut record = FileRecord::new(native.as_str(), name.as_str(), Self::attributes(&metadata), blocks);
            if callbacks.filter(&mut record) && record.is_dir() {
                skipped_dirs.push(path.clone());
            }
            if record.disposition.clusters == 0 {
                continue;
            }
            callbacks.progress(&record);
            files.push(record);
        }

        if errors > 0 {
            warn!("{errors} entries could not be read");
        }
        Ok(files)
    }

    fn begin_moves(&self) -> Result<()> {
        let mut session = self.session.lock();
        if session.depth == 0 {
            session.volume = Some(open_device(self.letter, GENERIC_READ | GENERIC_WRITE)?);
            debug!("volume {}: opened for moves", self.letter);
        }
        session.depth += 1;
        Ok(())
    }

    fn end_moves(&self) {
        let mut session = self.session.lock();
        session.depth = session.depth.saturating_sub(1);
        if session.depth == 0 && session.volume.take().is_some() {
            debug!("volume {}: closed", self.letter);
        }
    }

    fn open_for_move(&self, path: &str) -> Result<MoveHandle> {
        let handle = self
            .open_file(path, FILE_READ_ATTRIBUTES | SYNCHRONIZE)
            .map_err(|e| DefragError::Unmovable(format!("{path}: {e}")))?;
        let mut next = self.next_handle.lock();
        let id = *next;
        *next += 1;
        self.files.lock().insert(id, handle);
        Ok(MoveHandle(id))
    }

    fn close(&self, handle: MoveHandle) {
        self.files.lock().remove(&handle.0);
    }

    fn move_clusters(
        &self,
        handle: MoveHandle,
        vcn: u64,
        lcn: u64,
        count: u64,
    ) -> std::result::Result<(), MoveError> {
        let session = self.session.lock();
        let volume = session
            .volume
            .as_ref()
            .ok_or_else(|| MoveError::Rejected("volume is not open for moves".into()))?;
        let files = self.files.lock();
        let file = files
            .get(&handle.0)
            .ok_or_else(|| MoveError::Rejected("invalid handle".into()))?;
        let count = u32::try_from(count)
            .map_err(|_| MoveError::Rejected(format!("cluster count {count} is too large")))?;
        let data = MOVE_FILE_DATA {
            FileHandle: file.0,
            StartingVcn: vcn as i64,
            StartingLcn: lcn as i64,
            ClusterCount: count,
        };
        let mut returned = 0u32;
        let result = unsafe {
            DeviceIoControl(
                volume.0,
                FSCTL_MOVE_FILE,
                Some(&data as *const MOVE_FILE_DATA as *const c_void),
                std::mem::size_of::<MOVE_FILE_DATA>() as u32,
                None,
                0,
                Some(&mut returned),
                None,
            )
        };
        match result {
            Ok(()) => Ok(()),
            // STATUS_ALREADY_COMMITTED surfaces as access denied
            Err(e) if is_win32_error(&e, ERROR_ACCESS_DENIED) => Err(MoveError::AlreadyCommitted),
            Err(e) => Err(MoveError::Rejected(e.to_string())),
        }
    }

    fn query_extents(&self, path: &str) -> Option<Vec<Block>> {
        let file = self.open_file(path, FILE_READ_ATTRIBUTES | SYNCHRONIZE).ok()?;
        let mut blocks = Vec::new();
        let mut buf = vec![0u8; IOCTL_BUFFER_SIZE];
        let mut next_vcn = 0i64;
        loop {
            let input = STARTING_VCN_INPUT_BUFFER { StartingVcn: next_vcn };
            let (returned, more) = match ioctl_into(file.0, FSCTL_GET_RETRIEVAL_POINTERS, &input, &mut buf) {
                Ok(r) => r,
                // resident data has no extents
                Err(e) if is_win32_error(&e, ERROR_HANDLE_EOF) => return Some(blocks),
                Err(e) => {
                    debug!("cannot query extents of {path}: {e}");
                    return None;
                }
            };
            if returned < 16 {
                break;
            }
            let count = read_u32(&buf, 0) as usize;
            let mut vcn = read_i64(&buf, 8);
            for i in 0..count {
                let at = 16 + i * 16;
                if at + 16 > returned {
                    break;
                }
                let end_vcn = read_i64(&buf, at);
                let lcn = read_i64(&buf, at + 8);
                // lcn -1 marks a sparse or compressed-away run
                if lcn >= 0 && end_vcn > vcn {
                    blocks.push(Block::new(vcn as u64, lcn as u64, (end_vcn - vcn) as u64));
                }
                vcn = end_vcn;
            }
            if !more || count == 0 {
                break;
            }
            next_vcn = vcn;
        }
        Some(blocks)
    }

    fn flush(&self) -> Result<()> {
        let volume = open_device(self.letter, GENERIC_READ | GENERIC_WRITE)?;
        unsafe { FlushFileBuffers(volume.0) }
            .map_err(|e| DefragError::Volume(format!("cannot flush volume {}: {e}", self.letter)))
    }
}
