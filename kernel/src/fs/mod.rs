//! File-system mount and dispatch
//!
//! Volumes register a [`FileSystem`] object backed by a driver; the
//! dispatcher resolves paths (absolute, `VOLUME:/`-prefixed, or bare
//! probes across every volume), maintains the open-file cache and
//! routes every file operation through the owning driver's command
//! entry point.

pub mod ext2;
pub mod file;
pub mod mbr;
pub mod path;
pub mod xfs;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex as SpinMutex;
use spin::RwLock;

use crate::drivers::disk::{read_sectors, StorageUnit, SECTOR_SIZE};
use crate::drivers::{DriverCommand, DriverFunction, DriverValue, Param};
use crate::error::{KernelError, KernelResult};
use crate::list::{KernelList, ListAnchor, Listed};
use crate::obj::{KernelObject, ObjectHeader, ObjectKind};
use crate::sched;
use crate::sync::{KMutex, INFINITY};

pub use file::{File, FsNode, OpenFlags};
pub use mbr::BootPartition;
pub use path::{decompose_path, split_volume};

/// Longest logical volume name.
pub const MAX_FS_LOGICAL_NAME: usize = 16;

/// One mounted volume.
pub struct FileSystem {
    header: ObjectHeader,
    anchor: ListAnchor,
    pub mutex: KMutex,
    pub driver: Arc<dyn DriverCommand>,
    name: String,
    /// Driver-private volume index.
    pub volume_id: u32,
}

impl FileSystem {
    pub fn new(driver: Arc<dyn DriverCommand>, name: String, volume_id: u32) -> Arc<FileSystem> {
        Arc::new(FileSystem {
            header: ObjectHeader::new(ObjectKind::FileSystem),
            anchor: ListAnchor::new(),
            mutex: KMutex::new(),
            driver,
            name,
            volume_id,
        })
    }

    /// Logical volume name used in `NAME:/path` routing.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Listed for FileSystem {
    fn anchor(&self) -> &ListAnchor {
        &self.anchor
    }
}

impl KernelObject for FileSystem {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

/// Open request handed to an FS driver.
pub struct FileInfo {
    pub file_system: Arc<FileSystem>,
    pub attributes: u32,
    pub flags: OpenFlags,
    pub name: String,
}

/// Read request handed to an FS driver.
pub struct FileOperation<'a> {
    pub file: &'a Arc<File>,
    pub buffer: &'a mut [u8],
}

/// Write request handed to an FS driver.
pub struct FileWriteOperation<'a> {
    pub file: &'a Arc<File>,
    pub buffer: &'a [u8],
}

/// Volume information filled by `FsGetVolumeInfo`.
#[derive(Debug, Clone, Default)]
pub struct VolumeInfo {
    pub name: String,
    pub file_count: u32,
    pub bytes_total: u64,
    pub bytes_free: u64,
}

static FILE_SYSTEMS: SpinMutex<KernelList<FileSystem>> = SpinMutex::new(KernelList::new());
static SYSTEM_FS: RwLock<Option<Arc<FileSystem>>> = RwLock::new(None);

lazy_static! {
    /// Serializes registration and volume resolution.
    static ref FILESYSTEM_MUTEX: KMutex = KMutex::new();
    /// Serializes open and close against the open-file list.
    static ref FILE_MUTEX: KMutex = KMutex::new();
}

/// Register a mounted volume. The first registered volume becomes the
/// system FS serving absolute paths.
pub fn register_filesystem(fs: &Arc<FileSystem>) -> KernelResult<()> {
    FILESYSTEM_MUTEX.lock(INFINITY)?;
    let _ = FILE_SYSTEMS.lock().add_tail(fs.clone());
    {
        let mut system = SYSTEM_FS.write();
        if system.is_none() {
            *system = Some(fs.clone());
        }
    }
    FILESYSTEM_MUTEX.unlock()?;
    log::info!("fs: volume '{}' registered", fs.name());
    Ok(())
}

pub fn filesystem_count() -> usize {
    FILE_SYSTEMS.lock().len()
}

pub fn filesystems() -> Vec<Arc<FileSystem>> {
    FILE_SYSTEMS.lock().iter().cloned().collect()
}

pub fn find_filesystem(name: &str) -> Option<Arc<FileSystem>> {
    FILE_SYSTEMS
        .lock()
        .iter()
        .find(|fs| fs.name() == name)
        .cloned()
}

pub fn system_filesystem() -> Option<Arc<FileSystem>> {
    SYSTEM_FS.read().clone()
}

pub fn set_system_filesystem(fs: &Arc<FileSystem>) {
    *SYSTEM_FS.write() = Some(fs.clone());
}

/// Default logical name for the next mounted volume: 'C', 'D', ...
pub fn default_volume_name() -> String {
    let next = b'C' + filesystem_count() as u8;
    String::from(next as char)
}

fn driver_open(fs: &Arc<FileSystem>, name: &str, flags: OpenFlags) -> Option<Arc<File>> {
    let info = FileInfo {
        file_system: fs.clone(),
        attributes: u32::MAX,
        flags,
        name: String::from(name),
    };
    match fs
        .driver
        .command(DriverFunction::FsOpenFile, &mut Param::FsOpen(&info))
    {
        Ok(DriverValue::File(file)) => Some(file),
        _ => None,
    }
}

/// Open request as callers build it.
pub struct FileOpenInfo<'a> {
    pub name: &'a str,
    pub flags: OpenFlags,
}

/// Open a file.
///
/// The open-file cache is consulted first: a hit on `(name, current
/// task, flags)` bumps the reference count. Otherwise absolute paths go
/// to the system FS, `VOLUME:/` prefixes to the named volume, and bare
/// names are probed against every registered volume in order.
pub fn open_file(info: &FileOpenInfo<'_>) -> KernelResult<Arc<File>> {
    if info.name.is_empty() {
        return Err(KernelError::BadParameter);
    }

    FILESYSTEM_MUTEX.lock(INFINITY)?;

    let result = (|| {
        let owner = sched::current_task().map(|task| task.id());

        FILE_MUTEX.lock(INFINITY)?;
        let cached = file::find_open_file(info.name, owner, info.flags);
        if let Some(file) = &cached {
            file.add_reference();
        }
        FILE_MUTEX.unlock()?;
        if let Some(file) = cached {
            return Ok(file);
        }

        let opened = if info.name.starts_with(path::PATH_SEPARATOR) {
            let system = system_filesystem().ok_or(KernelError::NoDevice)?;
            driver_open(&system, info.name, info.flags)
        } else if let Some((volume, rest)) = split_volume(info.name) {
            let fs = find_filesystem(volume).ok_or(KernelError::NoDevice)?;
            driver_open(&fs, rest, info.flags)
        } else {
            let mut found = None;
            for fs in filesystems() {
                if let Some(file) = driver_open(&fs, info.name, info.flags) {
                    found = Some(file);
                    break;
                }
            }
            found
        };

        let file = opened.ok_or(KernelError::Generic)?;
        file.set_name(info.name);
        file.set_owner_task(owner);
        file.set_open_flags(info.flags);

        FILE_MUTEX.lock(INFINITY)?;
        file::insert_open_file(&file);
        FILE_MUTEX.unlock()?;
        Ok(file)
    })();

    FILESYSTEM_MUTEX.unlock()?;
    result
}

/// Close a file. At the last reference the FS close handler runs and
/// the node leaves the open-file list.
pub fn close_file(file: &Arc<File>) -> KernelResult<()> {
    if !file.header().is_valid(ObjectKind::File) {
        return Err(KernelError::BadParameter);
    }

    file.mutex.lock(INFINITY)?;
    let remaining = file.release_reference();
    file.mutex.unlock()?;

    if remaining == 0 {
        let _ = file
            .file_system
            .driver
            .command(DriverFunction::FsCloseFile, &mut Param::FsFile(file));

        FILE_MUTEX.lock(INFINITY)?;
        file::remove_open_file(file);
        FILE_MUTEX.unlock()?;
    }
    Ok(())
}

/// Read from a file at its current position. Returns bytes transferred.
pub fn read_file(file: &Arc<File>, buffer: &mut [u8]) -> KernelResult<u32> {
    if !file.header().is_valid(ObjectKind::File) {
        return Err(KernelError::BadParameter);
    }
    if !file.open_flags().contains(OpenFlags::READ) {
        return Err(KernelError::NoPermission);
    }

    file.mutex.lock(INFINITY)?;
    let result = file.file_system.driver.command(
        DriverFunction::FsRead,
        &mut Param::FsRead(FileOperation { file, buffer }),
    );
    file.mutex.unlock()?;

    match result? {
        DriverValue::Count(bytes) => Ok(bytes),
        _ => Err(KernelError::Generic),
    }
}

/// Write to a file at its current position. Returns bytes transferred.
pub fn write_file(file: &Arc<File>, buffer: &[u8]) -> KernelResult<u32> {
    if !file.header().is_valid(ObjectKind::File) {
        return Err(KernelError::BadParameter);
    }
    if !file.open_flags().contains(OpenFlags::WRITE) {
        return Err(KernelError::NoPermission);
    }

    file.mutex.lock(INFINITY)?;
    let result = file.file_system.driver.command(
        DriverFunction::FsWrite,
        &mut Param::FsWrite(FileWriteOperation { file, buffer }),
    );
    file.mutex.unlock()?;

    match result? {
        DriverValue::Count(bytes) => Ok(bytes),
        _ => Err(KernelError::Generic),
    }
}

pub fn get_file_size(file: &Arc<File>) -> u64 {
    file.size()
}

pub fn get_file_position(file: &Arc<File>) -> u64 {
    file.position()
}

pub fn set_file_position(file: &Arc<File>, position: u64) -> KernelResult<()> {
    if !file.header().is_valid(ObjectKind::File) {
        return Err(KernelError::BadParameter);
    }
    file.mutex.lock(INFINITY)?;
    file.set_position(position);
    file.mutex.unlock()?;
    Ok(())
}

/// Read a whole file into memory.
pub fn file_read_all(name: &str) -> KernelResult<Vec<u8>> {
    let file = open_file(&FileOpenInfo {
        name,
        flags: OpenFlags::READ,
    })?;
    let size = get_file_size(&file) as usize;
    let mut bytes = alloc::vec![0u8; size];
    let result = read_file(&file, &mut bytes);
    close_file(&file)?;
    let read = result? as usize;
    bytes.truncate(read);
    Ok(bytes)
}

/// Create or truncate a file and write a whole buffer into it.
pub fn file_write_all(name: &str, bytes: &[u8]) -> KernelResult<u32> {
    let file = open_file(&FileOpenInfo {
        name,
        flags: OpenFlags::WRITE | OpenFlags::CREATE_ALWAYS | OpenFlags::TRUNCATE,
    })?;
    let result = write_file(&file, bytes);
    close_file(&file)?;
    result
}

/// Mount dispatch record: one per partition the walk encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountEvent {
    pub kind: u8,
    pub lba: u32,
}

static MOUNT_EVENTS: SpinMutex<Vec<MountEvent>> = SpinMutex::new(Vec::new());

/// Drain the mount dispatch records; diagnostics.
pub fn take_mount_events() -> Vec<MountEvent> {
    core::mem::take(&mut MOUNT_EVENTS.lock())
}

fn mount_fat16(_disk: &Arc<StorageUnit>, partition: &BootPartition, base: u32) -> KernelResult<()> {
    log::info!("fs: FAT16 partition at lba {}", base + partition.lba);
    Err(KernelError::NotImplemented)
}

fn mount_fat32(_disk: &Arc<StorageUnit>, partition: &BootPartition, base: u32) -> KernelResult<()> {
    log::info!("fs: FAT32 partition at lba {}", base + partition.lba);
    Err(KernelError::NotImplemented)
}

fn mount_ntfs(_disk: &Arc<StorageUnit>, partition: &BootPartition, base: u32) -> KernelResult<()> {
    log::info!("fs: NTFS partition at lba {}", base + partition.lba);
    Err(KernelError::NotImplemented)
}

fn mount_extended(
    disk: &Arc<StorageUnit>,
    partition: &BootPartition,
    base: u32,
) -> KernelResult<()> {
    let mut sector = alloc::vec![0u8; SECTOR_SIZE];
    read_sectors(disk, partition.lba as u64, 1, &mut sector)?;
    let table = mbr::parse_partition_table(&sector)?;
    mount_table(disk, &table, base + partition.lba)
}

fn mount_table(
    disk: &Arc<StorageUnit>,
    table: &[BootPartition; mbr::MBR_PARTITION_COUNT],
    base: u32,
) -> KernelResult<()> {
    for partition in table.iter() {
        if partition.lba == 0 {
            continue;
        }
        if partition.kind != mbr::FSID_NONE && !partition.is_extended() {
            MOUNT_EVENTS.lock().push(MountEvent {
                kind: partition.kind,
                lba: base + partition.lba,
            });
        }
        let outcome = match partition.kind {
            mbr::FSID_NONE => Ok(()),
            mbr::FSID_EXTENDED | mbr::FSID_EXTENDED_LBA => mount_extended(disk, partition, base),
            mbr::FSID_DOS_FAT16S | mbr::FSID_DOS_FAT16L => mount_fat16(disk, partition, base),
            mbr::FSID_DOS_FAT32 | mbr::FSID_DOS_FAT32_LBA => mount_fat32(disk, partition, base),
            mbr::FSID_NTFS => mount_ntfs(disk, partition, base),
            mbr::FSID_EXOS => xfs::mount_partition(disk, partition, base),
            mbr::FSID_EXT2 => ext2::mount_partition(disk, partition, base),
            kind => {
                log::debug!("fs: partition type {:#04x} not implemented", kind);
                Ok(())
            }
        };
        if let Err(err) = outcome {
            if err != KernelError::NotImplemented {
                log::warn!(
                    "fs: mounting type {:#04x} at lba {} failed: {}",
                    partition.kind,
                    base + partition.lba,
                    err
                );
            }
        }
    }
    Ok(())
}

/// Walk a disk's partition table, recursing through extended chains,
/// and hand every recognized partition to its mount routine.
pub fn mount_disk_partitions(
    disk: &Arc<StorageUnit>,
    table: Option<&[BootPartition; mbr::MBR_PARTITION_COUNT]>,
    base: u32,
) -> KernelResult<()> {
    match table {
        Some(table) => mount_table(disk, table, base),
        None => {
            let mut sector = alloc::vec![0u8; SECTOR_SIZE];
            read_sectors(disk, 0, 1, &mut sector)?;
            let table = mbr::parse_partition_table(&sector)?;
            mount_table(disk, &table, base)
        }
    }
}

#[doc(hidden)]
pub fn reset_for_tests() {
    FILE_SYSTEMS.lock().reset();
    *SYSTEM_FS.write() = None;
    file::reset_open_files_for_tests();
    MOUNT_EVENTS.lock().clear();
}
