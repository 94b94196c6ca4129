//! Minimal in-memory filesystem
//!
//! Not a real on-disk ext2 layout: each volume is a growable table of
//! in-memory file records. Open always creates a missing file unless the
//! caller demanded an existing one; record storage grows by doubling
//! from a one-kilobyte block. Useful as a scratch volume and as the
//! simplest complete example of the FS command contract.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::drivers::disk::StorageUnit;
use crate::drivers::{
    DriverCommand, DriverDescriptor, DriverFunction, DriverKind, DriverResult, DriverValue, Param,
};
use crate::error::{KernelError, KernelResult};

use super::file::{File, FsNode, OpenFlags};
use super::mbr::BootPartition;
use super::{FileInfo, FileOperation, FileSystem, FileWriteOperation};

const VER_MAJOR: u32 = 0;
const VER_MINOR: u32 = 1;

const DEFAULT_BLOCK_SIZE: usize = 1024;

struct FileRecord {
    name: String,
    attributes: u32,
    size: usize,
    data: Vec<u8>,
}

impl FileRecord {
    /// Grow backing storage by doubling until `required` fits.
    fn ensure_capacity(&mut self, required: usize) {
        if required <= self.data.len() {
            return;
        }
        let mut capacity = if self.data.is_empty() {
            DEFAULT_BLOCK_SIZE
        } else {
            self.data.len()
        };
        while capacity < required {
            capacity *= 2;
        }
        self.data.resize(capacity, 0);
    }
}

struct Volume {
    records: Vec<FileRecord>,
}

/// The in-memory FS driver; one instance serves every volume.
pub struct Ext2Driver {
    descriptor: DriverDescriptor,
    volumes: Mutex<Vec<Volume>>,
}

static DRIVER: Once<Arc<Ext2Driver>> = Once::new();

pub fn driver() -> Arc<Ext2Driver> {
    DRIVER
        .call_once(|| {
            Arc::new(Ext2Driver {
                descriptor: DriverDescriptor::new(
                    DriverKind::FileSystem,
                    VER_MAJOR,
                    VER_MINOR,
                    "EXOS",
                    "EXOS",
                    "Minimal EXT2",
                    &[],
                ),
                volumes: Mutex::new(Vec::new()),
            })
        })
        .clone()
}

fn normalize(name: &str) -> &str {
    name.trim_start_matches(super::path::PATH_SEPARATOR)
}

impl Ext2Driver {
    fn new_volume(self: &Arc<Self>, name: String) -> KernelResult<Arc<FileSystem>> {
        let volume_id = {
            let mut volumes = self.volumes.lock();
            volumes.push(Volume {
                records: Vec::new(),
            });
            (volumes.len() - 1) as u32
        };
        let fs = FileSystem::new(self.clone(), name, volume_id);
        super::register_filesystem(&fs)?;
        Ok(fs)
    }

    fn open(&self, info: &FileInfo) -> DriverResult {
        let name = normalize(&info.name);
        if name.is_empty() {
            return Err(KernelError::BadParameter);
        }

        let mut volumes = self.volumes.lock();
        let volume = volumes
            .get_mut(info.file_system.volume_id as usize)
            .ok_or(KernelError::NoDevice)?;

        let index = match volume.records.iter().position(|r| r.name == name) {
            Some(index) => index,
            None => {
                if info.flags.contains(OpenFlags::EXISTING) {
                    return Err(KernelError::Generic);
                }
                volume.records.push(FileRecord {
                    name: String::from(name),
                    attributes: 0,
                    size: 0,
                    data: Vec::new(),
                });
                volume.records.len() - 1
            }
        };

        let record = &mut volume.records[index];
        if info.flags.contains(OpenFlags::TRUNCATE) {
            record.size = 0;
            record.data.fill(0);
        }

        let file = File::new(
            info.file_system.clone(),
            &info.name,
            FsNode::Ext2 { record: index },
        );
        file.set_attributes(record.attributes);
        file.set_size(record.size as u64);
        if info.flags.contains(OpenFlags::APPEND) {
            file.set_position(record.size as u64);
        }
        Ok(DriverValue::File(file))
    }

    fn record_index(file: &Arc<File>) -> KernelResult<usize> {
        match &*file.node.lock() {
            FsNode::Ext2 { record } => Ok(*record),
            _ => Err(KernelError::BadParameter),
        }
    }

    fn read(&self, operation: &mut FileOperation<'_>) -> DriverResult {
        let index = Self::record_index(operation.file)?;
        let volumes = self.volumes.lock();
        let volume = volumes
            .get(operation.file.file_system.volume_id as usize)
            .ok_or(KernelError::NoDevice)?;
        let record = volume.records.get(index).ok_or(KernelError::Generic)?;

        let position = operation.file.position() as usize;
        if position >= record.size {
            return Ok(DriverValue::Count(0));
        }
        let available = record.size - position;
        let count = available.min(operation.buffer.len());
        operation.buffer[..count].copy_from_slice(&record.data[position..position + count]);

        operation.file.set_position((position + count) as u64);
        operation
            .file
            .touch_accessed(crate::time::system_time_ms());
        Ok(DriverValue::Count(count as u32))
    }

    fn write(&self, operation: &mut FileWriteOperation<'_>) -> DriverResult {
        let index = Self::record_index(operation.file)?;
        let mut volumes = self.volumes.lock();
        let volume = volumes
            .get_mut(operation.file.file_system.volume_id as usize)
            .ok_or(KernelError::NoDevice)?;
        let record = volume.records.get_mut(index).ok_or(KernelError::Generic)?;

        let position = operation.file.position() as usize;
        let end = position + operation.buffer.len();
        record.ensure_capacity(end);
        record.data[position..end].copy_from_slice(operation.buffer);
        if end > record.size {
            record.size = end;
        }

        operation.file.set_position(end as u64);
        operation.file.set_size(record.size as u64);
        operation
            .file
            .touch_modified(crate::time::system_time_ms());
        Ok(DriverValue::Count(operation.buffer.len() as u32))
    }

    fn delete(&self, volume_id: u32, name: &str) -> DriverResult {
        let name = normalize(name);
        let mut volumes = self.volumes.lock();
        let volume = volumes
            .get_mut(volume_id as usize)
            .ok_or(KernelError::NoDevice)?;
        let before = volume.records.len();
        volume.records.retain(|record| record.name != name);
        if volume.records.len() == before {
            return Err(KernelError::Generic);
        }
        Ok(DriverValue::None)
    }
}

impl DriverCommand for Ext2Driver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    fn command(&self, function: DriverFunction, param: &mut Param<'_>) -> DriverResult {
        match (function, param) {
            (DriverFunction::Load, _) | (DriverFunction::Unload, _) => Ok(DriverValue::None),
            (DriverFunction::GetVersion, _) => Ok(self.descriptor.version_value()),
            (DriverFunction::FsOpenFile, Param::FsOpen(info)) => self.open(*info),
            (DriverFunction::FsCloseFile, Param::FsFile(_)) => Ok(DriverValue::None),
            (DriverFunction::FsRead, Param::FsRead(operation)) => self.read(operation),
            (DriverFunction::FsWrite, Param::FsWrite(operation)) => self.write(operation),
            (DriverFunction::FsFlush, _) => Ok(DriverValue::None),
            (DriverFunction::FsGetVolumeInfo, Param::FsVolumeInfo(out)) => {
                let volumes = self.volumes.lock();
                // The caller filled in which volume through the fs field
                // of the open info; here the name is enough.
                out.file_count = volumes
                    .first()
                    .map(|volume| volume.records.len() as u32)
                    .unwrap_or(0);
                Ok(DriverValue::None)
            }
            (DriverFunction::FsDeleteFile, Param::FsOpen(info)) => {
                self.delete(info.file_system.volume_id, &info.name)
            }
            _ => Err(KernelError::NotImplemented),
        }
    }
}

/// Attach an in-memory volume for a disk partition. The on-disk content
/// is not interpreted at this revision.
pub fn mount_partition(
    _disk: &Arc<StorageUnit>,
    partition: &BootPartition,
    base: u32,
) -> KernelResult<()> {
    let name = super::default_volume_name();
    log::info!(
        "fs: ext2 volume '{}' at lba {} ({} sectors)",
        name,
        base + partition.lba,
        partition.size
    );
    driver().new_volume(name).map(|_| ())
}

/// Attach a disk-less scratch volume under the given logical name.
pub fn mount_ram_volume(name: &str) -> KernelResult<Arc<FileSystem>> {
    driver().new_volume(String::from(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{self, FileOpenInfo};
    use crate::test_support::TEST_GUARD;

    #[test]
    fn write_then_read_round_trip() {
        let _guard = TEST_GUARD.lock();
        fs::reset_for_tests();
        mount_ram_volume("T").unwrap();

        let written = fs::file_write_all("T:/notes.txt", b"buddy pages").unwrap();
        assert_eq!(written, 11);

        let bytes = fs::file_read_all("T:/notes.txt").unwrap();
        assert_eq!(bytes, b"buddy pages");

        fs::reset_for_tests();
    }

    #[test]
    fn open_identity_and_reference_counting() {
        let _guard = TEST_GUARD.lock();
        fs::reset_for_tests();
        mount_ram_volume("T").unwrap();

        let info = FileOpenInfo {
            name: "T:/same.txt",
            flags: OpenFlags::READ,
        };
        let first = fs::open_file(&info).unwrap();
        let second = fs::open_file(&info).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.references(), 2);
        assert_eq!(fs::file::open_files().len(), 1);

        fs::close_file(&second).unwrap();
        assert_eq!(fs::file::open_files().len(), 1);
        fs::close_file(&first).unwrap();
        assert_eq!(fs::file::open_files().len(), 0);

        fs::reset_for_tests();
    }

    #[test]
    fn distinct_flags_are_distinct_opens() {
        let _guard = TEST_GUARD.lock();
        fs::reset_for_tests();
        mount_ram_volume("T").unwrap();

        let read = fs::open_file(&FileOpenInfo {
            name: "T:/f",
            flags: OpenFlags::READ,
        })
        .unwrap();
        let write = fs::open_file(&FileOpenInfo {
            name: "T:/f",
            flags: OpenFlags::WRITE,
        })
        .unwrap();
        assert!(!Arc::ptr_eq(&read, &write));
        assert_eq!(fs::file::open_files().len(), 2);

        fs::close_file(&read).unwrap();
        fs::close_file(&write).unwrap();
        fs::reset_for_tests();
    }

    #[test]
    fn existing_flag_refuses_missing_files() {
        let _guard = TEST_GUARD.lock();
        fs::reset_for_tests();
        mount_ram_volume("T").unwrap();

        assert!(fs::open_file(&FileOpenInfo {
            name: "T:/never-created",
            flags: OpenFlags::READ | OpenFlags::EXISTING,
        })
        .is_err());

        fs::reset_for_tests();
    }

    #[test]
    fn truncate_and_append() {
        let _guard = TEST_GUARD.lock();
        fs::reset_for_tests();
        mount_ram_volume("T").unwrap();

        fs::file_write_all("T:/log", b"first").unwrap();

        let appender = fs::open_file(&FileOpenInfo {
            name: "T:/log",
            flags: OpenFlags::WRITE | OpenFlags::APPEND,
        })
        .unwrap();
        assert_eq!(appender.position(), 5);
        fs::write_file(&appender, b"+more").unwrap();
        fs::close_file(&appender).unwrap();

        assert_eq!(fs::file_read_all("T:/log").unwrap(), b"first+more");

        // Truncation drops the old content.
        fs::file_write_all("T:/log", b"x").unwrap();
        assert_eq!(fs::file_read_all("T:/log").unwrap(), b"x");

        fs::reset_for_tests();
    }

    #[test]
    fn growth_doubles_from_the_initial_block() {
        let mut record = FileRecord {
            name: String::from("r"),
            attributes: 0,
            size: 0,
            data: Vec::new(),
        };
        record.ensure_capacity(10);
        assert_eq!(record.data.len(), DEFAULT_BLOCK_SIZE);
        record.ensure_capacity(DEFAULT_BLOCK_SIZE + 1);
        assert_eq!(record.data.len(), DEFAULT_BLOCK_SIZE * 2);
        record.ensure_capacity(DEFAULT_BLOCK_SIZE * 5);
        assert_eq!(record.data.len(), DEFAULT_BLOCK_SIZE * 8);
    }

    #[test]
    fn reads_clamp_to_size() {
        let _guard = TEST_GUARD.lock();
        fs::reset_for_tests();
        mount_ram_volume("T").unwrap();

        fs::file_write_all("T:/small", b"abc").unwrap();
        let file = fs::open_file(&FileOpenInfo {
            name: "T:/small",
            flags: OpenFlags::READ,
        })
        .unwrap();

        let mut big = [0u8; 64];
        assert_eq!(fs::read_file(&file, &mut big).unwrap(), 3);
        // At end of file further reads return zero bytes.
        assert_eq!(fs::read_file(&file, &mut big).unwrap(), 0);
        fs::close_file(&file).unwrap();

        fs::reset_for_tests();
    }
}
