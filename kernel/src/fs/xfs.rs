//! Native on-disk filesystem (read-only at this revision)
//!
//! Volume layout, in clusters of `sectors_per_cluster` sectors counted
//! from the partition base: cluster 0 holds the master record (sector 0)
//! and the superblock (sector 1); directories are chains of record
//! pages whose trailing word links the next page; a file's record points
//! to its cluster table, an end-marked list of data cluster numbers.
//!
//! Open walks path components page by page through the block device;
//! read follows the cluster table. Write and delete are not part of
//! this revision.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::drivers::disk::{read_sectors, StorageUnit, SECTOR_SIZE};
use crate::drivers::{
    DriverCommand, DriverDescriptor, DriverFunction, DriverKind, DriverResult, DriverValue, Param,
};
use crate::error::{FsError, KernelError, KernelResult};

use super::file::{File, FsNode, OpenFlags, FS_ATTR_FOLDER};
use super::mbr::BootPartition;
use super::{decompose_path, FileInfo, FileOperation, FileSystem};

const VER_MAJOR: u32 = 1;
const VER_MINOR: u32 = 0;

/// Master record magic, sector 0 of the partition.
pub const XFS_MASTER_MAGIC: u32 = 0x5346_584D;
/// Superblock magic, sector 1 of the partition.
pub const XFS_SUPER_MAGIC: u32 = 0x5346_5845;
/// End-of-chain marker for pages and cluster tables.
pub const XFS_CLUSTER_END: u32 = 0xFFFF_FFFF;

/// Bytes reserved for a record name.
pub const XFS_NAME_LEN: usize = 32;
/// On-disk record footprint.
pub const XFS_RECORD_SIZE: usize = 44;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct XfsMaster {
    magic: u32,
    sectors_per_cluster: u32,
    reserved: [u32; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct XfsSuper {
    magic: u32,
    version: u32,
    cluster_count: u32,
    root_cluster: u32,
}

/// One directory record as stored on disk.
#[derive(Debug, Clone)]
struct XfsRecord {
    name: String,
    attributes: u32,
    size: u32,
    cluster_table: u32,
}

impl XfsRecord {
    fn parse(bytes: &[u8]) -> Option<XfsRecord> {
        if bytes[0] == 0 {
            return None;
        }
        let end = bytes[..XFS_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(XFS_NAME_LEN);
        let name = String::from(core::str::from_utf8(&bytes[..end]).ok()?);
        let word = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        Some(XfsRecord {
            name,
            attributes: word(XFS_NAME_LEN),
            size: word(XFS_NAME_LEN + 4),
            cluster_table: word(XFS_NAME_LEN + 8),
        })
    }
}

/// Where an open file lives on the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XfsLocation {
    pub page_cluster: u32,
    pub record_index: u32,
    pub cluster_table: u32,
    pub size: u32,
}

struct Volume {
    disk: Arc<StorageUnit>,
    partition_start: u32,
    sectors_per_cluster: u32,
    cluster_count: u32,
    root_cluster: u32,
}

impl Volume {
    fn cluster_bytes(&self) -> usize {
        self.sectors_per_cluster as usize * SECTOR_SIZE
    }

    fn records_per_page(&self) -> usize {
        (self.cluster_bytes() - 4) / XFS_RECORD_SIZE
    }

    fn read_cluster(&self, cluster: u32, buffer: &mut [u8]) -> KernelResult<()> {
        if cluster >= self.cluster_count {
            return Err(KernelError::Fs(FsError::BadSector));
        }
        let lba = self.partition_start as u64 + cluster as u64 * self.sectors_per_cluster as u64;
        read_sectors(&self.disk, lba, self.sectors_per_cluster, buffer)
            .map_err(|_| KernelError::Fs(FsError::CantReadSector))
    }

    /// Find a record by name in the directory chain starting at
    /// `first_page`.
    fn find_record(&self, first_page: u32, name: &str) -> KernelResult<Option<(u32, u32, XfsRecord)>> {
        let mut page = first_page;
        let mut buffer = vec![0u8; self.cluster_bytes()];

        while page != XFS_CLUSTER_END {
            self.read_cluster(page, &mut buffer)?;

            for index in 0..self.records_per_page() {
                let offset = index * XFS_RECORD_SIZE;
                if let Some(record) = XfsRecord::parse(&buffer[offset..offset + XFS_RECORD_SIZE]) {
                    if record.name == name {
                        return Ok(Some((page, index as u32, record)));
                    }
                }
            }

            let link = self.cluster_bytes() - 4;
            page = u32::from_le_bytes([
                buffer[link],
                buffer[link + 1],
                buffer[link + 2],
                buffer[link + 3],
            ]);
        }
        Ok(None)
    }

    /// Data cluster numbers of a file, in order.
    fn cluster_table(&self, table_cluster: u32) -> KernelResult<Vec<u32>> {
        let mut buffer = vec![0u8; self.cluster_bytes()];
        self.read_cluster(table_cluster, &mut buffer)?;

        let mut clusters = Vec::new();
        for chunk in buffer.chunks_exact(4) {
            let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if value == XFS_CLUSTER_END {
                break;
            }
            clusters.push(value);
        }
        Ok(clusters)
    }
}

pub struct XfsDriver {
    descriptor: DriverDescriptor,
    volumes: Mutex<Vec<Volume>>,
}

static DRIVER: Once<Arc<XfsDriver>> = Once::new();

pub fn driver() -> Arc<XfsDriver> {
    DRIVER
        .call_once(|| {
            Arc::new(XfsDriver {
                descriptor: DriverDescriptor::new(
                    DriverKind::FileSystem,
                    VER_MAJOR,
                    VER_MINOR,
                    "EXOS",
                    "EXOS",
                    "XFS",
                    &[],
                ),
                volumes: Mutex::new(Vec::new()),
            })
        })
        .clone()
}

impl XfsDriver {
    fn open(&self, info: &FileInfo) -> DriverResult {
        // On-disk volumes never create on open.
        if info
            .flags
            .contains(OpenFlags::WRITE)
        {
            return Err(KernelError::NoPermission);
        }

        let volumes = self.volumes.lock();
        let volume = volumes
            .get(info.file_system.volume_id as usize)
            .ok_or(KernelError::NoDevice)?;

        let components = decompose_path(info.name.trim_start_matches(super::path::PATH_SEPARATOR));
        let mut page = volume.root_cluster;
        let mut found: Option<(u32, u32, XfsRecord)> = None;

        for (depth, component) in components.iter().enumerate() {
            if component.is_empty() {
                return Err(KernelError::BadParameter);
            }
            let record = volume
                .find_record(page, component)?
                .ok_or(KernelError::Generic)?;

            let is_last = depth == components.len() - 1;
            if is_last {
                found = Some(record);
            } else {
                if record.2.attributes & FS_ATTR_FOLDER == 0 {
                    return Err(KernelError::Generic);
                }
                page = record.2.cluster_table;
            }
        }

        let (page_cluster, record_index, record) = found.ok_or(KernelError::Generic)?;
        if record.attributes & FS_ATTR_FOLDER != 0 {
            return Err(KernelError::Generic);
        }

        let file = File::new(
            info.file_system.clone(),
            &info.name,
            FsNode::Xfs(XfsLocation {
                page_cluster,
                record_index,
                cluster_table: record.cluster_table,
                size: record.size,
            }),
        );
        file.set_attributes(record.attributes);
        file.set_size(record.size as u64);
        Ok(DriverValue::File(file))
    }

    fn read(&self, operation: &mut FileOperation<'_>) -> DriverResult {
        let location = match &*operation.file.node.lock() {
            FsNode::Xfs(location) => *location,
            _ => return Err(KernelError::BadParameter),
        };

        let volumes = self.volumes.lock();
        let volume = volumes
            .get(operation.file.file_system.volume_id as usize)
            .ok_or(KernelError::NoDevice)?;

        let position = operation.file.position() as usize;
        let size = location.size as usize;
        if position >= size {
            return Ok(DriverValue::Count(0));
        }
        let count = (size - position).min(operation.buffer.len());

        let clusters = volume.cluster_table(location.cluster_table)?;
        let cluster_bytes = volume.cluster_bytes();
        let mut cluster_buffer = vec![0u8; cluster_bytes];

        let mut done = 0usize;
        while done < count {
            let at = position + done;
            let index = at / cluster_bytes;
            let offset = at % cluster_bytes;
            let cluster = *clusters.get(index).ok_or(KernelError::Fs(FsError::BadSector))?;

            volume.read_cluster(cluster, &mut cluster_buffer)?;
            let chunk = (cluster_bytes - offset).min(count - done);
            operation.buffer[done..done + chunk]
                .copy_from_slice(&cluster_buffer[offset..offset + chunk]);
            done += chunk;
        }

        operation.file.set_position((position + count) as u64);
        Ok(DriverValue::Count(count as u32))
    }
}

impl DriverCommand for XfsDriver {
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
            (DriverFunction::FsFlush, _) => Ok(DriverValue::None),
            _ => Err(KernelError::NotImplemented),
        }
    }
}

fn read_header(disk: &Arc<StorageUnit>, lba: u32) -> KernelResult<(XfsMaster, XfsSuper)> {
    let mut sector = vec![0u8; SECTOR_SIZE];
    read_sectors(disk, lba as u64, 1, &mut sector)
        .map_err(|_| KernelError::Fs(FsError::CantReadSector))?;
    let word = |bytes: &[u8], offset: usize| {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    };
    let master = XfsMaster {
        magic: word(&sector, 0),
        sectors_per_cluster: word(&sector, 4),
        reserved: [0; 6],
    };

    let mut super_sector = vec![0u8; SECTOR_SIZE];
    read_sectors(disk, lba as u64 + 1, 1, &mut super_sector)
        .map_err(|_| KernelError::Fs(FsError::CantReadSector))?;
    let superblock = XfsSuper {
        magic: word(&super_sector, 0),
        version: word(&super_sector, 4),
        cluster_count: word(&super_sector, 8),
        root_cluster: word(&super_sector, 12),
    };
    Ok((master, superblock))
}

/// Mount one XFS partition: validate the master record and superblock,
/// then register the volume under the next default name.
pub fn mount_partition(
    disk: &Arc<StorageUnit>,
    partition: &BootPartition,
    base: u32,
) -> KernelResult<()> {
    let start = base + partition.lba;
    let (master, superblock) = read_header(disk, start)?;

    if master.magic != XFS_MASTER_MAGIC || superblock.magic != XFS_SUPER_MAGIC {
        log::debug!("fs: no xfs volume at lba {}", start);
        return Err(KernelError::Generic);
    }
    if master.sectors_per_cluster == 0 || superblock.root_cluster == 0 {
        return Err(KernelError::Fs(FsError::BadSector));
    }

    let name = super::default_volume_name();
    let driver = driver();
    let volume_id = {
        let mut volumes = driver.volumes.lock();
        volumes.push(Volume {
            disk: disk.clone(),
            partition_start: start,
            sectors_per_cluster: master.sectors_per_cluster,
            cluster_count: superblock.cluster_count,
            root_cluster: superblock.root_cluster,
        });
        (volumes.len() - 1) as u32
    };

    let fs = FileSystem::new(driver, name.clone(), volume_id);
    super::register_filesystem(&fs)?;
    log::info!(
        "fs: xfs volume '{}' at lba {} ({} clusters)",
        name,
        start,
        superblock.cluster_count
    );
    Ok(())
}

#[doc(hidden)]
pub mod testing {
    //! Volume image builder for tests: formats a partition and lays out
    //! files and folders in the on-disk format the driver reads.

    use alloc::vec;

    use super::*;
    use crate::drivers::disk::write_sectors;

    pub struct ImageBuilder {
        disk: Arc<StorageUnit>,
        base_lba: u32,
        sectors_per_cluster: u32,
        cluster_count: u32,
        next_free: u32,
    }

    impl ImageBuilder {
        /// Format a volume: master, superblock and an empty root page.
        pub fn format(
            disk: &Arc<StorageUnit>,
            base_lba: u32,
            cluster_count: u32,
            sectors_per_cluster: u32,
        ) -> KernelResult<ImageBuilder> {
            let mut builder = ImageBuilder {
                disk: disk.clone(),
                base_lba,
                sectors_per_cluster,
                cluster_count,
                next_free: 1,
            };

            let mut sector = vec![0u8; SECTOR_SIZE];
            sector[0..4].copy_from_slice(&XFS_MASTER_MAGIC.to_le_bytes());
            sector[4..8].copy_from_slice(&sectors_per_cluster.to_le_bytes());
            write_sectors(&builder.disk, base_lba as u64, 1, &mut sector)?;

            let root = builder.alloc_cluster();
            let mut sector = vec![0u8; SECTOR_SIZE];
            sector[0..4].copy_from_slice(&XFS_SUPER_MAGIC.to_le_bytes());
            sector[4..8].copy_from_slice(&1u32.to_le_bytes());
            sector[8..12].copy_from_slice(&cluster_count.to_le_bytes());
            sector[12..16].copy_from_slice(&root.to_le_bytes());
            write_sectors(&builder.disk, base_lba as u64 + 1, 1, &mut sector)?;

            builder.write_empty_page(root)?;
            Ok(builder)
        }

        fn cluster_bytes(&self) -> usize {
            self.sectors_per_cluster as usize * SECTOR_SIZE
        }

        fn alloc_cluster(&mut self) -> u32 {
            let cluster = self.next_free;
            self.next_free += 1;
            assert!(cluster < self.cluster_count, "image out of clusters");
            cluster
        }

        fn write_cluster(&self, cluster: u32, bytes: &mut [u8]) -> KernelResult<()> {
            let lba = self.base_lba as u64 + cluster as u64 * self.sectors_per_cluster as u64;
            write_sectors(&self.disk, lba, self.sectors_per_cluster, bytes)
        }

        fn write_empty_page(&self, cluster: u32) -> KernelResult<()> {
            let mut page = vec![0u8; self.cluster_bytes()];
            let link = self.cluster_bytes() - 4;
            page[link..].copy_from_slice(&XFS_CLUSTER_END.to_le_bytes());
            let mut bytes = page;
            self.write_cluster(cluster, &mut bytes)
        }

        fn insert_record(
            &mut self,
            page_cluster: u32,
            name: &str,
            attributes: u32,
            size: u32,
            cluster_table: u32,
        ) -> KernelResult<()> {
            let mut page = vec![0u8; self.cluster_bytes()];
            let lba = self.base_lba as u64 + page_cluster as u64 * self.sectors_per_cluster as u64;
            read_sectors(&self.disk, lba, self.sectors_per_cluster, &mut page)?;

            let slots = (self.cluster_bytes() - 4) / XFS_RECORD_SIZE;
            let slot = (0..slots)
                .find(|index| page[index * XFS_RECORD_SIZE] == 0)
                .expect("directory page full");
            let offset = slot * XFS_RECORD_SIZE;

            let name_bytes = name.as_bytes();
            assert!(name_bytes.len() < XFS_NAME_LEN);
            page[offset..offset + name_bytes.len()].copy_from_slice(name_bytes);
            page[offset + XFS_NAME_LEN..offset + XFS_NAME_LEN + 4]
                .copy_from_slice(&attributes.to_le_bytes());
            page[offset + XFS_NAME_LEN + 4..offset + XFS_NAME_LEN + 8]
                .copy_from_slice(&size.to_le_bytes());
            page[offset + XFS_NAME_LEN + 8..offset + XFS_NAME_LEN + 12]
                .copy_from_slice(&cluster_table.to_le_bytes());

            self.write_cluster(page_cluster, &mut page)
        }

        /// Add a folder under `parent_page`; returns the folder's page
        /// cluster.
        pub fn add_folder(&mut self, parent_page: u32, name: &str) -> KernelResult<u32> {
            let page = self.alloc_cluster();
            self.write_empty_page(page)?;
            self.insert_record(parent_page, name, FS_ATTR_FOLDER, 0, page)?;
            Ok(page)
        }

        /// Add a file with the given content under `parent_page`.
        pub fn add_file(
            &mut self,
            parent_page: u32,
            name: &str,
            content: &[u8],
        ) -> KernelResult<()> {
            let cluster_bytes = self.cluster_bytes();
            let data_clusters = content.len().div_ceil(cluster_bytes).max(1);
            assert!(data_clusters * 4 + 4 <= cluster_bytes, "file too large");

            let table_cluster = self.alloc_cluster();
            let mut table = vec![0u8; cluster_bytes];
            let mut cursor = 0usize;

            for index in 0..data_clusters {
                let data_cluster = self.alloc_cluster();
                table[index * 4..index * 4 + 4].copy_from_slice(&data_cluster.to_le_bytes());

                let mut data = vec![0u8; cluster_bytes];
                let chunk = (content.len() - cursor).min(cluster_bytes);
                data[..chunk].copy_from_slice(&content[cursor..cursor + chunk]);
                cursor += chunk;
                self.write_cluster(data_cluster, &mut data)?;
            }
            table[data_clusters * 4..data_clusters * 4 + 4]
                .copy_from_slice(&XFS_CLUSTER_END.to_le_bytes());
            self.write_cluster(table_cluster, &mut table)?;

            self.insert_record(
                parent_page,
                name,
                0,
                content.len() as u32,
                table_cluster,
            )
        }

        pub fn root_cluster(&self) -> u32 {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ImageBuilder;
    use super::*;
    use crate::drivers::disk::RamDiskDriver;
    use crate::fs::{self, FileOpenInfo};
    use crate::test_support::TEST_GUARD;

    fn build_volume() -> Arc<StorageUnit> {
        let ram = RamDiskDriver::new();
        let disk = ram.add_unit(128, "xfs-test");
        let mut image = ImageBuilder::format(&disk, 0, 64, 1).unwrap();
        let root = image.root_cluster();
        image.add_file(root, "hello.txt", b"cluster chains").unwrap();
        let boot = image.add_folder(root, "boot").unwrap();
        image.add_file(boot, "kernel.bin", &[0xE9; 1300]).unwrap();
        disk
    }

    fn mount(disk: &Arc<StorageUnit>) {
        let partition = BootPartition {
            kind: crate::fs::mbr::FSID_EXOS,
            lba: 0,
            size: 128,
            ..BootPartition::default()
        };
        mount_partition(disk, &partition, 0).unwrap();
    }

    #[test]
    fn open_and_read_a_root_file() {
        let _guard = TEST_GUARD.lock();
        fs::reset_for_tests();
        let disk = build_volume();
        mount(&disk);

        let name = alloc::format!("{}:/hello.txt", fs::filesystems()[0].name());
        let file = fs::open_file(&FileOpenInfo {
            name: &name,
            flags: OpenFlags::READ,
        })
        .unwrap();
        assert_eq!(fs::get_file_size(&file), 14);

        let mut buffer = [0u8; 32];
        let read = fs::read_file(&file, &mut buffer).unwrap();
        assert_eq!(&buffer[..read as usize], b"cluster chains");
        fs::close_file(&file).unwrap();

        fs::reset_for_tests();
    }

    #[test]
    fn walks_folders_component_by_component() {
        let _guard = TEST_GUARD.lock();
        fs::reset_for_tests();
        let disk = build_volume();
        mount(&disk);

        let name = alloc::format!("{}:/boot/kernel.bin", fs::filesystems()[0].name());
        let file = fs::open_file(&FileOpenInfo {
            name: &name,
            flags: OpenFlags::READ,
        })
        .unwrap();
        assert_eq!(fs::get_file_size(&file), 1300);

        // The payload spans three single-sector clusters.
        let mut buffer = alloc::vec![0u8; 1300];
        assert_eq!(fs::read_file(&file, &mut buffer).unwrap(), 1300);
        assert!(buffer.iter().all(|&b| b == 0xE9));
        fs::close_file(&file).unwrap();

        fs::reset_for_tests();
    }

    #[test]
    fn missing_files_and_write_opens_fail() {
        let _guard = TEST_GUARD.lock();
        fs::reset_for_tests();
        let disk = build_volume();
        mount(&disk);

        let volumes = fs::filesystems();
        let volume = volumes[0].name();
        assert!(fs::open_file(&FileOpenInfo {
            name: &alloc::format!("{}:/absent", volume),
            flags: OpenFlags::READ,
        })
        .is_err());

        assert!(fs::open_file(&FileOpenInfo {
            name: &alloc::format!("{}:/hello.txt", volume),
            flags: OpenFlags::READ | OpenFlags::WRITE,
        })
        .is_err());

        fs::reset_for_tests();
    }

    #[test]
    fn bad_magic_refuses_to_mount() {
        let _guard = TEST_GUARD.lock();
        fs::reset_for_tests();

        let ram = RamDiskDriver::new();
        let disk = ram.add_unit(16, "blank");
        let partition = BootPartition {
            kind: crate::fs::mbr::FSID_EXOS,
            lba: 0,
            size: 16,
            ..BootPartition::default()
        };
        assert!(mount_partition(&disk, &partition, 0).is_err());
        assert_eq!(fs::filesystem_count(), 0);

        fs::reset_for_tests();
    }
}
