//! Storage units and block I/O
//!
//! A storage unit is the kernel object behind one disk-like device. Its
//! driver interprets the unit id; the rest of the kernel only sees the
//! common header, the geometry and the `IoControl` block-I/O argument.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::list::{KernelList, ListAnchor, Listed};
use crate::obj::{KernelObject, ObjectHeader, ObjectKind};

use super::{DriverCommand, DriverFunction, DriverValue, Param};

/// Sector size every block driver speaks.
pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors_per_track: u32,
    pub bytes_per_sector: u32,
}

impl DiskGeometry {
    pub fn sector_count(&self) -> u64 {
        self.cylinders as u64 * self.heads as u64 * self.sectors_per_track as u64
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiskAccessFlags: u32 {
        const READONLY = 1 << 0;
    }
}

/// One disk-like device.
pub struct StorageUnit {
    header: ObjectHeader,
    anchor: ListAnchor,
    pub driver: Arc<dyn DriverCommand>,
    geometry: Mutex<DiskGeometry>,
    access: AtomicU32,
    /// Driver-private unit index.
    pub unit_id: u32,
    name: String,
}

impl StorageUnit {
    pub fn new(
        driver: Arc<dyn DriverCommand>,
        geometry: DiskGeometry,
        unit_id: u32,
        name: String,
    ) -> Arc<StorageUnit> {
        Arc::new(StorageUnit {
            header: ObjectHeader::new(ObjectKind::Disk),
            anchor: ListAnchor::new(),
            driver,
            geometry: Mutex::new(geometry),
            access: AtomicU32::new(0),
            unit_id,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> DiskGeometry {
        *self.geometry.lock()
    }

    pub fn set_geometry(&self, geometry: DiskGeometry) {
        *self.geometry.lock() = geometry;
    }

    pub fn access(&self) -> DiskAccessFlags {
        DiskAccessFlags::from_bits_truncate(self.access.load(Ordering::Acquire))
    }

    pub fn set_access(&self, access: DiskAccessFlags) {
        self.access.store(access.bits(), Ordering::Release);
    }
}

impl Listed for StorageUnit {
    fn anchor(&self) -> &ListAnchor {
        &self.anchor
    }
}

impl KernelObject for StorageUnit {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

/// The one common block-I/O argument.
pub struct IoControl<'a> {
    pub disk: Arc<StorageUnit>,
    pub sector_low: u32,
    pub sector_high: u32,
    pub num_sectors: u32,
    pub buffer: &'a mut [u8],
}

impl<'a> IoControl<'a> {
    /// Reject requests whose buffer cannot hold the transfer.
    pub fn validate(&self) -> KernelResult<()> {
        let needed = self.num_sectors as usize * SECTOR_SIZE;
        if self.buffer.len() < needed {
            return Err(KernelError::BadParameter);
        }
        Ok(())
    }
}

/// Output of `DiskGetInfo`.
pub struct DiskInfo {
    pub disk: Arc<StorageUnit>,
    pub kind: super::DriverKind,
    pub removable: bool,
    pub num_sectors: u64,
    pub bytes_per_sector: u32,
    pub access: DiskAccessFlags,
}

/// Input of `DiskSetAccess`.
pub struct DiskAccessRequest {
    pub disk: Arc<StorageUnit>,
    pub access: DiskAccessFlags,
}

static DISKS: Mutex<KernelList<StorageUnit>> = Mutex::new(KernelList::new());

pub fn register_disk(disk: Arc<StorageUnit>) {
    let _ = DISKS.lock().add_tail(disk);
}

pub fn disks() -> Vec<Arc<StorageUnit>> {
    DISKS.lock().iter().cloned().collect()
}

#[doc(hidden)]
pub fn reset_disks_for_tests() {
    DISKS.lock().reset();
}

/// Read whole sectors through a unit's driver.
pub fn read_sectors(
    disk: &Arc<StorageUnit>,
    sector: u64,
    num_sectors: u32,
    buffer: &mut [u8],
) -> KernelResult<()> {
    let control = IoControl {
        disk: disk.clone(),
        sector_low: sector as u32,
        sector_high: (sector >> 32) as u32,
        num_sectors,
        buffer,
    };
    control.validate()?;
    disk.driver
        .command(DriverFunction::DiskRead, &mut Param::DiskIo(control))
        .map(|_| ())
}

/// Write whole sectors through a unit's driver.
pub fn write_sectors(
    disk: &Arc<StorageUnit>,
    sector: u64,
    num_sectors: u32,
    buffer: &mut [u8],
) -> KernelResult<()> {
    let control = IoControl {
        disk: disk.clone(),
        sector_low: sector as u32,
        sector_high: (sector >> 32) as u32,
        num_sectors,
        buffer,
    };
    control.validate()?;
    disk.driver
        .command(DriverFunction::DiskWrite, &mut Param::DiskIo(control))
        .map(|_| ())
}

/// RAM-backed disk driver: the reference block device used by tests and
/// the ramdisk volume.
pub struct RamDiskDriver {
    descriptor: super::DriverDescriptor,
    units: Mutex<Vec<Mutex<Vec<u8>>>>,
}

impl RamDiskDriver {
    pub fn new() -> Arc<RamDiskDriver> {
        Arc::new(RamDiskDriver {
            descriptor: super::DriverDescriptor::new(
                super::DriverKind::RamDisk,
                1,
                0,
                "EXOS",
                "EXOS",
                "RAM disk",
                &[],
            ),
            units: Mutex::new(Vec::new()),
        })
    }

    /// Create a unit of `sectors` sectors and register its storage unit.
    pub fn add_unit(self: &Arc<Self>, sectors: u32, name: &str) -> Arc<StorageUnit> {
        let unit_id = {
            let mut units = self.units.lock();
            units.push(Mutex::new(alloc::vec![0u8; sectors as usize * SECTOR_SIZE]));
            (units.len() - 1) as u32
        };
        let unit = StorageUnit::new(
            self.clone(),
            DiskGeometry {
                cylinders: sectors.div_ceil(16 * 63),
                heads: 16,
                sectors_per_track: 63,
                bytes_per_sector: SECTOR_SIZE as u32,
            },
            unit_id,
            String::from(name),
        );
        register_disk(unit.clone());
        unit
    }

    fn transfer(&self, control: &mut IoControl<'_>, is_write: bool) -> KernelResult<()> {
        control.validate()?;
        let units = self.units.lock();
        let storage = units
            .get(control.disk.unit_id as usize)
            .ok_or(KernelError::NoDevice)?;
        let mut storage = storage.lock();

        let start = control.sector_low as usize * SECTOR_SIZE;
        let len = control.num_sectors as usize * SECTOR_SIZE;
        if control.sector_high != 0 || start + len > storage.len() {
            return Err(KernelError::BadParameter);
        }

        if is_write {
            storage[start..start + len].copy_from_slice(&control.buffer[..len]);
        } else {
            control.buffer[..len].copy_from_slice(&storage[start..start + len]);
        }
        Ok(())
    }
}

impl DriverCommand for RamDiskDriver {
    fn descriptor(&self) -> &super::DriverDescriptor {
        &self.descriptor
    }

    fn command(&self, function: DriverFunction, param: &mut Param<'_>) -> super::DriverResult {
        match (function, param) {
            (DriverFunction::Load, _) | (DriverFunction::Unload, _) => Ok(DriverValue::None),
            (DriverFunction::GetVersion, _) => Ok(self.descriptor.version_value()),
            (DriverFunction::DiskRead, Param::DiskIo(control)) => {
                self.transfer(control, false).map(|_| DriverValue::None)
            }
            (DriverFunction::DiskWrite, Param::DiskIo(control)) => {
                if control.disk.access().contains(DiskAccessFlags::READONLY) {
                    return Err(KernelError::NoPermission);
                }
                self.transfer(control, true).map(|_| DriverValue::None)
            }
            (DriverFunction::DiskGetInfo, Param::DiskInfo(info)) => {
                info.kind = super::DriverKind::RamDisk;
                info.removable = false;
                let geometry = info.disk.geometry();
                info.num_sectors = geometry.sector_count();
                info.bytes_per_sector = geometry.bytes_per_sector;
                info.access = info.disk.access();
                Ok(DriverValue::None)
            }
            (DriverFunction::DiskSetAccess, Param::DiskAccess(request)) => {
                request.disk.set_access(request.access);
                Ok(DriverValue::None)
            }
            _ => Err(KernelError::NotImplemented),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_disk_round_trip() {
        let driver = RamDiskDriver::new();
        let unit = driver.add_unit(64, "ram0");

        let mut sector = [0u8; SECTOR_SIZE];
        sector[0] = 0xA5;
        sector[511] = 0x5A;
        write_sectors(&unit, 3, 1, &mut sector).unwrap();

        let mut back = [0u8; SECTOR_SIZE];
        read_sectors(&unit, 3, 1, &mut back).unwrap();
        assert_eq!(back[0], 0xA5);
        assert_eq!(back[511], 0x5A);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let driver = RamDiskDriver::new();
        let unit = driver.add_unit(8, "ram1");

        let mut tiny = [0u8; 100];
        assert!(matches!(
            read_sectors(&unit, 0, 1, &mut tiny),
            Err(KernelError::BadParameter)
        ));
    }

    #[test]
    fn readonly_unit_refuses_writes() {
        let driver = RamDiskDriver::new();
        let unit = driver.add_unit(8, "ram2");
        unit.set_access(DiskAccessFlags::READONLY);

        let mut sector = [0u8; SECTOR_SIZE];
        assert!(matches!(
            write_sectors(&unit, 0, 1, &mut sector),
            Err(KernelError::NoPermission)
        ));
    }

    #[test]
    fn out_of_range_is_rejected() {
        let driver = RamDiskDriver::new();
        let unit = driver.add_unit(4, "ram3");

        let mut sector = [0u8; SECTOR_SIZE];
        assert!(read_sectors(&unit, 4, 1, &mut sector).is_err());
    }
}
