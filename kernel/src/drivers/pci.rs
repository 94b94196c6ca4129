//! PCI bus enumerator
//!
//! Walks configuration space through the legacy `0xCF8`/`0xCFC` ports,
//! records every function present, and attaches registered drivers by
//! `{vendor, device, class, subclass, prog_if}` match tables.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::port;
use crate::error::KernelResult;
use crate::list::{KernelList, ListAnchor, Listed};
use crate::obj::{KernelObject, ObjectHeader, ObjectKind};

use super::DriverCommand;

/// Wildcard for match-table fields.
pub const PCI_ANY: u32 = 0xFFFF_FFFF;

/// Mass-storage class / SATA subclass / AHCI programming interface.
pub const PCI_CLASS_STORAGE: u32 = 0x01;
pub const PCI_SUBCLASS_SATA: u32 = 0x06;
pub const PCI_PROGIF_AHCI: u32 = 0x01;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

const COMMAND_REGISTER: u8 = 0x04;
const COMMAND_BUS_MASTER: u16 = 1 << 2;

/// Bus/device/function triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciLocation {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciLocation {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    fn config_address(&self, offset: u8) -> u32 {
        0x8000_0000
            | ((self.bus as u32) << 16)
            | ((self.device as u32) << 11)
            | ((self.function as u32) << 8)
            | (offset as u32 & 0xFC)
    }
}

pub fn config_read_u32(location: PciLocation, offset: u8) -> u32 {
    unsafe {
        port::outl(CONFIG_ADDRESS, location.config_address(offset));
        port::inl(CONFIG_DATA)
    }
}

pub fn config_write_u32(location: PciLocation, offset: u8, value: u32) {
    unsafe {
        port::outl(CONFIG_ADDRESS, location.config_address(offset));
        port::outl(CONFIG_DATA, value);
    }
}

pub fn config_read_u16(location: PciLocation, offset: u8) -> u16 {
    (config_read_u32(location, offset) >> ((offset as u32 & 2) * 8)) as u16
}

pub fn config_read_u8(location: PciLocation, offset: u8) -> u8 {
    (config_read_u32(location, offset) >> ((offset as u32 & 3) * 8)) as u8
}

/// Snapshot of one configuration-space function header.
#[derive(Debug, Clone, Copy)]
pub struct PciDeviceInfo {
    pub location: PciLocation,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub header_type: u8,
    pub irq_line: u8,
    pub bars: [u32; 6],
}

/// One discovered PCI function, as a kernel object.
pub struct PciDevice {
    header: ObjectHeader,
    anchor: ListAnchor,
    pub info: PciDeviceInfo,
    pub driver: Mutex<Option<Arc<dyn DriverCommand>>>,
}

impl PciDevice {
    pub fn new(info: PciDeviceInfo) -> Arc<PciDevice> {
        Arc::new(PciDevice {
            header: ObjectHeader::new(ObjectKind::PciDevice),
            anchor: ListAnchor::new(),
            info,
            driver: Mutex::new(None),
        })
    }
}

impl Listed for PciDevice {
    fn anchor(&self) -> &ListAnchor {
        &self.anchor
    }
}

impl KernelObject for PciDevice {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

/// One row of a driver's match table. `PCI_ANY` wildcards a field.
#[derive(Debug, Clone, Copy)]
pub struct DriverMatch {
    pub vendor: u32,
    pub device: u32,
    pub class: u32,
    pub subclass: u32,
    pub prog_if: u32,
}

impl DriverMatch {
    pub fn matches(&self, info: &PciDeviceInfo) -> bool {
        let field = |pattern: u32, value: u32| pattern == PCI_ANY || pattern == value;
        field(self.vendor, info.vendor_id as u32)
            && field(self.device, info.device_id as u32)
            && field(self.class, info.class as u32)
            && field(self.subclass, info.subclass as u32)
            && field(self.prog_if, info.prog_if as u32)
    }
}

/// A driver's claim on parts of the bus.
pub struct PciDriverRegistration {
    pub driver: Arc<dyn DriverCommand>,
    pub matches: &'static [DriverMatch],
    pub attach: fn(&Arc<PciDevice>) -> KernelResult<()>,
}

static PCI_DRIVERS: Mutex<Vec<PciDriverRegistration>> = Mutex::new(Vec::new());
static PCI_DEVICES: Mutex<KernelList<PciDevice>> = Mutex::new(KernelList::new());

pub fn register_pci_driver(registration: PciDriverRegistration) {
    PCI_DRIVERS.lock().push(registration);
}

pub fn pci_devices() -> Vec<Arc<PciDevice>> {
    PCI_DEVICES.lock().iter().cloned().collect()
}

fn read_function(location: PciLocation) -> Option<PciDeviceInfo> {
    let id = config_read_u32(location, 0x00);
    let vendor_id = (id & 0xFFFF) as u16;
    if vendor_id == 0xFFFF {
        return None;
    }

    let class_register = config_read_u32(location, 0x08);
    let mut bars = [0u32; 6];
    for (index, bar) in bars.iter_mut().enumerate() {
        *bar = config_read_u32(location, 0x10 + (index as u8) * 4);
    }

    Some(PciDeviceInfo {
        location,
        vendor_id,
        device_id: (id >> 16) as u16,
        class: (class_register >> 24) as u8,
        subclass: (class_register >> 16) as u8,
        prog_if: (class_register >> 8) as u8,
        revision: class_register as u8,
        header_type: config_read_u8(location, 0x0E),
        irq_line: config_read_u8(location, 0x3C),
        bars,
    })
}

/// Attach the first registered driver whose table matches the device.
pub fn attach_drivers(device: &Arc<PciDevice>) {
    let registrations = PCI_DRIVERS.lock();
    for registration in registrations.iter() {
        if registration
            .matches
            .iter()
            .any(|m| m.matches(&device.info))
        {
            match (registration.attach)(device) {
                Ok(()) => {
                    *device.driver.lock() = Some(registration.driver.clone());
                    log::info!(
                        "pci {:02x}:{:02x}.{} bound to {}",
                        device.info.location.bus,
                        device.info.location.device,
                        device.info.location.function,
                        registration.driver.descriptor().product
                    );
                    return;
                }
                Err(err) => {
                    log::warn!(
                        "pci {:02x}:{:02x}.{} attach failed: {}",
                        device.info.location.bus,
                        device.info.location.device,
                        device.info.location.function,
                        err
                    );
                }
            }
        }
    }
}

/// Enumerate every bus/device/function and attach matching drivers.
pub fn scan_bus() {
    for bus in 0..=255u16 {
        for device in 0..32u8 {
            let first = PciLocation::new(bus as u8, device, 0);
            let Some(info) = read_function(first) else {
                continue;
            };
            let functions = if info.header_type & 0x80 != 0 { 8 } else { 1 };

            for function in 0..functions {
                let location = PciLocation::new(bus as u8, device, function);
                let info = if function == 0 {
                    info
                } else {
                    match read_function(location) {
                        Some(info) => info,
                        None => continue,
                    }
                };
                log::debug!(
                    "pci {:02x}:{:02x}.{} {:04x}:{:04x} class {:02x}.{:02x}.{:02x}",
                    location.bus,
                    location.device,
                    location.function,
                    info.vendor_id,
                    info.device_id,
                    info.class,
                    info.subclass,
                    info.prog_if
                );
                let pci_device = PciDevice::new(info);
                let _ = PCI_DEVICES.lock().add_tail(pci_device.clone());
                attach_drivers(&pci_device);
            }
        }
    }
}

/// Base address programmed into a 32-bit memory BAR.
pub fn bar_base(info: &PciDeviceInfo, index: usize) -> u32 {
    let bar = info.bars[index];
    if bar & 1 != 0 {
        // I/O BAR
        bar & !0x3
    } else {
        bar & !0xF
    }
}

/// Turn on bus mastering for DMA-capable devices.
pub fn enable_bus_master(location: PciLocation) {
    let current = config_read_u32(location, COMMAND_REGISTER);
    config_write_u32(
        location,
        COMMAND_REGISTER,
        current | COMMAND_BUS_MASTER as u32,
    );
}
