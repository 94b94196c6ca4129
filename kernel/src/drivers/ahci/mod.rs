//! AHCI SATA driver
//!
//! PCI-attached HBA driver: maps the ABAR, brings up every implemented
//! port, publishes each as a storage unit behind the disk command
//! vtable, and registers a device-interrupt slot. Command completion is
//! polled, so the HBA's global interrupt enable stays masked and the
//! interrupt path only latches and logs port status.

pub mod cache;
pub mod port;
pub mod regs;

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use spin::{Mutex, Once};

use crate::error::{KernelError, KernelResult};
use crate::mm::{vmm, PhysAddr};
use crate::time;

use super::disk::{
    register_disk, DiskAccessFlags, DiskGeometry, IoControl, StorageUnit, SECTOR_SIZE,
};
use super::irq;
use super::pci::{
    self, PciDevice, PciDriverRegistration, PCI_ANY, PCI_CLASS_STORAGE, PCI_PROGIF_AHCI,
    PCI_SUBCLASS_SATA,
};
use super::{
    DriverCommand, DriverDescriptor, DriverEnumNext, DriverFunction, DriverKind, DriverResult,
    DriverValue, Param, ENUM_DOMAIN_AHCI_PORT,
};

use cache::{cached_read, cached_write};
use port::{ahci_command, initialize_port, AhciPort};
use regs::{
    HbaMem, ATA_CMD_READ_DMA_EXT, ATA_CMD_WRITE_DMA_EXT, CAP_NP_MASK, GHC_AE, GHC_IE,
    PORT_IS_TFES, PORT_SSTS_DET_MASK,
};

const VER_MAJOR: u32 = 1;
const VER_MINOR: u32 = 0;

const MAX_PORTS: usize = 32;

/// Controller-wide driver state.
struct AhciState {
    base: Option<&'static HbaMem>,
    ports_implemented: u32,
    device: Option<Arc<PciDevice>>,
    ports: [Option<Arc<AhciPort>>; MAX_PORTS],
    pending_ports_mask: u32,
    interrupt_slot: u8,
    interrupt_registered: bool,
    interrupt_enabled: bool,
}

impl AhciState {
    const fn new() -> Self {
        const NONE: Option<Arc<AhciPort>> = None;
        Self {
            base: None,
            ports_implemented: 0,
            device: None,
            ports: [NONE; MAX_PORTS],
            pending_ports_mask: 0,
            interrupt_slot: irq::INVALID_SLOT,
            interrupt_registered: false,
            interrupt_enabled: false,
        }
    }
}

static AHCI: Mutex<AhciState> = Mutex::new(AhciState::new());
static DRIVER: Once<Arc<AhciDriver>> = Once::new();

/// The SATA disk driver behind every AHCI storage unit.
pub struct AhciDriver {
    descriptor: DriverDescriptor,
}

pub fn driver() -> Arc<AhciDriver> {
    DRIVER
        .call_once(|| {
            Arc::new(AhciDriver {
                descriptor: DriverDescriptor::new(
                    DriverKind::HardDisk,
                    VER_MAJOR,
                    VER_MINOR,
                    "EXOS",
                    "AHCI Controllers",
                    "AHCI SATA Controller",
                    &[ENUM_DOMAIN_AHCI_PORT],
                ),
            })
        })
        .clone()
}

/// Match table: any AHCI controller (class 01h, subclass 06h, prog-if 01h).
const AHCI_MATCHES: &[pci::DriverMatch] = &[pci::DriverMatch {
    vendor: PCI_ANY,
    device: PCI_ANY,
    class: PCI_CLASS_STORAGE,
    subclass: PCI_SUBCLASS_SATA,
    prog_if: PCI_PROGIF_AHCI,
}];

/// Hook the driver into the PCI enumerator.
pub fn register_pci_driver() {
    pci::register_pci_driver(PciDriverRegistration {
        driver: driver(),
        matches: AHCI_MATCHES,
        attach,
    });
}

/// PCI attach: validate and map the ABAR, enable bus mastering, then
/// bring the controller up.
fn attach(device: &Arc<PciDevice>) -> KernelResult<()> {
    {
        let state = AHCI.lock();
        if state.base.is_some() {
            // One controller is enough; ignore duplicates.
            log::debug!("ahci: duplicate controller ignored");
            return Ok(());
        }
    }

    let abar = pci::bar_base(&device.info, 5);
    if abar == 0 {
        return Err(KernelError::NoDevice);
    }
    if !(0x1000..=0xFFFF_F000).contains(&abar) {
        log::warn!("ahci: ABAR {:#010x} out of range", abar);
        return Err(KernelError::BadParameter);
    }

    let mapped = vmm::map_io(PhysAddr::new(abar), 0x1000)?;
    let base: &'static HbaMem = unsafe { &*(mapped.as_usize() as *const HbaMem) };

    pci::enable_bus_master(device.info.location);

    {
        let mut state = AHCI.lock();
        state.base = Some(base);
        state.device = Some(device.clone());
    }

    initialize_controller()
}

/// Bring up the HBA: AHCI mode, port discovery, interrupt slot. The
/// global interrupt enable is left masked; the disk driver polls for
/// completion, and unmasking the HBA would only generate INTx storms on
/// shared lines.
fn initialize_controller() -> KernelResult<()> {
    let (base, irq_line) = {
        let state = AHCI.lock();
        let base = state.base.ok_or(KernelError::BadParameter)?;
        let irq_line = state.device.as_ref().map(|d| d.info.irq_line).unwrap_or(0xFF);
        (base, irq_line)
    };

    let version = base.vs.read();
    let cap = base.cap.read();
    let nports = (cap & CAP_NP_MASK) + 1;
    log::info!(
        "ahci: version {}.{}, {} ports, cap {:#010x}",
        (version >> 16) & 0xFFFF,
        version & 0xFFFF,
        nports,
        cap
    );

    base.ghc.update(|ghc| ghc | GHC_AE);
    let implemented = base.pi.read();

    {
        let mut state = AHCI.lock();
        state.ports_implemented = implemented;
        state.pending_ports_mask = 0;
    }

    for number in 0..(nports as usize).min(MAX_PORTS) {
        if implemented & (1 << number) == 0 {
            continue;
        }
        match initialize_port(&base.ports[number], number as u32) {
            Ok(port) => {
                let unit = StorageUnit::new(
                    driver(),
                    DiskGeometry {
                        cylinders: 1024,
                        heads: 16,
                        sectors_per_track: 63,
                        bytes_per_sector: SECTOR_SIZE as u32,
                    },
                    number as u32,
                    format!("sata{}", number),
                );
                register_disk(unit);
                AHCI.lock().ports[number] = Some(port);
            }
            Err(KernelError::NoDevice) => {}
            Err(err) => {
                log::warn!("ahci: port {} init failed: {}", number, err);
            }
        }
    }

    register_interrupts(irq_line);

    base.ghc.update(|ghc| ghc & !GHC_IE);
    AHCI.lock().interrupt_enabled = false;
    Ok(())
}

fn register_interrupts(irq_line: u8) {
    {
        let state = AHCI.lock();
        if state.interrupt_registered {
            return;
        }
    }
    if irq_line == 0xFF {
        log::warn!("ahci: controller reports no legacy IRQ line");
        return;
    }

    let registration = irq::InterruptRegistration {
        name: String::from("AHCI SATA Controller"),
        legacy_irq: irq_line,
        top_half: alloc::boxed::Box::new(interrupt_top_half),
        bottom_half: alloc::boxed::Box::new(interrupt_bottom_half),
        poll: alloc::boxed::Box::new(interrupt_poll),
    };

    match irq::register(registration) {
        Ok(slot) => {
            let mut state = AHCI.lock();
            state.interrupt_slot = slot;
            state.interrupt_registered = true;
            state.interrupt_enabled = irq::slot_is_enabled(slot);
        }
        Err(err) => {
            log::warn!("ahci: interrupt slot registration failed: {}", err);
        }
    }
}

/// Top half: acknowledge the HBA and latch per-port status.
fn interrupt_top_half() -> bool {
    let mut state = AHCI.lock();
    let base = match state.base {
        Some(base) => base,
        None => return false,
    };

    let global = base.is.read();
    if global == 0 {
        return false;
    }
    base.is.write(global);

    let implemented = state.ports_implemented;
    let mut latched = false;
    for number in 0..MAX_PORTS {
        let bit = 1u32 << number;
        if global & bit == 0 || implemented & bit == 0 {
            continue;
        }
        let hba_port = &base.ports[number];
        let port_status = hba_port.is.read();
        hba_port.is.write(port_status);

        if let Some(port) = &state.ports[number] {
            port.pending_interrupts
                .fetch_or(port_status, Ordering::AcqRel);
            latched = true;
        }
        state.pending_ports_mask |= bit;
    }
    latched
}

/// Bottom half: snapshot and clear the latched state with interrupts
/// held off, then act on it. Today that means logging task-file errors;
/// completion stays polled.
fn interrupt_bottom_half() {
    let mut pending: [u32; MAX_PORTS] = [0; MAX_PORTS];
    let mut mask = 0u32;

    crate::arch::without_interrupts(|| {
        let mut state = AHCI.lock();
        mask = state.pending_ports_mask;
        state.pending_ports_mask = 0;
        for number in 0..MAX_PORTS {
            if mask & (1 << number) == 0 {
                continue;
            }
            if let Some(port) = &state.ports[number] {
                pending[number] = port.pending_interrupts.swap(0, Ordering::AcqRel);
            }
        }
    });

    for (number, status) in pending.iter().enumerate() {
        if mask & (1 << number) == 0 {
            continue;
        }
        if status & PORT_IS_TFES != 0 {
            log::warn!("ahci: port {} reported task file error ({:#x})", number, status);
        } else if *status != 0 {
            log::debug!("ahci: port {} interrupt status {:#x}", number, status);
        }
    }
}

/// Poll path: top and bottom half in sequence.
fn interrupt_poll() {
    if interrupt_top_half() {
        interrupt_bottom_half();
    }
}

fn port_for(control: &IoControl<'_>) -> KernelResult<Arc<AhciPort>> {
    use crate::obj::{KernelObject, ObjectKind};
    if !control.disk.header().is_valid(ObjectKind::Disk) {
        return Err(KernelError::BadParameter);
    }
    AHCI
        .lock()
        .ports
        .get(control.disk.unit_id as usize)
        .and_then(|port| port.clone())
        .ok_or(KernelError::NoDevice)
}

fn read(control: &mut IoControl<'_>) -> KernelResult<()> {
    control.validate()?;
    let port = port_for(control)?;
    let now = time::system_time_ms();
    let mut cache = port.sector_cache.lock();
    let issue = &mut |sector: u32, _high: u32, data: &mut [u8; SECTOR_SIZE]| {
        ahci_command(&port, ATA_CMD_READ_DMA_EXT, sector, 1, data, false)
    };
    cached_read(
        &mut cache,
        now,
        control.sector_low,
        control.num_sectors,
        control.buffer,
        issue,
    )
}

fn write(control: &mut IoControl<'_>) -> KernelResult<()> {
    control.validate()?;
    if control.disk.access().contains(DiskAccessFlags::READONLY) {
        return Err(KernelError::NoPermission);
    }
    let port = port_for(control)?;
    let now = time::system_time_ms();
    let mut cache = port.sector_cache.lock();
    let issue = &mut |sector: u32, _high: u32, data: &mut [u8; SECTOR_SIZE]| {
        ahci_command(&port, ATA_CMD_WRITE_DMA_EXT, sector, 1, data, true)
    };
    cached_write(
        &mut cache,
        now,
        control.sector_low,
        control.num_sectors,
        control.buffer,
        issue,
    )
}

fn enum_next(record: &mut DriverEnumNext) -> KernelResult<()> {
    if record.domain != ENUM_DOMAIN_AHCI_PORT {
        return Err(KernelError::NotImplemented);
    }
    let state = AHCI.lock();
    let base = state.base.ok_or(KernelError::NoDevice)?;

    let mut seen = 0u32;
    for number in 0..MAX_PORTS {
        if state.ports_implemented & (1 << number) == 0 {
            continue;
        }
        if seen == record.index {
            let hba_port = &base.ports[number];
            record.id = number as u32;
            record.status = hba_port.ssts.read();
            record.signature = hba_port.sig.read();
            return Ok(());
        }
        seen += 1;
    }
    Err(KernelError::NoMore)
}

fn enum_pretty(domain: u32, index: u32, line: &mut String) -> KernelResult<()> {
    let mut record = DriverEnumNext {
        domain,
        index,
        ..DriverEnumNext::default()
    };
    enum_next(&mut record)?;
    *line = format!(
        "AHCI Port {}: DET={:X} SSTS={:08X} SIG={:08X}",
        record.id,
        record.status & PORT_SSTS_DET_MASK,
        record.status,
        record.signature
    );
    Ok(())
}

impl DriverCommand for AhciDriver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    fn command(&self, function: DriverFunction, param: &mut Param<'_>) -> DriverResult {
        match (function, param) {
            (DriverFunction::Load, _) | (DriverFunction::Unload, _) => Ok(DriverValue::None),
            (DriverFunction::GetVersion, _) => Ok(self.descriptor.version_value()),
            (DriverFunction::DiskReset, _) => Err(KernelError::NotImplemented),
            (DriverFunction::DiskRead, Param::DiskIo(control)) => {
                read(control).map(|_| DriverValue::None)
            }
            (DriverFunction::DiskWrite, Param::DiskIo(control)) => {
                write(control).map(|_| DriverValue::None)
            }
            (DriverFunction::DiskGetInfo, Param::DiskInfo(info)) => {
                let geometry = info.disk.geometry();
                info.kind = DriverKind::HardDisk;
                info.removable = false;
                info.num_sectors = geometry.sector_count();
                info.bytes_per_sector = geometry.bytes_per_sector;
                info.access = info.disk.access();
                Ok(DriverValue::None)
            }
            (DriverFunction::DiskSetAccess, Param::DiskAccess(request)) => {
                request.disk.set_access(request.access);
                Ok(DriverValue::None)
            }
            (DriverFunction::EnumNext, Param::EnumNext(record)) => {
                enum_next(&mut **record).map(|_| DriverValue::None)
            }
            (DriverFunction::EnumPretty, Param::EnumPretty { domain, index, line }) => {
                enum_pretty(*domain, *index, &mut **line).map(|_| DriverValue::None)
            }
            _ => Err(KernelError::NotImplemented),
        }
    }
}

#[doc(hidden)]
pub fn reset_for_tests() {
    *AHCI.lock() = AhciState::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_table_covers_any_ahci_controller() {
        let generic = pci::PciDeviceInfo {
            location: pci::PciLocation::new(0, 2, 0),
            vendor_id: 0x1B4B,
            device_id: 0x9172,
            class: 0x01,
            subclass: 0x06,
            prog_if: 0x01,
            revision: 0x11,
            header_type: 0,
            irq_line: 10,
            bars: [0; 6],
        };
        assert!(AHCI_MATCHES.iter().any(|m| m.matches(&generic)));
    }

    #[test]
    fn enum_without_controller_reports_no_device() {
        let _guard = crate::test_support::TEST_GUARD.lock();
        reset_for_tests();
        let mut record = DriverEnumNext {
            domain: ENUM_DOMAIN_AHCI_PORT,
            ..DriverEnumNext::default()
        };
        assert!(matches!(
            enum_next(&mut record),
            Err(KernelError::NoDevice)
        ));
    }

    #[test]
    fn enum_refuses_foreign_domains() {
        let mut record = DriverEnumNext {
            domain: 0x7777,
            ..DriverEnumNext::default()
        };
        assert!(matches!(
            enum_next(&mut record),
            Err(KernelError::NotImplemented)
        ));
    }
}
