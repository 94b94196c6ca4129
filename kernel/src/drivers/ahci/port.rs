//! AHCI port state and command issue
//!
//! Each implemented port owns one DMA page carved into its command list
//! (1 KiB), received-FIS area (256 B) and command table (256 B), plus a
//! sector cache. Commands run in slot 0 and completion is polled.

use alloc::sync::Arc;
use core::sync::atomic::AtomicU32;

use spin::Mutex;

use crate::drivers::disk::SECTOR_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::mm::{self, vmm, PhysAddr, VirtAddr, PAGE_SIZE};

use super::cache::{SectorCache, NUM_CACHE_BUFFERS};
use super::regs::{
    CommandHeader, CommandTable, FisRegH2D, HbaPort, ATA_DEV_BUSY, ATA_DEV_DRQ, PORT_CMD_CR,
    PORT_CMD_FR, PORT_CMD_FRE, PORT_CMD_ST, PORT_IS_TFES, PORT_SSTS_DET_ESTABLISHED,
    PORT_SSTS_DET_MASK, PORT_SSTS_DET_NONE,
};

const COMMAND_LIST_OFFSET: usize = 0;
const RECEIVED_FIS_OFFSET: usize = 1024;
const COMMAND_TABLE_OFFSET: usize = 1280;

/// Spin bound for hardware waits, roughly one second.
const WAIT_SPINS: u32 = 1_000_000;

/// Per-port driver state.
pub struct AhciPort {
    pub port_number: u32,
    hba_port: &'static HbaPort,
    dma_page: PhysAddr,
    pub sector_cache: Mutex<SectorCache>,
    pub pending_interrupts: AtomicU32,
}

impl AhciPort {
    pub fn hba_port(&self) -> &HbaPort {
        self.hba_port
    }

    fn command_list(&self) -> *mut CommandHeader {
        mm::phys_to_ptr(self.dma_page.offset(COMMAND_LIST_OFFSET as u32)) as *mut CommandHeader
    }

    fn command_table(&self) -> *mut CommandTable {
        mm::phys_to_ptr(self.dma_page.offset(COMMAND_TABLE_OFFSET as u32)) as *mut CommandTable
    }

    fn command_table_phys(&self) -> PhysAddr {
        self.dma_page.offset(COMMAND_TABLE_OFFSET as u32)
    }
}

/// Stop command processing and FIS receive on a port.
pub fn stop_port(port: &HbaPort) {
    port.cmd.update(|cmd| cmd & !PORT_CMD_ST);
    while port.cmd.read() & PORT_CMD_CR != 0 {}

    port.cmd.update(|cmd| cmd & !PORT_CMD_FRE);
    while port.cmd.read() & PORT_CMD_FR != 0 {}
}

/// Enable FIS receive, then command processing.
pub fn start_port(port: &HbaPort) {
    while port.cmd.read() & PORT_CMD_CR != 0 {}
    port.cmd.update(|cmd| cmd | PORT_CMD_FRE);
    port.cmd.update(|cmd| cmd | PORT_CMD_ST);
}

/// COMRESET the link and wait for an established device.
pub fn port_reset(port: &HbaPort) -> KernelResult<()> {
    if port.ssts.read() & PORT_SSTS_DET_MASK != PORT_SSTS_DET_ESTABLISHED {
        return Err(KernelError::NoDevice);
    }

    port.sctl.update(|sctl| (sctl & !0xF) | 0x1);
    crate::arch::spin_delay(10_000);
    port.sctl.update(|sctl| sctl & !0xF);

    let mut timeout = WAIT_SPINS;
    while timeout > 0 {
        if port.ssts.read() & PORT_SSTS_DET_MASK == PORT_SSTS_DET_ESTABLISHED {
            break;
        }
        timeout -= 1;
    }
    if timeout == 0 {
        return Err(KernelError::Timeout);
    }

    port.serr.write(0xFFFF_FFFF);
    Ok(())
}

/// Bring up one implemented port: stop it, give it a DMA page, program
/// its base registers, mask its interrupts, reset the link and start it.
pub fn initialize_port(
    hba_port: &'static HbaPort,
    port_number: u32,
) -> KernelResult<Arc<AhciPort>> {
    let det = hba_port.ssts.read() & PORT_SSTS_DET_MASK;
    if det == PORT_SSTS_DET_NONE {
        return Err(KernelError::NoDevice);
    }

    stop_port(hba_port);

    let dma_page = mm::alloc_phys_page()?;
    unsafe {
        core::ptr::write_bytes(mm::phys_to_ptr(dma_page), 0, PAGE_SIZE);
    }

    let port = Arc::new(AhciPort {
        port_number,
        hba_port,
        dma_page,
        sector_cache: Mutex::new(SectorCache::new(NUM_CACHE_BUFFERS)),
        pending_interrupts: AtomicU32::new(0),
    });

    hba_port
        .clb
        .write(dma_page.offset(COMMAND_LIST_OFFSET as u32).as_u32());
    hba_port.clbu.write(0);
    hba_port
        .fb
        .write(dma_page.offset(RECEIVED_FIS_OFFSET as u32).as_u32());
    hba_port.fbu.write(0);

    // Slot 0 is the only slot this driver uses.
    unsafe {
        let header = &mut *port.command_list();
        header.set_cfl((core::mem::size_of::<FisRegH2D>() / 4) as u8);
        header.prdtl = 1;
        header.ctba = port.command_table_phys().as_u32();
        header.ctbau = 0;
    }

    // Ack anything pending and keep the port masked: completion is
    // polled, not interrupt-driven.
    hba_port.is.write(0xFFFF_FFFF);
    hba_port.ie.write(0);

    port_reset(hba_port)?;
    start_port(hba_port);

    log::info!("ahci: port {} up, ssts {:#x}", port_number, hba_port.ssts.read());
    Ok(port)
}

/// Issue one DMA command through slot 0 and poll it to completion.
///
/// Transfers of at most one page go through a page-aligned bounce frame
/// so the PRDT address is always aligned and physically contiguous;
/// larger transfers use the caller's buffer directly.
pub fn ahci_command(
    port: &AhciPort,
    command: u8,
    lba: u32,
    sector_count: u16,
    buffer: &mut [u8],
    is_write: bool,
) -> KernelResult<()> {
    let transfer_bytes = sector_count as usize * SECTOR_SIZE;
    if buffer.len() < transfer_bytes || transfer_bytes == 0 {
        return Err(KernelError::BadParameter);
    }

    let bounce = if transfer_bytes <= PAGE_SIZE {
        let frame = mm::alloc_phys_page()?;
        let window = mm::phys_to_ptr(frame);
        unsafe {
            if is_write {
                core::ptr::copy_nonoverlapping(buffer.as_ptr(), window, transfer_bytes);
            } else {
                core::ptr::write_bytes(window, 0, transfer_bytes);
            }
        }
        Some(frame)
    } else {
        None
    };

    let release = |frame: Option<PhysAddr>| {
        if let Some(frame) = frame {
            let _ = mm::free_phys_page(frame);
        }
    };

    let data_phys = match bounce {
        Some(frame) => frame,
        None => {
            match vmm::map_linear_to_physical(VirtAddr::new(buffer.as_ptr() as usize as u32)) {
                Ok(phys) => phys,
                Err(err) => {
                    release(bounce);
                    return Err(err);
                }
            }
        }
    };

    let hba_port = port.hba_port;

    // Wait for the device to go idle.
    let mut timeout = WAIT_SPINS;
    while hba_port.tfd.read() & (ATA_DEV_BUSY | ATA_DEV_DRQ) != 0 && timeout > 0 {
        timeout -= 1;
    }
    if timeout == 0 {
        release(bounce);
        return Err(KernelError::Timeout);
    }

    hba_port.is.write(0xFFFF_FFFF);

    unsafe {
        let header = &mut *port.command_list();
        header.set_cfl((core::mem::size_of::<FisRegH2D>() / 4) as u8);
        header.set_write(is_write);
        header.prdtl = 1;
        header.ctba = port.command_table_phys().as_u32();
        header.ctbau = 0;

        let table = &mut *port.command_table();
        table.zero();
        table.install_fis(&FisRegH2D::command(command, lba, sector_count));
        table.prdt[0].dba = data_phys.as_u32();
        table.prdt[0].dbau = 0;
        table.prdt[0].set_transfer(transfer_bytes as u32, false);
    }

    hba_port.ci.write(1);

    let mut timeout = WAIT_SPINS;
    while hba_port.ci.read() & 1 != 0 && timeout > 0 {
        if hba_port.is.read() & PORT_IS_TFES != 0 {
            release(bounce);
            return Err(KernelError::Hardware);
        }
        timeout -= 1;
    }
    if timeout == 0 {
        release(bounce);
        return Err(KernelError::Timeout);
    }
    if hba_port.is.read() & PORT_IS_TFES != 0 {
        release(bounce);
        return Err(KernelError::Hardware);
    }

    if let Some(frame) = bounce {
        if !is_write {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    mm::phys_to_ptr(frame),
                    buffer.as_mut_ptr(),
                    transfer_bytes,
                );
            }
        }
    }
    release(bounce);
    Ok(())
}
