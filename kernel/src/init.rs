//! Staged kernel bring-up
//!
//! Order matters: serial and logging first, then physical memory, the
//! virtual-memory manager and the Rust heap, then the kernel process
//! and its heap, then drivers, disks and file systems.

use alloc::vec::Vec;

use crate::bootinfo::{BootInfo, KernelConfig};
use crate::drivers::{ahci, disk, pci, DriverCommand};
use crate::error::KernelResult;
use crate::mm::{self, heap, vmm, PhysAddr, VirtAddr, PAGE_SIZE, VMA_KERNEL};
use crate::process;
use crate::sync::INFINITY;
use crate::{fs, graphics, logger, serial};

/// Span handed to the Rust global allocator on bare metal.
#[cfg(target_os = "none")]
const RUST_HEAP_SIZE: u32 = 4 * 1024 * 1024;

/// Span of the kernel process heap.
const KERNEL_HEAP_SIZE: u32 = 1024 * 1024;

/// Bring the whole kernel up from the boot handoff.
pub fn kernel_init(boot_info: &BootInfo<'_>) -> KernelResult<()> {
    serial::init();
    let config = KernelConfig::parse(boot_info.command_line);
    logger::init(config.log_level);
    log::info!("kernel starting, command line '{}'", boot_info.command_line);

    mm::init(boot_info)?;
    let managed_pages = (boot_info.managed_ram_bytes() / PAGE_SIZE) as u32;
    vmm::init(managed_pages)?;

    #[cfg(target_os = "none")]
    init_rust_heap(managed_pages)?;

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::arch::x86::init();

    process::init_kernel_process()?;
    init_kernel_heap(managed_pages)?;

    init_drivers(&config)?;
    init_filesystems()?;
    init_graphics();

    log::info!(
        "kernel up: {} pages managed, {} volumes",
        managed_pages,
        fs::filesystem_count()
    );
    Ok(())
}

/// Commit a kernel region above the linear window and hand it to the
/// global allocator backing `alloc::` collections.
#[cfg(target_os = "none")]
fn init_rust_heap(managed_pages: u32) -> KernelResult<()> {
    let base = vmm::alloc_region(
        VirtAddr::new(VMA_KERNEL + managed_pages * PAGE_SIZE as u32),
        PhysAddr::new(0),
        RUST_HEAP_SIZE,
        vmm::AllocFlags::COMMIT | vmm::AllocFlags::READWRITE | vmm::AllocFlags::AT_OR_OVER,
    )?;
    crate::init_global_heap(base.as_usize(), RUST_HEAP_SIZE as usize);
    Ok(())
}

/// Commit and format the kernel process heap.
fn init_kernel_heap(managed_pages: u32) -> KernelResult<()> {
    let base = vmm::alloc_region(
        VirtAddr::new(VMA_KERNEL + managed_pages * PAGE_SIZE as u32),
        PhysAddr::new(0),
        KERNEL_HEAP_SIZE,
        vmm::AllocFlags::COMMIT | vmm::AllocFlags::READWRITE | vmm::AllocFlags::AT_OR_OVER,
    )?;
    heap::heap_init(base, KERNEL_HEAP_SIZE)?;

    if let Some(kernel) = process::kernel_process() {
        kernel.heap_mutex.lock(INFINITY)?;
        kernel.set_heap(base, KERNEL_HEAP_SIZE);
        kernel.heap_mutex.unlock()?;
    }
    Ok(())
}

fn init_drivers(config: &KernelConfig) -> KernelResult<()> {
    crate::drivers::register_driver(ahci::driver())?;
    crate::drivers::register_driver(graphics::selector())?;
    ahci::register_pci_driver();

    if config.no_pci {
        log::info!("pci: scan disabled by command line");
    } else {
        pci::scan_bus();
    }
    Ok(())
}

/// Walk every discovered disk's partition table and mount what we can.
/// A disk-less system still gets a scratch volume so the system FS
/// exists.
fn init_filesystems() -> KernelResult<()> {
    for unit in disk::disks() {
        if let Err(err) = fs::mount_disk_partitions(&unit, None, 0) {
            log::warn!("fs: partition walk on '{}' failed: {}", unit.name(), err);
        }
    }

    if fs::filesystem_count() == 0 {
        let volume = fs::ext2::mount_ram_volume("C")?;
        fs::set_system_filesystem(&volume);
        log::info!("fs: no disk volumes, scratch volume 'C' is system FS");
    }
    Ok(())
}

/// Load the graphics selector. Back-ends (GOP, VESA, iGPU) register as
/// collaborators; with none present the selector reports no device.
fn init_graphics() {
    let candidates: Vec<_> = crate::drivers::drivers_of_kind(crate::drivers::DriverKind::Graphics)
        .into_iter()
        .filter(|driver| {
            driver.descriptor().product != graphics::selector().descriptor().product
        })
        .collect();
    graphics::selector().load_backends(candidates);
}

/// The idle loop the initial kernel task falls into once init is done.
#[cfg(target_os = "none")]
pub fn idle_loop() -> ! {
    loop {
        crate::arch::halt_until_interrupt();
    }
}
