//! Memory management
//!
//! Physical pages come from the buddy allocator; virtual memory is a
//! two-level 32-bit page-table hierarchy managed by [`vmm`]. Kernel code
//! and data live above [`VMA_KERNEL`] and are mapped identically in every
//! address space; managed RAM is additionally visible through the kernel
//! linear window, which is what [`phys_to_ptr`] resolves against.

pub mod buddy;
pub mod heap;
pub mod page_fault;
pub mod page_table;
pub mod vmm;

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::bootinfo::BootInfo;
use crate::error::{KernelError, KernelResult};

pub use buddy::{metadata_size, BuddyAllocator};

/// Size of one page / physical frame.
pub const PAGE_SIZE: usize = 4096;
/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Bottom of the user region.
pub const VMA_USER: u32 = 0x0040_0000;
/// Top of the user region (exclusive).
pub const VMA_USER_END: u32 = 0x4000_0000;
/// Bottom of kernel space; everything above is shared by all directories.
pub const VMA_KERNEL: u32 = 0xC000_0000;
/// Kernel VA window reserved for MMIO mappings.
pub const VMA_IO: u32 = 0xE000_0000;
/// Transient single-page mapping slot.
pub const VMA_TEMP: u32 = 0xFF80_0000;

/// Physical memory address (32-bit, non-PAE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub const fn page_index(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u32 - 1) == 0
    }

    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0 + bytes)
    }
}

/// Linear (virtual) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u32 - 1) == 0
    }

    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0 + bytes)
    }
}

/// Base of the window through which the kernel touches physical memory.
///
/// On bare metal this is [`VMA_KERNEL`] (RAM is linearly mapped there).
/// Hosted builds point it at a simulated RAM buffer before using any
/// memory-manager facility.
static PHYS_WINDOW: AtomicUsize = AtomicUsize::new(VMA_KERNEL as usize);

pub fn set_phys_window(base: usize) {
    PHYS_WINDOW.store(base, Ordering::Release);
}

/// Pointer to the byte backing a physical address.
pub fn phys_to_ptr(addr: PhysAddr) -> *mut u8 {
    (PHYS_WINDOW.load(Ordering::Acquire) + addr.as_usize()) as *mut u8
}

/// Kernel VA corresponding to a managed physical address.
pub fn phys_to_linear(addr: PhysAddr) -> VirtAddr {
    VirtAddr::new(VMA_KERNEL + addr.as_u32())
}

/// The buddy allocator and the VMM share this one memory mutex.
pub static PAGE_ALLOCATOR: Mutex<Option<BuddyAllocator>> = Mutex::new(None);

/// Install a freshly initialized buddy allocator.
pub fn install_allocator(allocator: BuddyAllocator) {
    *PAGE_ALLOCATOR.lock() = Some(allocator);
}

/// Allocate one physical page.
pub fn alloc_phys_page() -> KernelResult<PhysAddr> {
    PAGE_ALLOCATOR
        .lock()
        .as_mut()
        .ok_or(KernelError::Generic)?
        .alloc_page()
}

/// Free one physical page.
pub fn free_phys_page(page: PhysAddr) -> KernelResult<()> {
    PAGE_ALLOCATOR
        .lock()
        .as_mut()
        .ok_or(KernelError::Generic)?
        .free_page(page)
}

/// Total page count managed by the buddy allocator.
pub fn total_phys_pages() -> u32 {
    PAGE_ALLOCATOR
        .lock()
        .as_ref()
        .map(|a| a.total_pages())
        .unwrap_or(0)
}

/// Reserved page count reported by the buddy allocator.
pub fn used_phys_pages() -> u32 {
    PAGE_ALLOCATOR
        .lock()
        .as_ref()
        .map(|a| a.used_pages())
        .unwrap_or(0)
}

/// Bring up physical memory from the boot memory map: the buddy metadata
/// arena is carved out of the start of managed RAM and the pages holding
/// it (plus any unusable boot regions) are reserved before the VMM runs.
pub fn init(boot_info: &BootInfo) -> KernelResult<()> {
    let managed_bytes = boot_info.managed_ram_bytes();
    if managed_bytes < PAGE_SIZE * 16 {
        return Err(KernelError::OutOfMemory);
    }
    let total_pages = (managed_bytes / PAGE_SIZE) as u32;
    let meta_bytes = metadata_size(total_pages);

    let meta_base = phys_to_ptr(PhysAddr::new(0));
    let allocator = unsafe { BuddyAllocator::initialize(meta_base, meta_bytes, total_pages)? };
    install_allocator(allocator);

    // Careful: this path runs before the Rust heap exists, so the
    // reservations are applied straight off the boot map.
    let meta_pages = (meta_bytes / PAGE_SIZE) as u32;
    let mut guard = PAGE_ALLOCATOR.lock();
    let allocator = guard.as_mut().ok_or(KernelError::Generic)?;
    allocator.set_range(0, meta_pages, true)?;
    for region in boot_info.memory_map.iter().filter(|region| !region.usable) {
        let first = (region.start as usize / PAGE_SIZE) as u32;
        let count = (region.size as usize).div_ceil(PAGE_SIZE) as u32;
        allocator.set_range(first, count, true)?;
    }
    if boot_info.kernel_end > boot_info.kernel_start {
        let first = (boot_info.kernel_start as usize / PAGE_SIZE) as u32;
        let count =
            ((boot_info.kernel_end - boot_info.kernel_start) as usize).div_ceil(PAGE_SIZE) as u32;
        allocator.set_range(first, count, true)?;
    }

    log::info!(
        "mm: {} pages managed, {} reserved at boot",
        total_pages,
        allocator.used_pages()
    );
    Ok(())
}
