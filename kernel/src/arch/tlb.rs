//! TLB and paging control

use crate::mm::{PhysAddr, VirtAddr};

/// Invalidate the TLB line covering one page.
pub fn invalidate(addr: VirtAddr) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) addr.as_u32(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        let _ = addr;
    }
}

/// Load a page directory into CR3, flushing non-global TLB entries.
pub fn load_directory(directory: PhysAddr) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) directory.as_u32(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        let _ = directory;
    }
}
