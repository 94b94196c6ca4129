//! Virtual-memory manager
//!
//! Owns page-directory lifecycle and linear-region allocation. Kernel
//! space above [`VMA_KERNEL`] is mapped identically in every directory:
//! its page tables are created at init (linear RAM window, MMIO window,
//! transient slot) and copied into each new directory. User regions live
//! in `[VMA_USER, VMA_USER_END)` and belong to exactly one directory.
//!
//! Page tables themselves are the source of truth for region state:
//! reserved pages carry flags but no frame, MMIO pages carry `FIXED` so
//! their frames are never returned to the buddy.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use super::page_table::{
    directory_index, table_index, PageFlags, PageTable, PageTableEntry, PAGE_TABLE_ENTRIES,
};
use super::{PhysAddr, VirtAddr, PAGE_SIZE, VMA_IO, VMA_KERNEL, VMA_TEMP, VMA_USER, VMA_USER_END};
use crate::arch;
use crate::error::{KernelError, KernelResult};

/// Span of the MMIO mapping window.
const VMA_IO_SPAN: u32 = 16 * 1024 * 1024;

static KERNEL_DIRECTORY: AtomicU32 = AtomicU32::new(0);
static CURRENT_DIRECTORY: AtomicU32 = AtomicU32::new(0);

bitflags! {
    /// Region allocation flags. Absent `COMMIT` means reserve-only;
    /// absent `READWRITE` means read-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        const COMMIT        = 1 << 0;
        const READWRITE     = 1 << 1;
        const UNCACHED      = 1 << 2;
        const WRITE_COMBINE = 1 << 3;
        const IO            = 1 << 4;
        const AT_OR_OVER    = 1 << 5;
    }
}

fn table(phys: PhysAddr) -> *mut PageTable {
    super::phys_to_ptr(phys) as *mut PageTable
}

fn entry_in(table_phys: PhysAddr, index: usize) -> PageTableEntry {
    unsafe { (&*table(table_phys))[index] }
}

fn set_entry_in(table_phys: PhysAddr, index: usize, entry: PageTableEntry) {
    unsafe {
        (&mut *table(table_phys))[index] = entry;
    }
}

fn alloc_table_page() -> KernelResult<PhysAddr> {
    let page = super::alloc_phys_page()?;
    unsafe {
        core::ptr::write_bytes(super::phys_to_ptr(page), 0, PAGE_SIZE);
    }
    Ok(page)
}

/// Physical address of the page table covering `addr`, creating it when
/// `create` is set. Kernel-space tables created after init are installed
/// into the kernel directory as well, so fresh directories inherit them.
fn leaf_table(dir: PhysAddr, addr: VirtAddr, create: bool) -> KernelResult<PhysAddr> {
    let index = directory_index(addr);
    let pde = entry_in(dir, index);

    if let Some(frame) = pde.frame() {
        return Ok(frame);
    }
    if !create {
        return Err(KernelError::BadParameter);
    }

    let table_page = alloc_table_page()?;
    let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE;
    if addr.as_u32() < VMA_KERNEL {
        flags |= PageFlags::USER;
    }
    let mut pde = PageTableEntry::empty();
    pde.set(table_page, flags);
    set_entry_in(dir, index, pde);

    if addr.as_u32() >= VMA_KERNEL {
        let kernel_dir = PhysAddr::new(KERNEL_DIRECTORY.load(Ordering::Acquire));
        if kernel_dir != dir && kernel_dir.as_u32() != 0 {
            set_entry_in(kernel_dir, index, pde);
        }
    }
    Ok(table_page)
}

fn entry_at(dir: PhysAddr, addr: VirtAddr) -> Option<PageTableEntry> {
    let pde = entry_in(dir, directory_index(addr));
    let table_phys = pde.frame()?;
    Some(entry_in(table_phys, table_index(addr)))
}

fn store_entry(dir: PhysAddr, addr: VirtAddr, entry: PageTableEntry) -> KernelResult<()> {
    let table_phys = leaf_table(dir, addr, true)?;
    set_entry_in(table_phys, table_index(addr), entry);
    if dir.as_u32() == CURRENT_DIRECTORY.load(Ordering::Acquire) || addr.as_u32() >= VMA_KERNEL {
        arch::tlb::invalidate(addr);
    }
    Ok(())
}

/// Build the kernel address space: linear window over managed RAM, page
/// tables for the MMIO window and the transient slot. Must run after the
/// buddy allocator is installed.
pub fn init(managed_pages: u32) -> KernelResult<()> {
    let dir = alloc_table_page()?;
    KERNEL_DIRECTORY.store(dir.as_u32(), Ordering::Release);
    CURRENT_DIRECTORY.store(dir.as_u32(), Ordering::Release);

    // Linear window: VMA_KERNEL + p maps frame p for all managed RAM.
    for page in 0..managed_pages {
        let phys = PhysAddr::new(page << super::PAGE_SHIFT);
        let va = VirtAddr::new(VMA_KERNEL + phys.as_u32());
        let mut entry = PageTableEntry::empty();
        entry.set(
            phys,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL | PageFlags::FIXED,
        );
        let table_phys = leaf_table(dir, va, true)?;
        set_entry_in(table_phys, table_index(va), entry);
    }

    // Pre-create the tables backing the MMIO window and the transient
    // slot, so every future directory shares them through its PDE copy.
    let mut va = VMA_IO;
    while va < VMA_IO + VMA_IO_SPAN {
        leaf_table(dir, VirtAddr::new(va), true)?;
        va += (PAGE_TABLE_ENTRIES * PAGE_SIZE) as u32;
    }
    leaf_table(dir, VirtAddr::new(VMA_TEMP), true)?;

    arch::tlb::load_directory(dir);
    log::info!("vmm: kernel directory at {:#010x}", dir.as_u32());
    Ok(())
}

pub fn kernel_directory() -> PhysAddr {
    PhysAddr::new(KERNEL_DIRECTORY.load(Ordering::Acquire))
}

pub fn current_directory() -> PhysAddr {
    PhysAddr::new(CURRENT_DIRECTORY.load(Ordering::Acquire))
}

/// Switch the active address space.
pub fn switch_address_space(dir: PhysAddr) {
    CURRENT_DIRECTORY.store(dir.as_u32(), Ordering::Release);
    arch::tlb::load_directory(dir);
}

/// Allocate a page directory for a new process: kernel-space entries are
/// copied from the kernel directory, the user half starts empty.
pub fn alloc_page_directory() -> KernelResult<PhysAddr> {
    let dir = alloc_table_page()?;
    let kernel_dir = kernel_directory();
    let kernel_base = directory_index(VirtAddr::new(VMA_KERNEL));
    for index in kernel_base..PAGE_TABLE_ENTRIES {
        set_entry_in(dir, index, entry_in(kernel_dir, index));
    }
    Ok(dir)
}

/// Tear down a directory: user-space tables and their committed frames go
/// back to the buddy; the shared kernel half is left untouched.
pub fn free_page_directory(dir: PhysAddr) -> KernelResult<()> {
    let kernel_base = directory_index(VirtAddr::new(VMA_KERNEL));
    for index in 0..kernel_base {
        let pde = entry_in(dir, index);
        if let Some(table_phys) = pde.frame() {
            for slot in 0..PAGE_TABLE_ENTRIES {
                let entry = entry_in(table_phys, slot);
                if let Some(frame) = entry.frame() {
                    if !entry.flags().contains(PageFlags::FIXED) {
                        super::free_phys_page(frame)?;
                    }
                }
            }
            super::free_phys_page(table_phys)?;
        }
    }
    super::free_phys_page(dir)
}

/// Transient mapping of one physical page at the fixed temporary slot.
/// The previous transient mapping is replaced; callers use the result
/// only until the next call.
pub fn map_physical_page(phys: PhysAddr) -> KernelResult<VirtAddr> {
    let slot = VirtAddr::new(VMA_TEMP);
    let mut entry = PageTableEntry::empty();
    entry.set(
        phys.align_down(),
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::CACHE_DISABLE,
    );
    store_entry(kernel_directory(), slot, entry)?;
    Ok(VirtAddr::new(
        slot.as_u32() + (phys.as_u32() & (PAGE_SIZE as u32 - 1)),
    ))
}

/// Physical address behind a linear address in the current space.
pub fn map_linear_to_physical(addr: VirtAddr) -> KernelResult<PhysAddr> {
    let entry = entry_at(current_directory(), addr).ok_or(KernelError::BadParameter)?;
    let frame = entry.frame().ok_or(KernelError::BadParameter)?;
    Ok(PhysAddr::new(
        frame.as_u32() + (addr.as_u32() & (PAGE_SIZE as u32 - 1)),
    ))
}

/// Precise validity check: directory entry present and table entry
/// present for the page holding `addr`, in the current space.
pub fn is_valid_memory(addr: VirtAddr) -> bool {
    match entry_at(current_directory(), addr) {
        Some(entry) => entry.is_present(),
        None => false,
    }
}

fn page_is_unused(dir: PhysAddr, addr: VirtAddr) -> bool {
    match entry_at(dir, addr) {
        Some(entry) => entry.is_unused(),
        None => true,
    }
}

/// First page-aligned base at or above `start` with `pages` unused pages,
/// below `end`.
fn find_free_run(dir: PhysAddr, start: u32, end: u32, pages: u32) -> KernelResult<u32> {
    let mut base = start & !(PAGE_SIZE as u32 - 1);
    let span = pages * PAGE_SIZE as u32;

    while base.checked_add(span).map(|e| e <= end).unwrap_or(false) {
        let mut run_ok = true;
        let mut probe = base;
        for _ in 0..pages {
            if !page_is_unused(dir, VirtAddr::new(probe)) {
                run_ok = false;
                break;
            }
            probe += PAGE_SIZE as u32;
        }
        if run_ok {
            return Ok(base);
        }
        // Restart just past the conflicting page.
        base = probe + PAGE_SIZE as u32;
    }
    Err(KernelError::OutOfMemory)
}

fn entry_flags(addr: VirtAddr, flags: AllocFlags) -> PageFlags {
    let mut page_flags = PageFlags::empty();
    if flags.contains(AllocFlags::READWRITE) {
        page_flags |= PageFlags::WRITABLE;
    }
    if addr.as_u32() < VMA_KERNEL {
        page_flags |= PageFlags::USER;
    }
    if flags.contains(AllocFlags::UNCACHED) || flags.contains(AllocFlags::IO) {
        page_flags |= PageFlags::CACHE_DISABLE;
    }
    if flags.contains(AllocFlags::WRITE_COMBINE) {
        // No PAT programming; write-combining degrades to write-through
        // with caching disabled.
        page_flags |= PageFlags::CACHE_DISABLE | PageFlags::WRITE_THROUGH;
    }
    if flags.contains(AllocFlags::IO) {
        page_flags |= PageFlags::FIXED;
    }
    page_flags
}

/// Allocate a linear region.
///
/// `base` is the exact base, or a lower bound with `AT_OR_OVER`. `target`
/// is the physical base for `IO` mappings and ignored otherwise. Returns
/// the chosen linear base.
pub fn alloc_region(
    base: VirtAddr,
    target: PhysAddr,
    size: u32,
    flags: AllocFlags,
) -> KernelResult<VirtAddr> {
    if size == 0 {
        return Err(KernelError::BadParameter);
    }
    let pages = size.div_ceil(PAGE_SIZE as u32);
    let dir = current_directory();

    let chosen = if flags.contains(AllocFlags::AT_OR_OVER) {
        let (floor, ceiling) = if base.as_u32() < VMA_KERNEL {
            (base.as_u32().max(VMA_USER), VMA_USER_END)
        } else {
            (base.as_u32(), VMA_TEMP)
        };
        find_free_run(dir, floor, ceiling, pages)?
    } else {
        if !base.is_page_aligned() {
            return Err(KernelError::BadParameter);
        }
        for page in 0..pages {
            let va = VirtAddr::new(base.as_u32() + page * PAGE_SIZE as u32);
            if !page_is_unused(dir, va) {
                return Err(KernelError::Busy);
            }
        }
        base.as_u32()
    };

    for page in 0..pages {
        let va = VirtAddr::new(chosen + page * PAGE_SIZE as u32);
        let mut page_flags = entry_flags(va, flags);
        let mut entry = PageTableEntry::empty();

        if flags.contains(AllocFlags::COMMIT) {
            let frame = if flags.contains(AllocFlags::IO) {
                PhysAddr::new(target.as_u32() + page * PAGE_SIZE as u32)
            } else {
                match super::alloc_phys_page() {
                    Ok(frame) => frame,
                    Err(err) => {
                        // Unwind the partially built region.
                        let _ = free_region(VirtAddr::new(chosen), page * PAGE_SIZE as u32);
                        return Err(err);
                    }
                }
            };
            page_flags |= PageFlags::PRESENT;
            entry.set(frame, page_flags);
        } else {
            page_flags |= PageFlags::RESERVED;
            if flags.contains(AllocFlags::AT_OR_OVER) {
                page_flags |= PageFlags::ON_DEMAND;
            }
            entry.set(PhysAddr::new(0), page_flags);
        }
        store_entry(dir, va, entry)?;
    }

    Ok(VirtAddr::new(chosen))
}

/// Release a linear region: committed frames not marked `FIXED` return to
/// the buddy, every entry is cleared and its TLB line invalidated.
pub fn free_region(base: VirtAddr, size: u32) -> KernelResult<()> {
    if !base.is_page_aligned() {
        return Err(KernelError::BadParameter);
    }
    let pages = size.div_ceil(PAGE_SIZE as u32);
    let dir = current_directory();

    for page in 0..pages {
        let va = VirtAddr::new(base.as_u32() + page * PAGE_SIZE as u32);
        if let Some(entry) = entry_at(dir, va) {
            if let Some(frame) = entry.frame() {
                if !entry.flags().contains(PageFlags::FIXED) {
                    super::free_phys_page(frame)?;
                }
            }
            if !entry.is_unused() {
                store_entry(dir, va, PageTableEntry::empty())?;
            }
        }
    }
    Ok(())
}

/// Map a physical MMIO range uncached and return the linear address of
/// the original (unrounded) offset. The physical range is not owned by
/// the buddy allocator.
pub fn map_io(phys: PhysAddr, size: u32) -> KernelResult<VirtAddr> {
    if size == 0 {
        return Err(KernelError::BadParameter);
    }
    let phys_base = phys.align_down();
    let offset = phys.as_u32() - phys_base.as_u32();
    let span = (size + offset).div_ceil(PAGE_SIZE as u32) * PAGE_SIZE as u32;

    let base = alloc_region(
        VirtAddr::new(VMA_IO),
        phys_base,
        span,
        AllocFlags::COMMIT
            | AllocFlags::READWRITE
            | AllocFlags::UNCACHED
            | AllocFlags::IO
            | AllocFlags::AT_OR_OVER,
    )?;
    Ok(VirtAddr::new(base.as_u32() + offset))
}

/// Reverse of [`map_io`].
pub fn unmap_io(linear: VirtAddr, size: u32) -> KernelResult<()> {
    let base = linear.align_down();
    let offset = linear.as_u32() - base.as_u32();
    let span = (size + offset).div_ceil(PAGE_SIZE as u32) * PAGE_SIZE as u32;
    free_region(base, span)
}

/// Commit a reserved on-demand page after a user fault. Returns the
/// committed frame.
pub fn commit_on_demand(addr: VirtAddr) -> KernelResult<PhysAddr> {
    let dir = current_directory();
    let mut entry = entry_at(dir, addr).ok_or(KernelError::BadParameter)?;
    let flags = entry.flags();
    if entry.is_present() || !flags.contains(PageFlags::RESERVED | PageFlags::ON_DEMAND) {
        return Err(KernelError::BadParameter);
    }
    let frame = super::alloc_phys_page()?;
    unsafe {
        core::ptr::write_bytes(super::phys_to_ptr(frame), 0, PAGE_SIZE);
    }
    entry.commit(frame);
    store_entry(dir, addr.align_down(), entry)?;
    Ok(frame)
}

/// Copy bytes out of the current address space, page by page, so ranges
/// crossing physically discontiguous pages stay correct.
pub fn copy_from_linear(addr: VirtAddr, buffer: &mut [u8]) -> KernelResult<()> {
    let mut va = addr.as_u32();
    let mut done = 0usize;
    while done < buffer.len() {
        let phys = map_linear_to_physical(VirtAddr::new(va))?;
        let in_page = PAGE_SIZE - (phys.as_usize() & (PAGE_SIZE - 1));
        let chunk = in_page.min(buffer.len() - done);
        unsafe {
            core::ptr::copy_nonoverlapping(
                super::phys_to_ptr(phys),
                buffer[done..].as_mut_ptr(),
                chunk,
            );
        }
        va += chunk as u32;
        done += chunk;
    }
    Ok(())
}

/// Copy bytes into the current address space, page by page.
pub fn copy_to_linear(addr: VirtAddr, buffer: &[u8]) -> KernelResult<()> {
    let mut va = addr.as_u32();
    let mut done = 0usize;
    while done < buffer.len() {
        let phys = map_linear_to_physical(VirtAddr::new(va))?;
        let in_page = PAGE_SIZE - (phys.as_usize() & (PAGE_SIZE - 1));
        let chunk = in_page.min(buffer.len() - done);
        unsafe {
            core::ptr::copy_nonoverlapping(
                buffer[done..].as_ptr(),
                super::phys_to_ptr(phys),
                chunk,
            );
        }
        va += chunk as u32;
        done += chunk;
    }
    Ok(())
}

/// Zero a linear range in the current address space.
pub fn zero_linear(addr: VirtAddr, len: u32) -> KernelResult<()> {
    let mut va = addr.as_u32();
    let mut left = len as usize;
    while left > 0 {
        let phys = map_linear_to_physical(VirtAddr::new(va))?;
        let in_page = PAGE_SIZE - (phys.as_usize() & (PAGE_SIZE - 1));
        let chunk = in_page.min(left);
        unsafe {
            core::ptr::write_bytes(super::phys_to_ptr(phys), 0, chunk);
        }
        va += chunk as u32;
        left -= chunk;
    }
    Ok(())
}

/// Typed load through the current address space.
pub fn read_linear<T: Copy>(addr: VirtAddr) -> KernelResult<T> {
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    let buffer = unsafe {
        core::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, core::mem::size_of::<T>())
    };
    copy_from_linear(addr, buffer)?;
    Ok(unsafe { value.assume_init() })
}

/// Typed store through the current address space.
pub fn write_linear<T: Copy>(addr: VirtAddr, value: &T) -> KernelResult<()> {
    let buffer = unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
    };
    copy_to_linear(addr, buffer)
}

#[doc(hidden)]
pub mod testing {
    //! Simulated physical memory for hosted tests: a RAM buffer becomes
    //! the physical window, the buddy allocator is seeded inside it the
    //! way boot does, and the VMM builds its kernel directory on top.

    use alloc::vec;
    use alloc::vec::Vec;

    use super::super::{
        install_allocator, metadata_size, set_phys_window, BuddyAllocator, PAGE_SIZE,
    };

    /// One page worth of storage, aligned like the real physical RAM the
    /// VMM expects to index page tables into.
    #[repr(C, align(4096))]
    #[derive(Clone, Copy)]
    struct SimPage([u8; PAGE_SIZE]);

    pub struct SimRam {
        _storage: Vec<SimPage>,
        pub total_pages: u32,
    }

    pub fn boot(total_pages: u32) -> SimRam {
        let mut storage: Vec<SimPage> = vec![SimPage([0u8; PAGE_SIZE]); total_pages as usize];
        let base = storage.as_mut_ptr() as usize;
        set_phys_window(base);

        let meta = metadata_size(total_pages);
        let allocator =
            unsafe { BuddyAllocator::initialize(base as *mut u8, meta, total_pages) }.unwrap();
        install_allocator(allocator);

        let meta_pages = (meta / PAGE_SIZE) as u32;
        super::super::PAGE_ALLOCATOR
            .lock()
            .as_mut()
            .unwrap()
            .set_range(0, meta_pages, true)
            .unwrap();

        super::init(total_pages).unwrap();
        SimRam {
            _storage: storage,
            total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::used_phys_pages;
    use crate::test_support::TEST_GUARD;

    #[test]
    fn linear_window_and_validity() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);

        let va = VirtAddr::new(VMA_KERNEL + 5 * PAGE_SIZE as u32 + 0x10);
        assert!(is_valid_memory(va));
        assert_eq!(
            map_linear_to_physical(va).unwrap(),
            PhysAddr::new(5 * PAGE_SIZE as u32 + 0x10)
        );
        assert!(!is_valid_memory(VirtAddr::new(0x1000)));
    }

    #[test]
    fn commit_region_round_trip_restores_page_tables() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);

        let used_before = used_phys_pages();
        let base = alloc_region(
            VirtAddr::new(VMA_USER),
            PhysAddr::new(0),
            3 * PAGE_SIZE as u32,
            AllocFlags::COMMIT | AllocFlags::READWRITE | AllocFlags::AT_OR_OVER,
        )
        .unwrap();
        assert!(base.as_u32() >= VMA_USER);
        assert!(is_valid_memory(base));
        assert!(is_valid_memory(base.offset(2 * PAGE_SIZE as u32)));

        // Committed pages are writable through the page walk.
        let pattern = [0xA5u8; 64];
        copy_to_linear(base, &pattern).unwrap();
        let mut back = [0u8; 64];
        copy_from_linear(base, &mut back).unwrap();
        assert_eq!(back, pattern);

        free_region(base, 3 * PAGE_SIZE as u32).unwrap();
        assert!(!is_valid_memory(base));
        // One leaf table for the user range may remain; frames do not.
        assert!(used_phys_pages() <= used_before + 1);
    }

    #[test]
    fn reserve_then_demand_commit() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);

        let base = alloc_region(
            VirtAddr::new(VMA_USER),
            PhysAddr::new(0),
            PAGE_SIZE as u32,
            AllocFlags::READWRITE | AllocFlags::AT_OR_OVER,
        )
        .unwrap();
        assert!(!is_valid_memory(base));

        commit_on_demand(base).unwrap();
        assert!(is_valid_memory(base));

        // A second fault on the same page is a real fault, not a commit.
        assert_eq!(commit_on_demand(base), Err(KernelError::BadParameter));
        free_region(base, PAGE_SIZE as u32).unwrap();
    }

    #[test]
    fn exact_base_conflicts_report_busy() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);

        let base = VirtAddr::new(VMA_USER + 0x10000);
        alloc_region(
            base,
            PhysAddr::new(0),
            PAGE_SIZE as u32,
            AllocFlags::COMMIT | AllocFlags::READWRITE,
        )
        .unwrap();
        assert_eq!(
            alloc_region(
                base,
                PhysAddr::new(0),
                PAGE_SIZE as u32,
                AllocFlags::COMMIT | AllocFlags::READWRITE,
            ),
            Err(KernelError::Busy)
        );
        free_region(base, PAGE_SIZE as u32).unwrap();
    }

    #[test]
    fn map_io_preserves_offset_and_skips_buddy() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);

        let used_before = used_phys_pages();
        // A fake MMIO BAR inside simulated RAM, deliberately unaligned.
        let bar = PhysAddr::new(40 * PAGE_SIZE as u32 + 0x80);
        let va = map_io(bar, 0x1000).unwrap();
        assert_eq!(va.as_u32() & 0xFFF, 0x80);
        assert!(va.as_u32() >= VMA_IO);
        assert!(is_valid_memory(va));
        assert_eq!(map_linear_to_physical(va).unwrap(), bar);

        unmap_io(va, 0x1000).unwrap();
        assert!(!is_valid_memory(va));
        // MMIO frames never entered the buddy.
        assert_eq!(used_phys_pages(), used_before);
    }

    #[test]
    fn fresh_directory_shares_kernel_space() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);

        let dir = alloc_page_directory().unwrap();
        let kernel_va = VirtAddr::new(VMA_KERNEL + 3 * PAGE_SIZE as u32);
        let kernel_index = directory_index(kernel_va);
        assert_eq!(
            entry_in(dir, kernel_index),
            entry_in(kernel_directory(), kernel_index)
        );
        // User half starts empty.
        assert!(entry_in(dir, directory_index(VirtAddr::new(VMA_USER))).is_unused());
        free_page_directory(dir).unwrap();
    }

    #[test]
    fn transient_mapping_tracks_offset() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);

        let va = map_physical_page(PhysAddr::new(7 * PAGE_SIZE as u32 + 0x123)).unwrap();
        assert_eq!(va.as_u32() & 0xFFF, 0x123);
        assert_eq!(
            map_linear_to_physical(va).unwrap(),
            PhysAddr::new(7 * PAGE_SIZE as u32 + 0x123)
        );
    }
}
