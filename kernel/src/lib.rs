//! EXOS kernel library
//!
//! A small x86 protected-mode kernel: buddy physical-page allocator,
//! two-level virtual memory, priority-aging scheduler, blocking mutex,
//! a uniform driver command ABI with PCI attach, the AHCI SATA stack,
//! the file-system mount/dispatch layer and the numbered syscall
//! surface.
//!
//! The crate builds for bare metal and for hosted targets; hardware
//! access is confined to the arch layer so every subsystem's logic runs
//! under the standard test harness.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod bootinfo;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod graphics;
pub mod init;
pub mod list;
pub mod logger;
pub mod mm;
pub mod obj;
pub mod print;
pub mod process;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod time;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand a committed kernel region to the global allocator.
#[cfg(target_os = "none")]
pub fn init_global_heap(start: usize, size: usize) {
    unsafe {
        ALLOCATOR.lock().init(start as *mut u8, size);
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::kprintln!("KERNEL PANIC: {}", info);
    loop {
        #[cfg(target_arch = "x86")]
        arch::halt_until_interrupt();
    }
}

#[doc(hidden)]
pub mod test_support {
    //! Shared serialization for tests that reconfigure global kernel
    //! state (memory window, scheduler, driver and FS registries).

    pub static TEST_GUARD: spin::Mutex<()> = spin::Mutex::new(());
}
