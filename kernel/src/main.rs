//! Bare-metal kernel entry

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod entry {
    use exos_kernel::bootinfo::BootInfo;

    /// The boot loader lands here with paging already enabled and the
    /// kernel mapped high.
    #[no_mangle]
    pub extern "C" fn kmain(boot_info: &'static BootInfo<'static>) -> ! {
        if let Err(err) = exos_kernel::init::kernel_init(boot_info) {
            exos_kernel::kprintln!("kernel init failed: {}", err);
        }
        exos_kernel::init::idle_loop()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel binary only has meaning on bare metal; hosted builds
    // exercise the library through the test suites.
}
