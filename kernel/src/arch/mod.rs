//! Architecture layer
//!
//! Thin wrappers around protected-mode x86 instructions. Every wrapper
//! compiles on hosted targets as a no-op (or an "absent hardware"
//! value) so the rest of the kernel builds and tests off-target.

pub mod context;
pub mod port;
pub mod tlb;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

/// Busy-wait roughly `spins` iterations; used for short hardware
/// settle delays.
pub fn spin_delay(spins: u32) {
    for _ in 0..spins {
        core::hint::spin_loop();
    }
}

/// Run a closure with interrupts disabled, restoring the previous state.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let flags: u32;
    unsafe {
        core::arch::asm!("pushfd; pop {}", out(reg) flags, options(nomem, preserves_flags));
        core::arch::asm!("cli", options(nomem, nostack));
    }
    let result = f();
    if flags & (1 << 9) != 0 {
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }
    }
    result
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// Sleep the CPU until the next interrupt.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn halt_until_interrupt() {
    unsafe {
        core::arch::asm!("sti; hlt", options(nomem, nostack));
    }
}
