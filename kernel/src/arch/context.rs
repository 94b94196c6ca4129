//! Context switching
//!
//! The scheduler hands over the next task here. The switch loads the
//! task's address space and, on bare metal, swaps the kernel stack and
//! instruction pointer; hosted builds track only the address space so
//! scheduling logic stays observable in tests.

use alloc::sync::Arc;

use crate::mm::vmm;
use crate::sched::task::Task;

/// Make `task` the running task.
pub fn switch_to(task: &Arc<Task>) {
    if let Some(process) = task.process() {
        let directory = process.page_directory();
        if directory.as_u32() != 0 && directory != vmm::current_directory() {
            vmm::switch_address_space(directory);
        }
    }

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let context = task.context.lock();
        if context.stack_pointer != 0 {
            let esp = context.stack_pointer;
            drop(context);
            unsafe {
                // The saved frame was pushed by the previous switch-out;
                // restoring ESP resumes the task after its own switch.
                switch_stack(esp);
            }
        }
    }
}

/// Swap to a previously saved kernel stack.
///
/// # Safety
///
/// `esp` must point at a switch frame produced by this module on a
/// live kernel stack of the target task.
#[cfg(all(target_arch = "x86", target_os = "none"))]
unsafe fn switch_stack(esp: u32) {
    unsafe {
        core::arch::asm!(
            "mov esp, {0}",
            "pop ebp",
            "pop edi",
            "pop esi",
            "pop ebx",
            "ret",
            in(reg) esp,
            options(noreturn)
        );
    }
}
