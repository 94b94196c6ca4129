//! Processes
//!
//! Address-space ownership, the process table, lifecycle policy and the
//! executable loader.

pub mod lifecycle;
pub mod loader;
pub mod pcb;
pub mod table;

use alloc::sync::Arc;

use crate::error::KernelResult;
use crate::mm::{heap, VirtAddr};
use crate::sched::{self, TaskKind, TaskStatus};
use crate::sync::INFINITY;

pub use lifecycle::{
    create_process, fault_kill_current, kill_process, kill_task, resume_task, spawn,
    store_termination_state, suspend_task, wait_for_process, ProcessInfo,
};
pub use loader::{ExecutableInfo, ExosImage};
pub use pcb::{Permissions, Privilege, Process, ProcessFlags, ProcessId, ProcessStatus, Security};
pub use table::{children_of, find_process, kernel_process};

/// Create the distinguished kernel process and its initial task, and
/// make that task current. The kernel heap is attached separately once
/// its region exists.
pub fn init_kernel_process() -> KernelResult<Arc<Process>> {
    let process = Process::new(
        "kernel",
        "",
        "/",
        None,
        Privilege::Kernel,
        ProcessFlags::KILL_CHILDREN_ON_DEATH,
    );
    process.set_page_directory(crate::mm::vmm::kernel_directory());
    let process = table::install_kernel_process(process);

    let task = sched::create_task(
        "kernel-main",
        &process,
        TaskKind::KernelMain,
        crate::sched::task::TASK_PRIORITY_LOWER,
        0,
        TaskStatus::Waiting,
    )?;
    sched::install_initial_task(task);
    Ok(process)
}

/// Allocate from a process heap under its heap mutex.
pub fn heap_alloc(process: &Arc<Process>, size: u32) -> KernelResult<VirtAddr> {
    process.heap_mutex.lock(INFINITY)?;
    let result = heap::heap_alloc_at(process.heap_base(), process.heap_size(), size);
    process.heap_mutex.unlock()?;
    result
}

/// Free into a process heap under its heap mutex.
pub fn heap_free(process: &Arc<Process>, pointer: VirtAddr) -> KernelResult<()> {
    process.heap_mutex.lock(INFINITY)?;
    let result = heap::heap_free_at(process.heap_base(), pointer);
    process.heap_mutex.unlock()?;
    result
}
