//! Process lifecycle
//!
//! Creation loads an executable into a fresh address space and parks a
//! main task; the process only becomes visible once the address space is
//! complete. Killing collects the whole descendant set under the process
//! list before applying the child policy, so a concurrent fork cannot
//! escape it.

use alloc::string::String;
use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::fs;
use crate::mm::{heap, vmm, PhysAddr, VirtAddr, PAGE_SIZE, VMA_USER_END};
use crate::sched::{self, Task, TaskKind, TaskStatus};

use super::loader::{self, ExosImage};
use super::pcb::{Privilege, Process, ProcessFlags};
use super::table;

/// Exit code recorded for processes killed by their parent's death.
pub const KILLED_WITH_PARENT: u32 = 0xDEAD_0001;

/// Default priority for fresh main tasks.
const DEFAULT_TASK_PRIORITY: u32 = crate::sched::task::TASK_PRIORITY_NORMAL;

/// Creation request.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub file_name: String,
    pub command_line: String,
    pub work_folder: String,
    pub privilege: Privilege,
    pub flags: ProcessFlags,
}

fn align_up_page(value: u32) -> u32 {
    (value + (PAGE_SIZE as u32 - 1)) & !(PAGE_SIZE as u32 - 1)
}

/// Build the user address space for `image` inside the current (new)
/// directory: code, data, heap and stack regions, image copy, fixups and
/// the process heap control block.
fn build_user_space(process: &Arc<Process>, image: &ExosImage<'_>) -> KernelResult<u32> {
    let info = &image.info;
    let code_base = VirtAddr::new(info.code_base & !(PAGE_SIZE as u32 - 1));
    let code_span = align_up_page(info.code_base - code_base.as_u32() + info.code_size.max(1));
    vmm::alloc_region(
        code_base,
        PhysAddr::new(0),
        code_span,
        vmm::AllocFlags::COMMIT | vmm::AllocFlags::READWRITE,
    )?;

    let mut data_end = code_base.as_u32() + code_span;
    if info.data_size > 0 {
        let data_base = VirtAddr::new(info.data_base & !(PAGE_SIZE as u32 - 1));
        let data_span = align_up_page(info.data_base - data_base.as_u32() + info.data_size);
        vmm::alloc_region(
            data_base,
            PhysAddr::new(0),
            data_span,
            vmm::AllocFlags::COMMIT | vmm::AllocFlags::READWRITE,
        )?;
        data_end = data_base.as_u32() + data_span;
    }

    loader::load_image(image, VirtAddr::new(info.code_base), VirtAddr::new(info.data_base))?;

    // Heap: the requested span, committed, directly above the image.
    let heap_size = align_up_page(info.heap_requested.max(info.heap_minimum).max(PAGE_SIZE as u32));
    let heap_base = vmm::alloc_region(
        VirtAddr::new(data_end),
        PhysAddr::new(0),
        heap_size,
        vmm::AllocFlags::COMMIT | vmm::AllocFlags::READWRITE | vmm::AllocFlags::AT_OR_OVER,
    )?;
    heap::heap_init(heap_base, heap_size)?;
    process.set_heap(heap_base, heap_size);

    // Stack: requested span near the top of the user range, committed.
    let stack_size = align_up_page(
        info.stack_requested
            .max(info.stack_minimum)
            .max(PAGE_SIZE as u32),
    );
    let stack_base = vmm::alloc_region(
        VirtAddr::new(VMA_USER_END - 64 * 1024 * 1024),
        PhysAddr::new(0),
        stack_size,
        vmm::AllocFlags::COMMIT | vmm::AllocFlags::READWRITE | vmm::AllocFlags::AT_OR_OVER,
    )?;

    Ok(stack_base.as_u32() + stack_size)
}

/// Create a process from an executable file. The main task is parked
/// until the process is published, then enqueued.
pub fn create_process(info: &ProcessInfo) -> KernelResult<Arc<Process>> {
    let bytes = fs::file_read_all(&info.file_name)?;
    let image = loader::parse_image(&bytes)?;

    let parent = sched::current_process().or_else(table::kernel_process);
    let process = Process::new(
        &info.file_name,
        &info.command_line,
        &info.work_folder,
        parent.as_ref(),
        info.privilege,
        info.flags,
    );

    sched::freeze_scheduler();
    let caller_directory = vmm::current_directory();

    let result = (|| -> KernelResult<Arc<Task>> {
        let directory = vmm::alloc_page_directory()?;
        process.set_page_directory(directory);
        vmm::switch_address_space(directory);

        let stack_top = build_user_space(&process, &image)?;

        let task = sched::create_task(
            &info.file_name,
            &process,
            TaskKind::User,
            DEFAULT_TASK_PRIORITY,
            image.info.entry_point,
            TaskStatus::Waiting,
        )?;
        task.context.lock().stack_pointer = stack_top;
        Ok(task)
    })();

    vmm::switch_address_space(caller_directory);
    sched::unfreeze_scheduler();

    match result {
        Ok(task) => {
            table::register_process(&process);
            sched::unblock(&task);
            log::info!(
                "process {} ({}) created",
                process.id(),
                process.file_name()
            );
            Ok(process)
        }
        Err(err) => {
            let directory = process.page_directory();
            if directory.as_u32() != 0 {
                // Tear down whatever part of the space was built.
                let _ = vmm::free_page_directory(directory);
            }
            log::warn!("process creation failed: {}", err);
            Err(err)
        }
    }
}

fn kill_tasks_of(process: &Arc<Process>) {
    for task in process.tasks() {
        sched::retire_task(&task);
        process.detach_task(&task);
    }
}

/// Record why an object died; waiters observe the code afterwards.
pub fn store_termination_state(process: &Arc<Process>, exit_code: u32) {
    process.set_exit_code(exit_code);
    log::debug!(
        "process {} ({}) exit code {:#010x}",
        process.id(),
        process.file_name(),
        exit_code
    );
}

/// Kill a process and apply its child policy: descendants either die
/// with it or are reparented to nobody.
pub fn kill_process(process: &Arc<Process>, exit_code: u32) -> KernelResult<()> {
    if let Some(kernel) = table::kernel_process() {
        if Arc::ptr_eq(&kernel, process) {
            return Err(KernelError::NoPermission);
        }
    }

    sched::freeze_scheduler();

    let descendants = table::descendants_of(process);
    if process.flags().contains(ProcessFlags::KILL_CHILDREN_ON_DEATH) {
        for child in &descendants {
            kill_tasks_of(child);
            store_termination_state(child, KILLED_WITH_PARENT);
            child.mark_dead();
            child.release_objects();
        }
    } else {
        for child in table::children_of(process) {
            child.set_parent(None);
        }
    }

    kill_tasks_of(process);
    store_termination_state(process, exit_code);
    process.mark_dead();
    process.release_objects();

    sched::unfreeze_scheduler();
    Ok(())
}

/// Kill one task. Killing the last task of a non-kernel process marks
/// the process dead.
pub fn kill_task(task: &Arc<Task>) {
    sched::retire_task(task);
    if let Some(process) = task.process() {
        let remaining = process.detach_task(task);
        let is_kernel = table::kernel_process()
            .map(|k| Arc::ptr_eq(&k, &process))
            .unwrap_or(false);
        if remaining == 0 && !is_kernel {
            store_termination_state(&process, task.exit_code());
            process.mark_dead();
        }
    }
}

pub fn suspend_task(task: &Arc<Task>) {
    task.set_status(TaskStatus::Waiting);
    sched::remove_task_from_queue(task);
}

pub fn resume_task(task: &Arc<Task>) {
    sched::unblock(task);
}

/// Block until a process dies, then surface its exit code.
pub fn wait_for_process(process: &Arc<Process>) -> u32 {
    while process.is_alive() {
        sched::yield_now();
    }
    process.exit_code()
}

/// Synchronous convenience: create, then wait for the exit code.
pub fn spawn(command_line: &str, work_folder: &str) -> KernelResult<u32> {
    let file_name = command_line
        .split_whitespace()
        .next()
        .ok_or(KernelError::BadParameter)?;
    let process = create_process(&ProcessInfo {
        file_name: String::from(file_name),
        command_line: String::from(command_line),
        work_folder: String::from(work_folder),
        privilege: Privilege::User,
        flags: ProcessFlags::empty(),
    })?;
    Ok(wait_for_process(&process))
}

/// Termination path for memory faults: the offending task dies, and its
/// process dies with it unless it is the kernel process.
pub fn fault_kill_current(exit_code: u32) {
    let task = match sched::current_task() {
        Some(task) => task,
        None => return,
    };
    task.set_exit_code(exit_code);

    if let Some(process) = task.process() {
        let is_kernel = table::kernel_process()
            .map(|k| Arc::ptr_eq(&k, &process))
            .unwrap_or(false);
        if !is_kernel {
            let _ = kill_process(&process, exit_code);
        }
    }
    kill_task(&task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::scheduler;
    use crate::test_support::TEST_GUARD;

    fn proc(name: &str, parent: Option<&Arc<Process>>, flags: ProcessFlags) -> Arc<Process> {
        let process = Process::new(name, "", "/", parent, Privilege::User, flags);
        table::register_process(&process);
        process
    }

    fn task_for(process: &Arc<Process>) -> Arc<Task> {
        let task = Task::new(
            "worker",
            TaskKind::User,
            DEFAULT_TASK_PRIORITY,
            TaskStatus::Running,
        );
        task.attach_process(process);
        process.attach_task(task.clone());
        let _ = sched::add_task_to_queue(&task);
        task
    }

    fn reset() {
        scheduler::reset_for_tests();
        table::reset_for_tests();
    }

    #[test]
    fn kill_children_policy_takes_the_subtree() {
        let _guard = TEST_GUARD.lock();
        reset();

        let parent = proc("parent", None, ProcessFlags::KILL_CHILDREN_ON_DEATH);
        let child = proc("child", Some(&parent), ProcessFlags::empty());
        let grandchild = proc("grandchild", Some(&child), ProcessFlags::empty());
        let parent_task = task_for(&parent);
        let child_task = task_for(&child);

        kill_process(&parent, 7).unwrap();

        assert!(!parent.is_alive());
        assert!(!child.is_alive());
        assert!(!grandchild.is_alive());
        assert_eq!(parent.exit_code(), 7);
        assert_eq!(child.exit_code(), KILLED_WITH_PARENT);
        assert_eq!(parent_task.status(), TaskStatus::Dead);
        assert_eq!(child_task.status(), TaskStatus::Dead);

        reset();
    }

    #[test]
    fn orphan_policy_reparents_children() {
        let _guard = TEST_GUARD.lock();
        reset();

        let parent = proc("parent", None, ProcessFlags::empty());
        let child = proc("child", Some(&parent), ProcessFlags::empty());

        kill_process(&parent, 0).unwrap();

        assert!(!parent.is_alive());
        assert!(child.is_alive());
        assert!(child.parent().is_none());

        reset();
    }

    #[test]
    fn kernel_process_cannot_be_killed() {
        let _guard = TEST_GUARD.lock();
        reset();

        let kernel = Process::new(
            "kernel",
            "",
            "/",
            None,
            Privilege::Kernel,
            ProcessFlags::KILL_CHILDREN_ON_DEATH,
        );
        // Install once; later tests reuse the singleton.
        let kernel = table::install_kernel_process(kernel);
        assert!(matches!(
            kill_process(&kernel, 1),
            Err(KernelError::NoPermission)
        ));

        reset();
    }

    #[test]
    fn last_task_death_kills_the_process() {
        let _guard = TEST_GUARD.lock();
        reset();

        let process = proc("solo", None, ProcessFlags::empty());
        let task = task_for(&process);
        task.set_exit_code(42);

        kill_task(&task);
        assert!(!process.is_alive());
        assert_eq!(process.exit_code(), 42);
        assert_eq!(sched::scheduler::runnable_count(), 0);

        reset();
    }
}
