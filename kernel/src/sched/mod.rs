//! Task scheduling
//!
//! Multi-level run queues with aging, a sleep queue and a counted freeze.

pub mod queue;
pub mod scheduler;
pub mod task;

use alloc::sync::Arc;

use crate::error::KernelResult;

pub use queue::{priority_to_index, AGE_THRESHOLD, PRIORITY_LEVELS, PRIORITY_STEP};
pub use scheduler::{
    add_task_to_queue, block_current, current_task, freeze_scheduler, install_initial_task,
    remove_task_from_queue, retire_task, scheduler_tick, set_task_priority, sleep, unblock,
    unfreeze_scheduler, yield_now,
};
pub use task::{Task, TaskContext, TaskId, TaskKind, TaskStatus};

/// Current task's process, when there is one.
pub fn current_process() -> Option<Arc<crate::process::Process>> {
    current_task().and_then(|task| task.process())
}

/// Create a task bound to a process. The task starts in the given status
/// and is filed into the scheduler queues unless it is parked waiting.
pub fn create_task(
    name: &str,
    process: &Arc<crate::process::Process>,
    kind: TaskKind,
    priority: u32,
    entry_point: u32,
    status: TaskStatus,
) -> KernelResult<Arc<Task>> {
    let task = Task::new(name, kind, priority, status);
    task.attach_process(process);
    task.context.lock().entry_point = entry_point;
    process.attach_task(task.clone());

    if status != TaskStatus::Waiting {
        add_task_to_queue(&task)?;
    }
    Ok(task)
}
