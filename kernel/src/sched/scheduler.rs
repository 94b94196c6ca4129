//! Scheduler core
//!
//! Timer-driven selection over the run queues: on slice expiry the head
//! of the highest non-empty level runs next and is re-filed at the tail
//! of its level, every other runnable task ages, and starved tasks are
//! promoted one level. A counted freeze suppresses the whole tick body,
//! which is the critical-section primitive used around address-space
//! switches and partial process construction.

use alloc::sync::Arc;

use spin::Mutex;

use crate::arch;
use crate::error::{KernelError, KernelResult};
use crate::list::Listed;
use crate::obj::{KernelObject, ObjectKind};
use crate::time::{self, TICK_MS};

use super::queue::TaskList;
use super::task::{Task, TaskStatus};

static SCHEDULER: Mutex<TaskList> = Mutex::new(TaskList::new());

/// Install the initial kernel task and make it current.
pub fn install_initial_task(task: Arc<Task>) {
    let mut sched = SCHEDULER.lock();
    task.set_status(TaskStatus::Running);
    sched.add_to_run_queue(task.clone());
    sched.task_time = task.time_slice_ms();
    sched.current = Some(task);
}

pub fn current_task() -> Option<Arc<Task>> {
    SCHEDULER.lock().current.clone()
}

/// One timer tick (10 ms granularity).
pub fn scheduler_tick() {
    let mut switch_to: Option<Arc<Task>> = None;

    {
        let mut sched = SCHEDULER.lock();
        sched.scheduler_time += TICK_MS as u32;

        if sched.freeze > 0 {
            return;
        }

        sched.wake_sleeping_tasks();

        if sched.scheduler_time >= sched.task_time {
            sched.scheduler_time = 0;

            loop {
                let next = match sched.pop_next() {
                    Some(task) => task,
                    None => break,
                };

                match next.status() {
                    TaskStatus::Running => {
                        sched.add_to_run_queue(next.clone());
                        sched.task_time = next.time_slice_ms();
                        sched.current = Some(next.clone());
                        sched.age_runnable_tasks(&next);
                        switch_to = Some(next);
                        break;
                    }
                    TaskStatus::Sleeping => {
                        sched.add_to_sleep_queue(next);
                    }
                    // Dead, waiting or freed tasks fall out of the queues
                    // here, on the sweep after their state changed.
                    _ => {}
                }
            }
        }
    }

    // The switch runs outside the scheduler lock.
    if let Some(task) = switch_to {
        arch::context::switch_to(&task);
    }
}

/// Counted preemption freeze.
pub fn freeze_scheduler() {
    SCHEDULER.lock().freeze += 1;
}

pub fn unfreeze_scheduler() {
    let mut sched = SCHEDULER.lock();
    if sched.freeze > 0 {
        sched.freeze -= 1;
    }
}

pub fn freeze_count() -> u32 {
    SCHEDULER.lock().freeze
}

/// File a task into the queue matching its status.
pub fn add_task_to_queue(task: &Arc<Task>) -> KernelResult<()> {
    if !task.header().is_valid(ObjectKind::Task) {
        return Err(KernelError::BadParameter);
    }
    freeze_scheduler();
    SCHEDULER.lock().enqueue(task.clone());
    unfreeze_scheduler();
    Ok(())
}

/// Remove a task from whichever queue holds it.
pub fn remove_task_from_queue(task: &Arc<Task>) -> bool {
    freeze_scheduler();
    let removed = SCHEDULER.lock().dequeue(task);
    unfreeze_scheduler();
    removed
}

/// Explicit priority change; the only path that may lower a priority.
pub fn set_task_priority(task: &Arc<Task>, priority: u32) {
    let mut sched = SCHEDULER.lock();
    let queued = sched.remove_from_run_queue(task);
    task.set_priority(priority);
    if queued {
        sched.add_to_run_queue(task.clone());
    } else {
        task.recompute_time_slice();
    }
    sched.update_time_slices();
}

/// Give up the CPU until the next tick.
#[cfg(target_os = "none")]
pub fn yield_now() {
    arch::halt_until_interrupt();
}

/// Hosted builds have no timer interrupt; the tick is driven
/// synthetically so blocking primitives make progress.
#[cfg(not(target_os = "none"))]
pub fn yield_now() {
    time::tick();
    scheduler_tick();
}

/// Sleep for at least `ms` milliseconds. Cancellable only by killing the
/// task.
pub fn sleep(ms: u32) {
    let task = match current_task() {
        Some(task) => task,
        None => return,
    };

    task.set_wake_time_ms(time::system_time_ms() + ms as u64);
    task.set_status(TaskStatus::Sleeping);
    {
        let mut sched = SCHEDULER.lock();
        sched.remove_from_run_queue(&task);
        sched.add_to_sleep_queue(task.clone());
    }

    loop {
        match task.status() {
            TaskStatus::Sleeping => yield_now(),
            _ => break,
        }
    }
}

/// Move the current task to `Waiting` and take it out of the run queues.
/// Used by blocking primitives; the caller parks until woken.
pub fn block_current() -> Option<Arc<Task>> {
    let task = current_task()?;
    task.set_status(TaskStatus::Waiting);
    SCHEDULER.lock().remove_from_run_queue(&task);
    Some(task)
}

/// Wake a blocked or suspended task.
pub fn unblock(task: &Arc<Task>) {
    task.set_status(TaskStatus::Running);
    let mut sched = SCHEDULER.lock();
    if !task.anchor().is_linked() {
        sched.add_to_run_queue(task.clone());
    }
}

/// Mark a task dead and drop it from every queue. Sleeping tasks never
/// wake; waiters are unlinked without acquiring anything.
pub fn retire_task(task: &Arc<Task>) {
    task.set_status(TaskStatus::Dead);
    SCHEDULER.lock().dequeue(task);
}

pub fn runnable_count() -> usize {
    SCHEDULER.lock().runnable_count()
}

pub fn sleeping_count() -> usize {
    SCHEDULER.lock().sleeping_count()
}

/// Run a closure against the scheduler state; diagnostics and tests only.
pub fn with_task_list<R>(f: impl FnOnce(&mut TaskList) -> R) -> R {
    f(&mut SCHEDULER.lock())
}

#[doc(hidden)]
pub fn reset_for_tests() {
    let mut sched = SCHEDULER.lock();
    *sched = TaskList::new();
}
