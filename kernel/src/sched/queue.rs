//! Scheduler queues
//!
//! Five FIFO run queues indexed by priority group plus one sleep queue.
//! The structure also carries the freeze counter and the slice clock, so
//! the whole scheduler state sits behind one lock.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::list::KernelList;
use crate::time;

use super::task::{Task, TaskStatus, MIN_TIME_SLICE_MS, TASK_PRIORITY_CRITICAL};

/// Number of run-queue levels.
pub const PRIORITY_LEVELS: usize = 5;
/// Priority added when an aged task is promoted.
pub const PRIORITY_STEP: u32 = 0x04;
/// Age at which a runnable task is promoted.
pub const AGE_THRESHOLD: u32 = 5;

/// Run-queue level for a priority byte.
pub fn priority_to_index(priority: u32) -> usize {
    if priority >= TASK_PRIORITY_CRITICAL {
        PRIORITY_LEVELS - 1
    } else {
        (priority >> 2) as usize
    }
}

/// The scheduler's whole mutable state.
pub struct TaskList {
    pub freeze: u32,
    pub scheduler_time: u32,
    pub task_time: u32,
    pub current: Option<Arc<Task>>,
    run_queues: [KernelList<Task>; PRIORITY_LEVELS],
    sleeping: KernelList<Task>,
}

impl TaskList {
    pub const fn new() -> Self {
        Self {
            freeze: 0,
            scheduler_time: 0,
            task_time: MIN_TIME_SLICE_MS,
            current: None,
            run_queues: [
                KernelList::new(),
                KernelList::new(),
                KernelList::new(),
                KernelList::new(),
                KernelList::new(),
            ],
            sleeping: KernelList::new(),
        }
    }

    /// File a task at the tail of its priority's run queue, refreshing its
    /// slice and zeroing its age.
    pub fn add_to_run_queue(&mut self, task: Arc<Task>) {
        let index = priority_to_index(task.priority());
        task.recompute_time_slice();
        task.set_age(0);
        let _ = self.run_queues[index].add_tail(task);
    }

    pub fn remove_from_run_queue(&mut self, task: &Arc<Task>) -> bool {
        let index = priority_to_index(task.priority());
        if self.run_queues[index].remove(task).is_some() {
            return true;
        }
        // The priority may have moved since the task was filed.
        for queue in &mut self.run_queues {
            if queue.remove(task).is_some() {
                return true;
            }
        }
        false
    }

    pub fn add_to_sleep_queue(&mut self, task: Arc<Task>) {
        let _ = self.sleeping.add_tail(task);
    }

    pub fn remove_from_sleep_queue(&mut self, task: &Arc<Task>) -> bool {
        self.sleeping.remove(task).is_some()
    }

    /// File a task by its current status, as queue insertion has always
    /// worked: sleepers to the sleep queue, everything else runnable.
    pub fn enqueue(&mut self, task: Arc<Task>) {
        if task.status() == TaskStatus::Sleeping {
            self.add_to_sleep_queue(task);
        } else {
            self.add_to_run_queue(task);
        }
    }

    /// Remove a task from whichever queue holds it.
    pub fn dequeue(&mut self, task: &Arc<Task>) -> bool {
        if task.status() == TaskStatus::Sleeping {
            if self.remove_from_sleep_queue(task) {
                return true;
            }
        }
        if self.remove_from_run_queue(task) {
            return true;
        }
        self.remove_from_sleep_queue(task)
    }

    /// Move every task whose wake time has passed back to its run queue.
    pub fn wake_sleeping_tasks(&mut self) {
        let now = time::system_time_ms();
        let due: Vec<Arc<Task>> = self
            .sleeping
            .iter()
            .filter(|task| now >= task.wake_time_ms())
            .cloned()
            .collect();
        for task in due {
            self.sleeping.remove(&task);
            task.set_status(TaskStatus::Running);
            self.add_to_run_queue(task);
        }
    }

    /// Pop the head of the highest non-empty run queue.
    pub fn pop_next(&mut self) -> Option<Arc<Task>> {
        for index in (0..PRIORITY_LEVELS).rev() {
            if let Some(task) = self.run_queues[index].pop_head() {
                return Some(task);
            }
        }
        None
    }

    /// Age every runnable task except the one just selected; promote a
    /// task one step (re-filed at the tail of its new level) once its age
    /// reaches the threshold, never past the priority cap.
    pub fn age_runnable_tasks(&mut self, selected: &Arc<Task>) {
        let mut promoted: Vec<Arc<Task>> = Vec::new();
        for queue in &self.run_queues {
            for task in queue.iter() {
                if Arc::ptr_eq(task, selected) {
                    continue;
                }
                let age = task.bump_age();
                if age >= AGE_THRESHOLD && task.priority() < super::task::MAX_PRIORITY {
                    promoted.push(task.clone());
                }
            }
        }
        for task in promoted {
            self.remove_from_run_queue(&task);
            task.set_priority(task.priority() + PRIORITY_STEP);
            task.set_age(0);
            self.add_to_run_queue(task);
        }
    }

    /// Refresh every runnable task's slice after a priority change.
    pub fn update_time_slices(&mut self) {
        for queue in &self.run_queues {
            for task in queue.iter() {
                task.recompute_time_slice();
            }
        }
    }

    pub fn runnable_count(&self) -> usize {
        self.run_queues.iter().map(|q| q.len()).sum()
    }

    pub fn sleeping_count(&self) -> usize {
        self.sleeping.len()
    }

    pub fn run_queue_tasks(&self, level: usize) -> Vec<Arc<Task>> {
        self.run_queues[level].iter().cloned().collect()
    }
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::{TaskKind, TASK_PRIORITY_HIGHEST, TASK_PRIORITY_LOWEST};

    fn task(priority: u32) -> Arc<Task> {
        Task::new("q", TaskKind::Kernel, priority, TaskStatus::Running)
    }

    #[test]
    fn priority_grouping() {
        assert_eq!(priority_to_index(0x00), 0);
        assert_eq!(priority_to_index(0x04), 1);
        assert_eq!(priority_to_index(0x0F), 3);
        assert_eq!(priority_to_index(TASK_PRIORITY_HIGHEST), 4);
        assert_eq!(priority_to_index(0xFF), 4);
    }

    #[test]
    fn pop_prefers_higher_levels() {
        let mut list = TaskList::new();
        let low = task(TASK_PRIORITY_LOWEST);
        let high = task(TASK_PRIORITY_HIGHEST);
        list.add_to_run_queue(low.clone());
        list.add_to_run_queue(high.clone());

        let first = list.pop_next().unwrap();
        assert!(Arc::ptr_eq(&first, &high));
        let second = list.pop_next().unwrap();
        assert!(Arc::ptr_eq(&second, &low));
        assert!(list.pop_next().is_none());
    }

    #[test]
    fn fifo_within_a_level() {
        let mut list = TaskList::new();
        let a = task(0x04);
        let b = task(0x04);
        list.add_to_run_queue(a.clone());
        list.add_to_run_queue(b.clone());

        assert!(Arc::ptr_eq(&list.pop_next().unwrap(), &a));
        assert!(Arc::ptr_eq(&list.pop_next().unwrap(), &b));
    }

    #[test]
    fn aging_promotes_after_threshold() {
        let mut list = TaskList::new();
        let runner = task(0x04);
        let starved = task(TASK_PRIORITY_LOWEST);
        list.add_to_run_queue(runner.clone());
        list.add_to_run_queue(starved.clone());

        for _ in 0..AGE_THRESHOLD {
            list.age_runnable_tasks(&runner);
        }
        assert_eq!(starved.priority(), TASK_PRIORITY_LOWEST + PRIORITY_STEP);
        assert_eq!(starved.age(), 0);
        // The selected task is never aged.
        assert_eq!(runner.age(), 0);
    }

    #[test]
    fn aging_respects_the_cap() {
        let mut list = TaskList::new();
        let runner = task(0x04);
        let capped = task(TASK_PRIORITY_HIGHEST);
        list.add_to_run_queue(runner.clone());
        list.add_to_run_queue(capped.clone());

        for _ in 0..AGE_THRESHOLD * 3 {
            list.age_runnable_tasks(&runner);
        }
        assert_eq!(capped.priority(), TASK_PRIORITY_HIGHEST);
    }

    #[test]
    fn wake_moves_due_sleepers() {
        let mut list = TaskList::new();
        let sleeper = task(0x08);
        sleeper.set_status(TaskStatus::Sleeping);
        sleeper.set_wake_time_ms(0);
        list.enqueue(sleeper.clone());
        assert_eq!(list.sleeping_count(), 1);

        list.wake_sleeping_tasks();
        assert_eq!(list.sleeping_count(), 0);
        assert_eq!(list.runnable_count(), 1);
        assert_eq!(sleeper.status(), TaskStatus::Running);
    }

    #[test]
    fn a_task_is_in_at_most_one_queue() {
        let mut list = TaskList::new();
        let t = task(0x08);
        list.add_to_run_queue(t.clone());
        // A second insertion is refused by the anchor.
        list.add_to_run_queue(t.clone());
        assert_eq!(list.runnable_count(), 1);

        assert!(list.dequeue(&t));
        assert!(!list.dequeue(&t));
    }
}
