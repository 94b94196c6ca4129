//! Counted, task-owned blocking lock
//!
//! Recursive for the owning task, strict for everyone else. Waiters are
//! FIFO, and release hands ownership to the head waiter before that task
//! runs again, so a late arrival can never barge past a parked one.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::error::{KernelError, KernelResult};
use crate::obj::{KernelObject, ObjectHeader, ObjectKind};
use crate::sched::{self, Task, TaskId, TaskStatus};
use crate::time;

/// Timeout value meaning "block until acquired".
pub const INFINITY: u32 = u32::MAX;

struct MutexState {
    owner: Option<TaskId>,
    recursion: u32,
    waiters: VecDeque<Arc<Task>>,
}

/// Blocking mutex visible to tasks.
pub struct KMutex {
    header: ObjectHeader,
    state: SpinMutex<MutexState>,
}

impl KMutex {
    pub fn new() -> Self {
        Self {
            header: ObjectHeader::new(ObjectKind::Mutex),
            state: SpinMutex::new(MutexState {
                owner: None,
                recursion: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Heap-allocated variant.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Dropping a held mutex is refused.
    pub fn delete(&self) -> KernelResult<()> {
        let state = self.state.lock();
        if state.owner.is_some() {
            return Err(KernelError::Busy);
        }
        drop(state);
        self.header.release();
        Ok(())
    }

    fn current_id() -> Option<TaskId> {
        sched::current_task().map(|task| task.id())
    }

    /// Non-blocking acquisition attempt.
    pub fn try_lock(&self) -> bool {
        let me = Self::current_id();
        let mut state = self.state.lock();
        match state.owner {
            None => {
                // Before the scheduler runs, the boot path owns locks
                // anonymously.
                state.owner = Some(me.unwrap_or(TaskId(0)));
                state.recursion = 1;
                true
            }
            Some(owner) if me == Some(owner) => {
                state.recursion += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Acquire, blocking up to `timeout_ms` milliseconds ([`INFINITY`]
    /// blocks until acquired). Timeouts are honored to tick granularity.
    pub fn lock(&self, timeout_ms: u32) -> KernelResult<()> {
        if self.try_lock() {
            return Ok(());
        }

        let task = match sched::current_task() {
            Some(task) => task,
            // No scheduler yet and the lock is held: nothing can release
            // it while we spin, so report the contention.
            None => return Err(KernelError::Busy),
        };

        {
            let mut state = self.state.lock();
            // Re-check under the state lock; the owner may just have left.
            if state.owner.is_none() {
                state.owner = Some(task.id());
                state.recursion = 1;
                return Ok(());
            }
            state.waiters.push_back(task.clone());
        }

        let deadline = if timeout_ms == INFINITY {
            None
        } else {
            Some(time::system_time_ms() + timeout_ms as u64)
        };

        sched::block_current();

        loop {
            {
                let state = self.state.lock();
                if state.owner == Some(task.id()) {
                    drop(state);
                    // The hand-off may have happened before we parked;
                    // make sure the task is runnable either way.
                    sched::unblock(&task);
                    return Ok(());
                }
            }

            if task.status() == TaskStatus::Dead {
                // Killed while parked: leave the queue without acquiring.
                self.drop_waiter(task.id());
                return Err(KernelError::Generic);
            }

            if let Some(deadline) = deadline {
                if time::system_time_ms() >= deadline {
                    self.drop_waiter(task.id());
                    sched::unblock(&task);
                    return Err(KernelError::Timeout);
                }
            }

            sched::yield_now();
        }
    }

    fn drop_waiter(&self, id: TaskId) {
        let mut state = self.state.lock();
        state.waiters.retain(|waiter| waiter.id() != id);
    }

    /// Release one level of ownership. At the outermost level ownership
    /// moves to the first live waiter and that task is woken.
    pub fn unlock(&self) -> KernelResult<()> {
        let me = Self::current_id();
        let mut state = self.state.lock();

        let owner = state.owner.ok_or(KernelError::Generic)?;
        if let Some(me) = me {
            if me != owner && owner != TaskId(0) {
                return Err(KernelError::NoPermission);
            }
        }

        if state.recursion > 1 {
            state.recursion -= 1;
            return Ok(());
        }

        while let Some(next) = state.waiters.pop_front() {
            if next.status() == TaskStatus::Dead {
                continue;
            }
            state.owner = Some(next.id());
            state.recursion = 1;
            drop(state);
            sched::unblock(&next);
            return Ok(());
        }

        state.owner = None;
        state.recursion = 0;
        Ok(())
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.state.lock().owner
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Run a closure under the lock; kernel-internal convenience.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> KernelResult<R> {
        self.lock(INFINITY)?;
        let result = f();
        self.unlock()?;
        Ok(result)
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelObject for KMutex {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{scheduler, TaskKind};
    use crate::test_support::TEST_GUARD;

    fn with_current_task<R>(f: impl FnOnce(Arc<Task>) -> R) -> R {
        let _guard = TEST_GUARD.lock();
        scheduler::reset_for_tests();
        let task = Task::new(
            "mutex-test",
            TaskKind::Kernel,
            crate::sched::task::TASK_PRIORITY_NORMAL,
            TaskStatus::Running,
        );
        scheduler::install_initial_task(task.clone());
        let result = f(task);
        scheduler::reset_for_tests();
        result
    }

    #[test]
    fn recursive_lock_counts() {
        with_current_task(|task| {
            let mutex = KMutex::new();
            mutex.lock(INFINITY).unwrap();
            mutex.lock(INFINITY).unwrap();
            assert_eq!(mutex.owner(), Some(task.id()));

            mutex.unlock().unwrap();
            assert!(mutex.is_held());
            mutex.unlock().unwrap();
            assert!(!mutex.is_held());
        });
    }

    #[test]
    fn delete_fails_while_held() {
        with_current_task(|_| {
            let mutex = KMutex::new();
            mutex.lock(INFINITY).unwrap();
            assert_eq!(mutex.delete(), Err(KernelError::Busy));
            mutex.unlock().unwrap();
            mutex.delete().unwrap();
        });
    }

    #[test]
    fn foreign_owner_times_out() {
        with_current_task(|_| {
            let mutex = KMutex::new();
            // Simulate another task holding the lock.
            mutex.state.lock().owner = Some(TaskId(0xFFFF));
            mutex.state.lock().recursion = 1;

            let begin = time::system_time_ms();
            assert_eq!(mutex.lock(30), Err(KernelError::Timeout));
            assert!(time::system_time_ms() >= begin + 30);
            // The failed waiter left the queue.
            assert!(mutex.state.lock().waiters.is_empty());
        });
    }

    #[test]
    fn unlock_by_non_owner_is_refused() {
        with_current_task(|_| {
            let mutex = KMutex::new();
            mutex.state.lock().owner = Some(TaskId(0xFFFF));
            assert_eq!(mutex.unlock(), Err(KernelError::NoPermission));
        });
    }

    #[test]
    fn release_hands_off_to_fifo_head() {
        with_current_task(|me| {
            let mutex = KMutex::new();
            mutex.lock(INFINITY).unwrap();

            let first = Task::new("w1", TaskKind::Kernel, 0x08, TaskStatus::Waiting);
            let second = Task::new("w2", TaskKind::Kernel, 0x08, TaskStatus::Waiting);
            mutex.state.lock().waiters.push_back(first.clone());
            mutex.state.lock().waiters.push_back(second.clone());

            mutex.unlock().unwrap();
            // Ownership moved to the head waiter before it ran.
            assert_eq!(mutex.owner(), Some(first.id()));
            assert_eq!(first.status(), TaskStatus::Running);
            assert_eq!(second.status(), TaskStatus::Waiting);
            assert_ne!(mutex.owner(), Some(me.id()));
        });
    }

    #[test]
    fn dead_waiters_are_skipped() {
        with_current_task(|_| {
            let mutex = KMutex::new();
            mutex.lock(INFINITY).unwrap();

            let dead = Task::new("dead", TaskKind::Kernel, 0x08, TaskStatus::Dead);
            let live = Task::new("live", TaskKind::Kernel, 0x08, TaskStatus::Waiting);
            mutex.state.lock().waiters.push_back(dead.clone());
            mutex.state.lock().waiters.push_back(live.clone());

            mutex.unlock().unwrap();
            assert_eq!(mutex.owner(), Some(live.id()));
            assert_eq!(dead.status(), TaskStatus::Dead);
        });
    }
}
