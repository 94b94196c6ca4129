//! Scheduler integration tests
//!
//! Tick-driven scenarios over the real run queues: aging promotion,
//! sleep and wake, freeze, and the queue-membership invariants.

use std::sync::Arc;

use exos_kernel::sched::{
    self, scheduler,
    task::{Task, TASK_PRIORITY_LOWER, TASK_PRIORITY_LOWEST},
    TaskKind, TaskStatus,
};
use exos_kernel::test_support::TEST_GUARD;
use exos_kernel::time;

fn running_task(name: &str, priority: u32) -> Arc<Task> {
    Task::new(name, TaskKind::Kernel, priority, TaskStatus::Running)
}

fn tick() {
    time::tick();
    scheduler::scheduler_tick();
}

#[test]
fn starved_task_is_promoted_and_eventually_runs() {
    let _guard = TEST_GUARD.lock();
    scheduler::reset_for_tests();

    // A sits one priority level above B, so A runs alone at first.
    let a = running_task("A", TASK_PRIORITY_LOWER);
    let b = running_task("B", TASK_PRIORITY_LOWEST);
    scheduler::install_initial_task(a.clone());
    sched::add_task_to_queue(&b).unwrap();

    // Drive selections until B has aged to the threshold. Each slice
    // expiry reselects A and ages B once.
    let mut selections = 0;
    while b.priority() == TASK_PRIORITY_LOWEST {
        assert!(
            Arc::ptr_eq(&scheduler::current_task().unwrap(), &a),
            "A runs alone while B is starved"
        );
        tick();
        selections += 1;
        assert!(selections < 100, "B was never promoted");
    }

    // Promotion added one step and reset the age.
    assert_eq!(b.priority(), TASK_PRIORITY_LOWEST + sched::PRIORITY_STEP);
    assert_eq!(b.age(), 0);

    // B now shares A's level and gets the CPU within two selections.
    let mut b_ran = false;
    for _ in 0..8 {
        tick();
        if Arc::ptr_eq(&scheduler::current_task().unwrap(), &b) {
            b_ran = true;
            break;
        }
    }
    assert!(b_ran, "promoted task was never selected");

    scheduler::reset_for_tests();
}

#[test]
fn scheduler_never_lowers_a_priority() {
    let _guard = TEST_GUARD.lock();
    scheduler::reset_for_tests();

    let a = running_task("A", TASK_PRIORITY_LOWER);
    let b = running_task("B", TASK_PRIORITY_LOWEST);
    scheduler::install_initial_task(a.clone());
    sched::add_task_to_queue(&b).unwrap();

    let mut floor = b.priority();
    for _ in 0..60 {
        tick();
        assert!(b.priority() >= floor, "scheduler demoted a task");
        floor = b.priority();
    }

    // Only an explicit request lowers it again.
    sched::set_task_priority(&b, TASK_PRIORITY_LOWEST);
    assert_eq!(b.priority(), TASK_PRIORITY_LOWEST);

    scheduler::reset_for_tests();
}

#[test]
fn sleepers_wake_on_time_and_not_before() {
    let _guard = TEST_GUARD.lock();
    scheduler::reset_for_tests();

    let main = running_task("main", TASK_PRIORITY_LOWER);
    scheduler::install_initial_task(main);

    let sleeper = running_task("sleeper", TASK_PRIORITY_LOWER);
    sleeper.set_status(TaskStatus::Sleeping);
    sleeper.set_wake_time_ms(time::system_time_ms() + 50);
    sched::add_task_to_queue(&sleeper).unwrap();
    assert_eq!(scheduler::sleeping_count(), 1);

    // Every task still asleep has a wake time in the future.
    for _ in 0..4 {
        tick();
        if sleeper.status() == TaskStatus::Sleeping {
            assert!(sleeper.wake_time_ms() > time::system_time_ms() - 10);
        }
    }
    for _ in 0..4 {
        tick();
    }
    assert_eq!(sleeper.status(), TaskStatus::Running);
    assert_eq!(scheduler::sleeping_count(), 0);

    scheduler::reset_for_tests();
}

#[test]
fn freeze_suppresses_selection_and_wakeups() {
    let _guard = TEST_GUARD.lock();
    scheduler::reset_for_tests();

    let main = running_task("main", TASK_PRIORITY_LOWER);
    scheduler::install_initial_task(main);

    let sleeper = running_task("sleeper", TASK_PRIORITY_LOWER);
    sleeper.set_status(TaskStatus::Sleeping);
    sleeper.set_wake_time_ms(time::system_time_ms() + 10);
    sched::add_task_to_queue(&sleeper).unwrap();

    sched::freeze_scheduler();
    for _ in 0..10 {
        tick();
    }
    // Frozen: the due sleeper stays parked.
    assert_eq!(sleeper.status(), TaskStatus::Sleeping);

    sched::unfreeze_scheduler();
    tick();
    assert_eq!(sleeper.status(), TaskStatus::Running);

    scheduler::reset_for_tests();
}

#[test]
fn freeze_is_counted() {
    let _guard = TEST_GUARD.lock();
    scheduler::reset_for_tests();

    sched::freeze_scheduler();
    sched::freeze_scheduler();
    assert_eq!(scheduler::freeze_count(), 2);
    sched::unfreeze_scheduler();
    assert_eq!(scheduler::freeze_count(), 1);
    sched::unfreeze_scheduler();
    sched::unfreeze_scheduler();
    assert_eq!(scheduler::freeze_count(), 0);

    scheduler::reset_for_tests();
}

#[test]
fn dead_tasks_fall_out_of_the_queues() {
    let _guard = TEST_GUARD.lock();
    scheduler::reset_for_tests();

    let main = running_task("main", TASK_PRIORITY_LOWER);
    scheduler::install_initial_task(main.clone());
    let doomed = running_task("doomed", TASK_PRIORITY_LOWER);
    sched::add_task_to_queue(&doomed).unwrap();
    assert_eq!(scheduler::runnable_count(), 2);

    sched::retire_task(&doomed);
    assert_eq!(doomed.status(), TaskStatus::Dead);
    assert_eq!(scheduler::runnable_count(), 1);

    // Sweeps keep selecting the survivor.
    for _ in 0..6 {
        tick();
        assert!(Arc::ptr_eq(&scheduler::current_task().unwrap(), &main));
    }

    scheduler::reset_for_tests();
}

#[test]
fn at_most_one_running_current() {
    let _guard = TEST_GUARD.lock();
    scheduler::reset_for_tests();

    let a = running_task("A", TASK_PRIORITY_LOWER);
    let b = running_task("B", TASK_PRIORITY_LOWER);
    scheduler::install_initial_task(a.clone());
    sched::add_task_to_queue(&b).unwrap();

    for _ in 0..20 {
        tick();
        // The current pointer is a single task; everything else sits in
        // exactly one queue (enforced by the queue anchors).
        let current = scheduler::current_task().unwrap();
        assert!(Arc::ptr_eq(&current, &a) || Arc::ptr_eq(&current, &b));
        assert_eq!(scheduler::runnable_count(), 2);
    }

    scheduler::reset_for_tests();
}
