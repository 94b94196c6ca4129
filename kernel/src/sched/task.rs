//! Task control block
//!
//! A task is the unit of scheduling. Its process back-reference is weak;
//! the strong edges are held by the scheduler queues and the process's
//! object list.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::list::{ListAnchor, Listed};
use crate::obj::{Handle, KernelObject, ObjectHeader, ObjectKind};
use crate::process::Process;

/// Task priority bytes. Two high bits of the low nibble group priorities
/// into the five scheduler levels.
pub const TASK_PRIORITY_LOWEST: u32 = 0x00;
pub const TASK_PRIORITY_LOWER: u32 = 0x04;
pub const TASK_PRIORITY_NORMAL: u32 = 0x08;
pub const TASK_PRIORITY_HIGH: u32 = 0x0C;
pub const TASK_PRIORITY_HIGHEST: u32 = 0x10;
pub const TASK_PRIORITY_CRITICAL: u32 = 0x10;

/// Aging never raises a task beyond this priority.
pub const MAX_PRIORITY: u32 = TASK_PRIORITY_HIGHEST;

/// Smallest time slice handed to a task, in milliseconds.
pub const MIN_TIME_SLICE_MS: u32 = 20;

/// Task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(1);

fn next_task_id() -> TaskId {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::AcqRel))
}

/// Task status machine. Only the scheduler moves tasks between `Running`
/// and the queues; blocking primitives move a running task to `Waiting`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Free = 0,
    Running = 1,
    Waiting = 2,
    Sleeping = 3,
    WaitMessage = 4,
    Dead = 0xFF,
}

impl TaskStatus {
    fn from_u32(raw: u32) -> TaskStatus {
        match raw {
            1 => TaskStatus::Running,
            2 => TaskStatus::Waiting,
            3 => TaskStatus::Sleeping,
            4 => TaskStatus::WaitMessage,
            0xFF => TaskStatus::Dead,
            _ => TaskStatus::Free,
        }
    }
}

/// Task flavor: the distinguished initial kernel task, kernel workers,
/// and user tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    KernelMain,
    Kernel,
    User,
}

/// A queued inter-task message.
#[derive(Debug, Clone)]
pub struct Message {
    pub target: Handle,
    pub message: u32,
    pub time: u64,
    pub param1: u32,
    pub param2: u32,
}

/// Saved execution state. The arch layer fills this on a context switch;
/// hosted builds only carry the entry point.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskContext {
    pub entry_point: u32,
    pub stack_pointer: u32,
    pub stack_base: u32,
    pub stack_size: u32,
}

/// Task control block.
pub struct Task {
    header: ObjectHeader,
    anchor: ListAnchor,
    id: TaskId,
    name: String,
    kind: TaskKind,
    process: Mutex<Weak<Process>>,
    status: AtomicU32,
    priority: AtomicU32,
    age: AtomicU32,
    time_slice_ms: AtomicU32,
    wake_time_ms: AtomicU64,
    exit_code: AtomicU32,
    last_error: AtomicI32,
    pub context: Mutex<TaskContext>,
    messages: Mutex<VecDeque<Message>>,
}

impl Task {
    pub fn new(name: &str, kind: TaskKind, priority: u32, status: TaskStatus) -> Arc<Task> {
        Arc::new(Task {
            header: ObjectHeader::new(ObjectKind::Task),
            anchor: ListAnchor::new(),
            id: next_task_id(),
            name: String::from(name),
            kind,
            process: Mutex::new(Weak::new()),
            status: AtomicU32::new(status as u32),
            priority: AtomicU32::new(priority),
            age: AtomicU32::new(0),
            time_slice_ms: AtomicU32::new(MIN_TIME_SLICE_MS),
            wake_time_ms: AtomicU64::new(0),
            exit_code: AtomicU32::new(0),
            last_error: AtomicI32::new(0),
            context: Mutex::new(TaskContext::default()),
            messages: Mutex::new(VecDeque::new()),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u32(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u32, Ordering::Release);
    }

    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Release);
    }

    pub fn age(&self) -> u32 {
        self.age.load(Ordering::Acquire)
    }

    pub fn set_age(&self, age: u32) {
        self.age.store(age, Ordering::Release);
    }

    pub fn bump_age(&self) -> u32 {
        self.age.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Time slice derived from the priority byte, floored at 20 ms.
    pub fn recompute_time_slice(&self) -> u32 {
        let slice = ((self.priority() & 0xFF) * 2).max(MIN_TIME_SLICE_MS);
        self.time_slice_ms.store(slice, Ordering::Release);
        slice
    }

    pub fn time_slice_ms(&self) -> u32 {
        self.time_slice_ms.load(Ordering::Acquire)
    }

    pub fn wake_time_ms(&self) -> u64 {
        self.wake_time_ms.load(Ordering::Acquire)
    }

    pub fn set_wake_time_ms(&self, at: u64) {
        self.wake_time_ms.store(at, Ordering::Release);
    }

    pub fn exit_code(&self) -> u32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub fn set_exit_code(&self, code: u32) {
        self.exit_code.store(code, Ordering::Release);
    }

    pub fn last_error(&self) -> i32 {
        self.last_error.load(Ordering::Acquire)
    }

    pub fn set_last_error(&self, code: i32) {
        self.last_error.store(code, Ordering::Release);
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.lock().upgrade()
    }

    pub fn attach_process(&self, process: &Arc<Process>) {
        *self.process.lock() = Arc::downgrade(process);
        self.header.set_owner(process);
    }

    /// Queue a message and report whether the task was waiting for one.
    pub fn post_message(&self, message: Message) -> bool {
        self.messages.lock().push_back(message);
        self.status() == TaskStatus::WaitMessage
    }

    pub fn take_message(&self) -> Option<Message> {
        self.messages.lock().pop_front()
    }

    pub fn peek_message(&self) -> Option<Message> {
        self.messages.lock().front().cloned()
    }
}

impl Listed for Task {
    fn anchor(&self) -> &ListAnchor {
        &self.anchor
    }
}

impl KernelObject for Task {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}
