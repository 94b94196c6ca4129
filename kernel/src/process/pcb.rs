//! Process control block

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex as SpinMutex;

use crate::list::{ListAnchor, Listed};
use crate::mm::{PhysAddr, VirtAddr};
use crate::obj::{KernelObject, ObjectHeader, ObjectKind};
use crate::sync::KMutex;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_PROCESS_ID: AtomicU32 = AtomicU32::new(1);

fn next_process_id() -> ProcessId {
    ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::AcqRel))
}

/// Ring-style privilege. Lower values dominate higher ones.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privilege {
    Kernel = 0,
    Drivers = 1,
    Routines = 2,
    User = 3,
}

impl Privilege {
    /// True when this privilege is at least as strong as `required`.
    pub fn dominates(self, required: Privilege) -> bool {
        (self as u32) <= (required as u32)
    }
}

bitflags! {
    /// Three-bit permission set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        const EXECUTE = 1 << 0;
        const READ    = 1 << 1;
        const WRITE   = 1 << 2;
    }
}

/// Ownership and permission record attached to securable objects.
#[derive(Debug, Clone)]
pub struct Security {
    pub owner: u64,
    pub user_permissions: Vec<(u64, Permissions)>,
    pub default_permissions: Permissions,
}

impl Security {
    pub fn kernel_default() -> Self {
        Self {
            owner: 0,
            user_permissions: Vec::new(),
            default_permissions: Permissions::EXECUTE | Permissions::READ | Permissions::WRITE,
        }
    }

    /// Effective permissions for a user: an explicit grant wins, the
    /// default applies otherwise.
    pub fn permissions_for(&self, user: u64) -> Permissions {
        self.user_permissions
            .iter()
            .find(|(grantee, _)| *grantee == user)
            .map(|(_, permissions)| *permissions)
            .unwrap_or(self.default_permissions)
    }
}

impl Default for Security {
    fn default() -> Self {
        Self::kernel_default()
    }
}

bitflags! {
    /// Process creation/behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcessFlags: u32 {
        const KILL_CHILDREN_ON_DEATH = 1 << 0;
    }
}

/// Process life state.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Alive = 1,
    Dead = 2,
}

/// Process control block.
pub struct Process {
    header: ObjectHeader,
    anchor: ListAnchor,
    id: ProcessId,
    /// Guards the structure itself.
    pub mutex: KMutex,
    /// Guards heap allocation within the process.
    pub heap_mutex: KMutex,
    security: SpinMutex<Security>,
    privilege: Privilege,
    flags: ProcessFlags,
    status: AtomicU32,
    page_directory: AtomicU32,
    heap_base: AtomicU32,
    heap_size: AtomicU32,
    file_name: String,
    command_line: String,
    work_folder: SpinMutex<String>,
    parent: SpinMutex<Weak<Process>>,
    objects: SpinMutex<Vec<Arc<dyn KernelObject>>>,
    tasks: SpinMutex<Vec<Arc<crate::sched::task::Task>>>,
    task_count: AtomicU32,
    session: u32,
    exit_code: AtomicU32,
}

impl Process {
    pub fn new(
        file_name: &str,
        command_line: &str,
        work_folder: &str,
        parent: Option<&Arc<Process>>,
        privilege: Privilege,
        flags: ProcessFlags,
    ) -> Arc<Process> {
        let session = parent.map(|p| p.session).unwrap_or(0);
        Arc::new(Process {
            header: ObjectHeader::new(ObjectKind::Process),
            anchor: ListAnchor::new(),
            id: next_process_id(),
            mutex: KMutex::new(),
            heap_mutex: KMutex::new(),
            security: SpinMutex::new(Security::kernel_default()),
            privilege,
            flags,
            status: AtomicU32::new(ProcessStatus::Alive as u32),
            page_directory: AtomicU32::new(0),
            heap_base: AtomicU32::new(0),
            heap_size: AtomicU32::new(0),
            file_name: String::from(file_name),
            command_line: String::from(command_line),
            work_folder: SpinMutex::new(String::from(work_folder)),
            parent: SpinMutex::new(parent.map(Arc::downgrade).unwrap_or_default()),
            objects: SpinMutex::new(Vec::new()),
            tasks: SpinMutex::new(Vec::new()),
            task_count: AtomicU32::new(0),
            session,
            exit_code: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn work_folder(&self) -> String {
        self.work_folder.lock().clone()
    }

    pub fn set_work_folder(&self, folder: &str) {
        *self.work_folder.lock() = String::from(folder);
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    pub fn flags(&self) -> ProcessFlags {
        self.flags
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn status(&self) -> ProcessStatus {
        match self.status.load(Ordering::Acquire) {
            2 => ProcessStatus::Dead,
            _ => ProcessStatus::Alive,
        }
    }

    pub fn mark_dead(&self) {
        self.status
            .store(ProcessStatus::Dead as u32, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.status() == ProcessStatus::Alive
    }

    pub fn security(&self) -> Security {
        self.security.lock().clone()
    }

    pub fn set_security(&self, security: Security) {
        *self.security.lock() = security;
    }

    pub fn page_directory(&self) -> PhysAddr {
        PhysAddr::new(self.page_directory.load(Ordering::Acquire))
    }

    pub fn set_page_directory(&self, directory: PhysAddr) {
        self.page_directory
            .store(directory.as_u32(), Ordering::Release);
    }

    pub fn heap_base(&self) -> VirtAddr {
        VirtAddr::new(self.heap_base.load(Ordering::Acquire))
    }

    pub fn heap_size(&self) -> u32 {
        self.heap_size.load(Ordering::Acquire)
    }

    pub fn set_heap(&self, base: VirtAddr, size: u32) {
        self.heap_base.store(base.as_u32(), Ordering::Release);
        self.heap_size.store(size, Ordering::Release);
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().upgrade()
    }

    pub fn set_parent(&self, parent: Option<&Arc<Process>>) {
        *self.parent.lock() = parent.map(Arc::downgrade).unwrap_or_default();
    }

    /// Record an owned kernel object; the process list is the strong edge.
    pub fn adopt_object(&self, object: Arc<dyn KernelObject>) {
        self.objects.lock().push(object);
    }

    pub fn owned_object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Drop every owned object reference during teardown.
    pub fn release_objects(&self) {
        self.objects.lock().clear();
    }

    pub fn task_count(&self) -> u32 {
        self.task_count.load(Ordering::Acquire)
    }

    /// Take a strong edge to a task of this process. The process's task
    /// list is the owning collection for its tasks.
    pub fn attach_task(&self, task: Arc<crate::sched::task::Task>) {
        self.tasks.lock().push(task);
        self.task_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop the strong edge to a task; returns the remaining task count.
    pub fn detach_task(&self, task: &Arc<crate::sched::task::Task>) -> u32 {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|candidate| !Arc::ptr_eq(candidate, task));
        if tasks.len() < before {
            self.task_count.fetch_sub(1, Ordering::AcqRel);
        }
        self.task_count.load(Ordering::Acquire)
    }

    pub fn tasks(&self) -> Vec<Arc<crate::sched::task::Task>> {
        self.tasks.lock().clone()
    }

    pub fn exit_code(&self) -> u32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub fn set_exit_code(&self, code: u32) {
        self.exit_code.store(code, Ordering::Release);
    }
}

impl Listed for Process {
    fn anchor(&self) -> &ListAnchor {
        &self.anchor
    }
}

impl KernelObject for Process {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}
