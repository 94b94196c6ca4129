//! Kernel object prelude
//!
//! Every kernel-visible object carries a common header: a runtime kind tag,
//! a strong reference count and a weak back-reference to the owning process.
//! Polymorphic use checks the kind tag before trusting a handle, the same
//! way every downcast in the original object model did.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::process::Process;

/// Runtime object kind.
///
/// The discriminants are stable; they travel through the handle table and
/// show up in diagnostics.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    None = 0,
    Process = 1,
    Task = 2,
    Mutex = 3,
    File = 4,
    FileSystem = 5,
    Driver = 6,
    Disk = 7,
    PciDevice = 8,
    GraphicsContext = 9,
    Brush = 10,
    Pen = 11,
    IoControl = 12,
    Security = 13,
    Message = 14,
    Desktop = 15,
    Window = 16,
    Heap = 17,
}

impl ObjectKind {
    fn from_u32(raw: u32) -> ObjectKind {
        match raw {
            1 => ObjectKind::Process,
            2 => ObjectKind::Task,
            3 => ObjectKind::Mutex,
            4 => ObjectKind::File,
            5 => ObjectKind::FileSystem,
            6 => ObjectKind::Driver,
            7 => ObjectKind::Disk,
            8 => ObjectKind::PciDevice,
            9 => ObjectKind::GraphicsContext,
            10 => ObjectKind::Brush,
            11 => ObjectKind::Pen,
            12 => ObjectKind::IoControl,
            13 => ObjectKind::Security,
            14 => ObjectKind::Message,
            15 => ObjectKind::Desktop,
            16 => ObjectKind::Window,
            17 => ObjectKind::Heap,
            _ => ObjectKind::None,
        }
    }
}

/// Common object header composed into every concrete kernel object.
pub struct ObjectHeader {
    kind: AtomicU32,
    references: AtomicU32,
    owner: Mutex<Weak<Process>>,
}

impl ObjectHeader {
    /// New header with one reference and no owning process.
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind: AtomicU32::new(kind as u32),
            references: AtomicU32::new(1),
            owner: Mutex::new(Weak::new()),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        ObjectKind::from_u32(self.kind.load(Ordering::Acquire))
    }

    /// True when the header still carries the expected kind tag.
    pub fn is_valid(&self, kind: ObjectKind) -> bool {
        self.kind() == kind
    }

    pub fn references(&self) -> u32 {
        self.references.load(Ordering::Acquire)
    }

    pub fn add_reference(&self) -> u32 {
        self.references.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference; returns the remaining count. At zero the kind
    /// tag is cleared so stale handles fail the validity check.
    pub fn release(&self) -> u32 {
        let before = self.references.load(Ordering::Acquire);
        if before == 0 {
            return 0;
        }
        let after = self.references.fetch_sub(1, Ordering::AcqRel) - 1;
        if after == 0 {
            self.kind.store(ObjectKind::None as u32, Ordering::Release);
        }
        after
    }

    pub fn owner(&self) -> Option<Arc<Process>> {
        self.owner.lock().upgrade()
    }

    pub fn set_owner(&self, process: &Arc<Process>) {
        *self.owner.lock() = Arc::downgrade(process);
    }

    pub fn clear_owner(&self) {
        *self.owner.lock() = Weak::new();
    }
}

/// Implemented by every concrete kernel object.
pub trait KernelObject: Send + Sync {
    fn header(&self) -> &ObjectHeader;

    fn kind(&self) -> ObjectKind {
        self.header().kind()
    }
}

/// Opaque handle surfaced to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Handle(pub u32);

impl Handle {
    pub const INVALID: Handle = Handle(0);
}

/// Closed set of objects reachable through the handle table.
#[derive(Clone)]
pub enum HandleTarget {
    File(Arc<crate::fs::file::File>),
    Process(Arc<Process>),
    Task(Arc<crate::sched::task::Task>),
    Mutex(Arc<crate::sync::mutex::KMutex>),
}

struct HandleTable {
    next: u32,
    entries: alloc::collections::BTreeMap<u32, HandleTarget>,
}

static HANDLES: Mutex<Option<HandleTable>> = Mutex::new(None);

/// Register an object and hand back its opaque handle.
pub fn publish_handle(target: HandleTarget) -> Handle {
    let mut guard = HANDLES.lock();
    let table = guard.get_or_insert_with(|| HandleTable {
        next: 1,
        entries: alloc::collections::BTreeMap::new(),
    });
    let id = table.next;
    table.next = table.next.wrapping_add(1).max(1);
    table.entries.insert(id, target);
    Handle(id)
}

/// Resolve a handle, if it is still live.
pub fn resolve_handle(handle: Handle) -> Option<HandleTarget> {
    let guard = HANDLES.lock();
    guard.as_ref().and_then(|t| t.entries.get(&handle.0).cloned())
}

/// Drop a handle-table entry. The object itself lives on while other
/// strong references exist.
pub fn release_handle(handle: Handle) -> bool {
    let mut guard = HANDLES.lock();
    guard
        .as_mut()
        .map(|t| t.entries.remove(&handle.0).is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_release_clears_kind() {
        let header = ObjectHeader::new(ObjectKind::File);
        assert!(header.is_valid(ObjectKind::File));
        assert_eq!(header.add_reference(), 2);
        assert_eq!(header.release(), 1);
        assert!(header.is_valid(ObjectKind::File));
        assert_eq!(header.release(), 0);
        assert!(!header.is_valid(ObjectKind::File));
        assert_eq!(header.kind(), ObjectKind::None);
    }

    #[test]
    fn release_on_dead_header_is_a_no_op() {
        let header = ObjectHeader::new(ObjectKind::Mutex);
        assert_eq!(header.release(), 0);
        assert_eq!(header.release(), 0);
        assert_eq!(header.kind(), ObjectKind::None);
    }
}
