//! File objects and the open-file cache
//!
//! An open file is unique per `(name, owner task, open flags)`: opening
//! the same tuple again bumps the existing object's reference count
//! instead of allocating a new node, and a matching number of closes
//! runs the filesystem's close handler exactly once.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex as SpinMutex;

use crate::list::{KernelList, ListAnchor, Listed};
use crate::obj::{KernelObject, ObjectHeader, ObjectKind};
use crate::process::Security;
use crate::sched::TaskId;
use crate::sync::KMutex;

use super::FileSystem;

bitflags! {
    /// Open mode and disposition flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ          = 1 << 0;
        const WRITE         = 1 << 1;
        const EXISTING      = 1 << 2;
        const CREATE_ALWAYS = 1 << 3;
        const TRUNCATE      = 1 << 4;
        const APPEND        = 1 << 5;
    }
}

/// Generic file attributes.
pub const FS_ATTR_FOLDER: u32 = 0x0001;
pub const FS_ATTR_READONLY: u32 = 0x0002;
pub const FS_ATTR_HIDDEN: u32 = 0x0004;
pub const FS_ATTR_SYSTEM: u32 = 0x0008;

#[derive(Debug, Clone, Copy, Default)]
pub struct FileTimes {
    pub created: u64,
    pub accessed: u64,
    pub modified: u64,
}

/// Driver-private location state attached to an open file.
pub enum FsNode {
    None,
    Ext2 { record: usize },
    Xfs(super::xfs::XfsLocation),
}

/// One open file.
pub struct File {
    header: ObjectHeader,
    anchor: ListAnchor,
    pub mutex: KMutex,
    pub file_system: Arc<FileSystem>,
    security: SpinMutex<Security>,
    owner_task: SpinMutex<Option<TaskId>>,
    open_flags: SpinMutex<OpenFlags>,
    attributes: AtomicU32,
    size: AtomicU64,
    position: AtomicU64,
    times: SpinMutex<FileTimes>,
    name: SpinMutex<String>,
    pub node: SpinMutex<FsNode>,
}

impl File {
    /// Fresh file object as an FS driver builds it; the dispatcher
    /// stamps owner and flags afterwards.
    pub fn new(file_system: Arc<FileSystem>, name: &str, node: FsNode) -> Arc<File> {
        Arc::new(File {
            header: ObjectHeader::new(ObjectKind::File),
            anchor: ListAnchor::new(),
            mutex: KMutex::new(),
            file_system,
            security: SpinMutex::new(Security::kernel_default()),
            owner_task: SpinMutex::new(None),
            open_flags: SpinMutex::new(OpenFlags::empty()),
            attributes: AtomicU32::new(0),
            size: AtomicU64::new(0),
            position: AtomicU64::new(0),
            times: SpinMutex::new(FileTimes::default()),
            name: SpinMutex::new(String::from(name)),
            node: SpinMutex::new(node),
        })
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// The dispatcher re-stamps the name with the caller's full spelling
    /// so the open-file cache keys on what was actually asked for.
    pub fn set_name(&self, name: &str) {
        *self.name.lock() = String::from(name);
    }

    pub fn owner_task(&self) -> Option<TaskId> {
        *self.owner_task.lock()
    }

    pub fn set_owner_task(&self, task: Option<TaskId>) {
        *self.owner_task.lock() = task;
    }

    pub fn open_flags(&self) -> OpenFlags {
        *self.open_flags.lock()
    }

    pub fn set_open_flags(&self, flags: OpenFlags) {
        *self.open_flags.lock() = flags;
    }

    pub fn attributes(&self) -> u32 {
        self.attributes.load(Ordering::Acquire)
    }

    pub fn set_attributes(&self, attributes: u32) {
        self.attributes.store(attributes, Ordering::Release);
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    pub fn times(&self) -> FileTimes {
        *self.times.lock()
    }

    pub fn touch_modified(&self, now: u64) {
        let mut times = self.times.lock();
        times.modified = now;
        times.accessed = now;
    }

    pub fn touch_accessed(&self, now: u64) {
        self.times.lock().accessed = now;
    }

    pub fn security(&self) -> Security {
        self.security.lock().clone()
    }

    pub fn references(&self) -> u32 {
        self.header.references()
    }

    pub fn add_reference(&self) -> u32 {
        self.header.add_reference()
    }

    pub fn release_reference(&self) -> u32 {
        self.header.release()
    }
}

impl Listed for File {
    fn anchor(&self) -> &ListAnchor {
        &self.anchor
    }
}

impl KernelObject for File {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

/// The open-file list.
pub(super) static OPEN_FILES: SpinMutex<KernelList<File>> = SpinMutex::new(KernelList::new());

/// Look up a currently-open file by the identity tuple.
pub(super) fn find_open_file(
    name: &str,
    owner: Option<TaskId>,
    flags: OpenFlags,
) -> Option<Arc<File>> {
    OPEN_FILES
        .lock()
        .iter()
        .find(|file| {
            file.name() == name && file.owner_task() == owner && file.open_flags() == flags
        })
        .cloned()
}

pub(super) fn insert_open_file(file: &Arc<File>) {
    let _ = OPEN_FILES.lock().add_tail(file.clone());
}

pub(super) fn remove_open_file(file: &Arc<File>) -> bool {
    OPEN_FILES.lock().remove(file).is_some()
}

/// Snapshot of the open files, for enumeration and diagnostics.
pub fn open_files() -> Vec<Arc<File>> {
    OPEN_FILES.lock().iter().cloned().collect()
}

#[doc(hidden)]
pub fn reset_open_files_for_tests() {
    OPEN_FILES.lock().reset();
}
