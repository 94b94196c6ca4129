//! Global process list
//!
//! The registry every lifecycle operation walks. The list mutex is held
//! across whole traversals (descendant collection in particular) so a
//! concurrent fork cannot slip a child in half way through a kill.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::list::KernelList;

use super::pcb::{Process, ProcessId};

static PROCESS_LIST: Mutex<KernelList<Process>> = Mutex::new(KernelList::new());
static KERNEL_PROCESS: Once<Arc<Process>> = Once::new();

/// Install the distinguished kernel process singleton.
pub fn install_kernel_process(process: Arc<Process>) -> Arc<Process> {
    KERNEL_PROCESS.call_once(|| process.clone());
    let _ = PROCESS_LIST.lock().add_tail(process.clone());
    process
}

pub fn kernel_process() -> Option<Arc<Process>> {
    KERNEL_PROCESS.get().cloned()
}

/// Publish a process into the global list.
pub fn register_process(process: &Arc<Process>) {
    let _ = PROCESS_LIST.lock().add_tail(process.clone());
}

pub fn unregister_process(process: &Arc<Process>) -> bool {
    PROCESS_LIST.lock().remove(process).is_some()
}

pub fn process_count() -> usize {
    PROCESS_LIST.lock().len()
}

pub fn find_process(id: ProcessId) -> Option<Arc<Process>> {
    PROCESS_LIST
        .lock()
        .iter()
        .find(|process| process.id() == id)
        .cloned()
}

/// Snapshot of the registered processes, in registration order.
pub fn all_processes() -> Vec<Arc<Process>> {
    PROCESS_LIST.lock().iter().cloned().collect()
}

/// Direct children of `parent`, resolved through the weak back-edges.
pub fn children_of(parent: &Arc<Process>) -> Vec<Arc<Process>> {
    PROCESS_LIST
        .lock()
        .iter()
        .filter(|candidate| {
            candidate
                .parent()
                .map(|p| Arc::ptr_eq(&p, parent))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Transitive descendants of `root`, collected while the list lock is
/// held so the set is consistent.
pub fn descendants_of(root: &Arc<Process>) -> Vec<Arc<Process>> {
    let list = PROCESS_LIST.lock();
    let mut found: Vec<Arc<Process>> = Vec::new();
    let mut frontier: Vec<Arc<Process>> = alloc::vec![root.clone()];

    while let Some(current) = frontier.pop() {
        for candidate in list.iter() {
            let is_child = candidate
                .parent()
                .map(|p| Arc::ptr_eq(&p, &current))
                .unwrap_or(false);
            if is_child && !found.iter().any(|f| Arc::ptr_eq(f, candidate)) {
                found.push(candidate.clone());
                frontier.push(candidate.clone());
            }
        }
    }
    found
}

#[doc(hidden)]
pub fn reset_for_tests() {
    PROCESS_LIST.lock().reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pcb::{Privilege, ProcessFlags};
    use crate::test_support::TEST_GUARD;

    fn proc(name: &str, parent: Option<&Arc<Process>>) -> Arc<Process> {
        Process::new(name, "", "/", parent, Privilege::User, ProcessFlags::empty())
    }

    #[test]
    fn descendants_are_transitive() {
        let _guard = TEST_GUARD.lock();
        reset_for_tests();

        let root = proc("root", None);
        let child = proc("child", Some(&root));
        let grandchild = proc("grandchild", Some(&child));
        let stranger = proc("stranger", None);

        register_process(&root);
        register_process(&child);
        register_process(&grandchild);
        register_process(&stranger);

        let descendants = descendants_of(&root);
        assert_eq!(descendants.len(), 2);
        assert!(descendants.iter().any(|p| Arc::ptr_eq(p, &child)));
        assert!(descendants.iter().any(|p| Arc::ptr_eq(p, &grandchild)));

        reset_for_tests();
    }

    #[test]
    fn find_by_id() {
        let _guard = TEST_GUARD.lock();
        reset_for_tests();

        let p = proc("find-me", None);
        register_process(&p);
        assert!(find_process(p.id()).is_some());
        assert!(unregister_process(&p));
        assert!(find_process(p.id()).is_none());

        reset_for_tests();
    }
}
