//! Page-fault policy
//!
//! A fault taken in kernel mode is fatal: the faulting task and its
//! process are terminated and the exit code recorded. A user fault on a
//! reserved on-demand page commits the page; every other user fault
//! terminates the process.

use super::vmm;
use super::VirtAddr;

/// Exit code recorded for a task killed by a memory fault.
pub const FAULT_EXIT_CODE: u32 = 0xDEAD_0002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    Kernel,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page was committed; the faulting access retries.
    Resolved,
    /// The offender was terminated.
    Killed,
}

pub fn handle_page_fault(address: VirtAddr, write: bool, mode: FaultMode) -> FaultOutcome {
    match mode {
        FaultMode::Kernel => {
            log::error!(
                "kernel page fault at {:#010x} ({})",
                address.as_u32(),
                if write { "write" } else { "read" }
            );
            crate::process::fault_kill_current(FAULT_EXIT_CODE);
            FaultOutcome::Killed
        }
        FaultMode::User => match vmm::commit_on_demand(address.align_down()) {
            Ok(_) => FaultOutcome::Resolved,
            Err(_) => {
                log::warn!(
                    "user fault at {:#010x} outside any on-demand region",
                    address.as_u32()
                );
                crate::process::fault_kill_current(FAULT_EXIT_CODE);
                FaultOutcome::Killed
            }
        },
    }
}
