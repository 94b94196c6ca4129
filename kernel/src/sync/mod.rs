//! Blocking synchronization primitives
//!
//! Kernel-internal structures use `spin` locks; task-visible locks go
//! through [`mutex::KMutex`], which parks the calling task.
//!
//! Nesting order when more than one subsystem lock is needed:
//! schedule, then process, then task, then file system, then file,
//! then per-object mutexes. Memory allocation that may park must never
//! run under the schedule lock.

pub mod mutex;

pub use mutex::{KMutex, INFINITY};
