//! Kernel-wide error types
//!
//! Every surface of the kernel (drivers, file systems, memory manager,
//! syscalls) reports failures from the same code space so that results can
//! cross the driver ABI without translation.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Unspecified logical failure
    Generic,
    /// Invalid input: null handle, out of range, wrong object kind
    BadParameter,
    /// Operation denied by flags or security
    NoPermission,
    /// Heap or physical-page allocation refused
    OutOfMemory,
    /// Hardware wait deadline exceeded
    Timeout,
    /// Resource in use
    Busy,
    /// Device reported a task-file or protocol error
    Hardware,
    /// No matching device present
    NoDevice,
    /// Driver does not support this function
    NotImplemented,
    /// Enumeration exhausted
    NoMore,
    /// Filesystem-specific failure
    Fs(FsError),
}

/// Filesystem error detail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    BadSector,
    NoSpace,
    CantReadSector,
    CantWriteSector,
}

impl KernelError {
    /// Signed value surfaced to user space by the syscall layer.
    pub fn code(self) -> i32 {
        match self {
            KernelError::Generic => -1,
            KernelError::BadParameter => -2,
            KernelError::NoPermission => -3,
            KernelError::OutOfMemory => -4,
            KernelError::Timeout => -5,
            KernelError::Busy => -6,
            KernelError::Hardware => -7,
            KernelError::NoDevice => -8,
            KernelError::NotImplemented => -9,
            KernelError::NoMore => -10,
            KernelError::Fs(FsError::BadSector) => -20,
            KernelError::Fs(FsError::NoSpace) => -21,
            KernelError::Fs(FsError::CantReadSector) => -22,
            KernelError::Fs(FsError::CantWriteSector) => -23,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Generic => write!(f, "unspecified failure"),
            KernelError::BadParameter => write!(f, "bad parameter"),
            KernelError::NoPermission => write!(f, "permission denied"),
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::Timeout => write!(f, "timeout"),
            KernelError::Busy => write!(f, "resource busy"),
            KernelError::Hardware => write!(f, "hardware error"),
            KernelError::NoDevice => write!(f, "no device"),
            KernelError::NotImplemented => write!(f, "not implemented"),
            KernelError::NoMore => write!(f, "no more entries"),
            KernelError::Fs(e) => write!(f, "filesystem error: {e}"),
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::BadSector => write!(f, "bad sector"),
            FsError::NoSpace => write!(f, "no space on volume"),
            FsError::CantReadSector => write!(f, "cannot read sector"),
            FsError::CantWriteSector => write!(f, "cannot write sector"),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        KernelError::Fs(err)
    }
}

/// Common result alias used across the kernel.
pub type KernelResult<T> = core::result::Result<T, KernelError>;
