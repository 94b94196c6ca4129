//! Memory syscalls: regions and the process heap

use crate::error::{KernelError, KernelResult};
use crate::mm::{vmm, PhysAddr, VirtAddr};
use crate::process;
use crate::sched;

use super::{read_payload, AbiHeader};

/// Caller-visible region flag bits.
pub const REGION_COMMIT: u32 = 1 << 0;
pub const REGION_READWRITE: u32 = 1 << 1;
pub const REGION_AT_OR_OVER: u32 = 1 << 2;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RegionPayload {
    pub header: AbiHeader,
    pub base: u32,
    pub size: u32,
    pub flags: u32,
}

fn region_flags(raw: u32) -> vmm::AllocFlags {
    let mut flags = vmm::AllocFlags::empty();
    if raw & REGION_COMMIT != 0 {
        flags |= vmm::AllocFlags::COMMIT;
    }
    if raw & REGION_READWRITE != 0 {
        flags |= vmm::AllocFlags::READWRITE;
    }
    if raw & REGION_AT_OR_OVER != 0 {
        flags |= vmm::AllocFlags::AT_OR_OVER;
    }
    flags
}

/// Allocate a user region in the calling process's space. The uncached
/// and exact-MMIO attributes are kernel-internal and never accepted
/// from user space.
pub fn alloc_region(payload: VirtAddr) -> KernelResult<u32> {
    let request: RegionPayload = read_payload(payload)?;
    if request.base >= crate::mm::VMA_KERNEL {
        return Err(KernelError::NoPermission);
    }
    let base = vmm::alloc_region(
        VirtAddr::new(request.base),
        PhysAddr::new(0),
        request.size,
        region_flags(request.flags),
    )?;
    Ok(base.as_u32())
}

pub fn free_region(payload: VirtAddr) -> KernelResult<u32> {
    let request: RegionPayload = read_payload(payload)?;
    if request.base >= crate::mm::VMA_KERNEL {
        return Err(KernelError::NoPermission);
    }
    vmm::free_region(VirtAddr::new(request.base), request.size)?;
    Ok(0)
}

pub fn get_process_heap(_payload: VirtAddr) -> KernelResult<u32> {
    let process = sched::current_process().ok_or(KernelError::Generic)?;
    Ok(process.heap_base().as_u32())
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct HeapPayload {
    pub header: AbiHeader,
    pub value: u32,
}

pub fn heap_alloc(payload: VirtAddr) -> KernelResult<u32> {
    let request: HeapPayload = read_payload(payload)?;
    let process = sched::current_process().ok_or(KernelError::Generic)?;
    let pointer = process::heap_alloc(&process, request.value)?;
    Ok(pointer.as_u32())
}

pub fn heap_free(payload: VirtAddr) -> KernelResult<u32> {
    let request: HeapPayload = read_payload(payload)?;
    let process = sched::current_process().ok_or(KernelError::Generic)?;
    process::heap_free(&process, VirtAddr::new(request.value))?;
    Ok(0)
}
