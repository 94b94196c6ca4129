//! Process heap
//!
//! First-fit allocator over a linear region `[heap_base, heap_base +
//! heap_size)`. Bookkeeping is a chain of control blocks living inside
//! the heap itself, each holding a fixed array of `{base, size, used}`
//! entries. Freed entries keep their base and are reused first; fresh
//! allocations extend past the high-water mark, growing the chain with a
//! new in-line control block when every entry slot is taken.
//!
//! All accesses go through the current address space, so the same code
//! serves the kernel heap and user process heaps.

use super::vmm::{read_linear, write_linear, zero_linear};
use super::VirtAddr;
use crate::error::{KernelError, KernelResult};

const HEAP_MAGIC: u32 = 0x4845_4150;

/// Allocation entries per control block.
pub const HEAP_NUM_ENTRIES: usize = 64;

#[repr(C)]
#[derive(Clone, Copy)]
struct HeapEntry {
    base: u32,
    size: u32,
    used: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct HeapControl {
    id: u32,
    next: u32,
    entries: [HeapEntry; HEAP_NUM_ENTRIES],
}

const CONTROL_SIZE: u32 = core::mem::size_of::<HeapControl>() as u32;

/// Write an empty control block at `base`, making the region a valid heap.
pub fn heap_init(base: VirtAddr, size: u32) -> KernelResult<()> {
    if size <= CONTROL_SIZE {
        return Err(KernelError::BadParameter);
    }
    let control = HeapControl {
        id: HEAP_MAGIC,
        next: 0,
        entries: [HeapEntry {
            base: 0,
            size: 0,
            used: 0,
        }; HEAP_NUM_ENTRIES],
    };
    write_linear(base, &control)
}

/// Allocate `size` bytes from the heap at `heap_base`. Returns a zeroed
/// block.
pub fn heap_alloc_at(heap_base: VirtAddr, heap_size: u32, size: u32) -> KernelResult<VirtAddr> {
    if size == 0 {
        return Err(KernelError::BadParameter);
    }

    let mut block_va = heap_base;
    let mut block: HeapControl = read_linear(block_va)?;
    if block.id != HEAP_MAGIC {
        return Err(KernelError::BadParameter);
    }

    let mut high_block = heap_base.as_u32() + CONTROL_SIZE;

    // Reuse a freed entry large enough for the request.
    loop {
        for index in 0..HEAP_NUM_ENTRIES {
            let entry = block.entries[index];
            if entry.used == 0 && entry.base != 0 && entry.size >= size {
                block.entries[index].used = 1;
                block.entries[index].size = size;
                write_linear(block_va, &block)?;
                zero_linear(VirtAddr::new(entry.base), size)?;
                return Ok(VirtAddr::new(entry.base));
            }
            if entry.base + entry.size > high_block {
                high_block = entry.base + entry.size;
            }
        }

        if block.next == 0 {
            break;
        }
        block_va = VirtAddr::new(block.next);
        block = read_linear(block_va)?;
        if block_va.as_u32() + CONTROL_SIZE > high_block {
            high_block = block_va.as_u32() + CONTROL_SIZE;
        }
    }

    // Extend past the high-water mark.
    if high_block + size > heap_base.as_u32() + heap_size {
        return Err(KernelError::OutOfMemory);
    }

    block_va = heap_base;
    block = read_linear(block_va)?;

    loop {
        for index in 0..HEAP_NUM_ENTRIES {
            let entry = block.entries[index];
            if entry.used == 0 && entry.base == 0 {
                block.entries[index] = HeapEntry {
                    base: high_block,
                    size,
                    used: 1,
                };
                write_linear(block_va, &block)?;
                zero_linear(VirtAddr::new(high_block), size)?;
                return Ok(VirtAddr::new(high_block));
            }
        }

        if block.next == 0 {
            // Every slot taken: chain a new control block in-line.
            if high_block + CONTROL_SIZE + size > heap_base.as_u32() + heap_size {
                return Err(KernelError::OutOfMemory);
            }
            block.next = high_block;
            write_linear(block_va, &block)?;

            let fresh = HeapControl {
                id: HEAP_MAGIC,
                next: 0,
                entries: [HeapEntry {
                    base: 0,
                    size: 0,
                    used: 0,
                }; HEAP_NUM_ENTRIES],
            };
            write_linear(VirtAddr::new(high_block), &fresh)?;
            high_block += CONTROL_SIZE;
        }

        block_va = VirtAddr::new(block.next);
        block = read_linear(block_va)?;
    }
}

/// Return a block to the heap. Unknown pointers are ignored.
pub fn heap_free_at(heap_base: VirtAddr, pointer: VirtAddr) -> KernelResult<()> {
    if pointer.as_u32() == 0 {
        return Ok(());
    }

    let mut block_va = heap_base;
    loop {
        let mut block: HeapControl = read_linear(block_va)?;
        if block.id != HEAP_MAGIC {
            return Err(KernelError::BadParameter);
        }
        for index in 0..HEAP_NUM_ENTRIES {
            let entry = block.entries[index];
            if entry.base == pointer.as_u32() && entry.used == 1 {
                block.entries[index].used = 0;
                return write_linear(block_va, &block);
            }
        }
        if block.next == 0 {
            return Ok(());
        }
        block_va = VirtAddr::new(block.next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::vmm::testing;
    use crate::mm::{PAGE_SIZE, VMA_KERNEL};
    use crate::test_support::TEST_GUARD;

    fn heap_region() -> (VirtAddr, u32) {
        // Inside the kernel linear window of the simulated RAM.
        (
            VirtAddr::new(VMA_KERNEL + 50 * PAGE_SIZE as u32),
            (8 * PAGE_SIZE) as u32,
        )
    }

    #[test]
    fn alloc_free_and_reuse() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);
        let (base, size) = heap_region();
        heap_init(base, size).unwrap();

        let a = heap_alloc_at(base, size, 100).unwrap();
        let b = heap_alloc_at(base, size, 200).unwrap();
        assert!(a.as_u32() >= base.as_u32() + CONTROL_SIZE);
        assert!(b.as_u32() >= a.as_u32() + 100);

        heap_free_at(base, a).unwrap();
        // First fit reuses the freed entry.
        let c = heap_alloc_at(base, size, 64).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn allocations_are_zeroed() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);
        let (base, size) = heap_region();
        heap_init(base, size).unwrap();

        let a = heap_alloc_at(base, size, 32).unwrap();
        crate::mm::vmm::copy_to_linear(a, &[0xFFu8; 32]).unwrap();
        heap_free_at(base, a).unwrap();

        let b = heap_alloc_at(base, size, 32).unwrap();
        assert_eq!(b, a);
        let mut bytes = [0xEEu8; 32];
        crate::mm::vmm::copy_from_linear(b, &mut bytes).unwrap();
        assert_eq!(bytes, [0u8; 32]);
    }

    #[test]
    fn chain_extends_when_entries_run_out() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);
        let (base, size) = heap_region();
        heap_init(base, size).unwrap();

        let mut last = VirtAddr::new(0);
        for _ in 0..HEAP_NUM_ENTRIES + 4 {
            last = heap_alloc_at(base, size, 16).unwrap();
        }
        assert!(last.as_u32() > base.as_u32());
        heap_free_at(base, last).unwrap();
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);
        let (base, size) = heap_region();
        heap_init(base, size).unwrap();

        assert_eq!(
            heap_alloc_at(base, size, size),
            Err(KernelError::OutOfMemory)
        );
    }

    #[test]
    fn bad_heap_is_rejected() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);
        let (base, size) = heap_region();
        // Not initialized: the magic check fails.
        crate::mm::vmm::zero_linear(base, CONTROL_SIZE).unwrap();
        assert_eq!(
            heap_alloc_at(base, size, 16),
            Err(KernelError::BadParameter)
        );
    }
}
