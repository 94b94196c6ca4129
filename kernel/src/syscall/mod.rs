//! System call surface
//!
//! User code traps with a syscall number and a pointer to a payload
//! that begins with an ABI header. The entry handler checks the calling
//! task's privilege against the table entry, validates the header and
//! the payload memory, dispatches, and converts the result into a
//! signed return value while recording the last error on the task.

pub mod filesystem;
pub mod memory;
pub mod process;

use crate::error::{KernelError, KernelResult};
use crate::mm::{vmm, VirtAddr};
use crate::process::Privilege;
use crate::sched;

/// Trap vector for user calls.
pub const EXOS_USER_CALL: u32 = 0x70;
/// Current ABI revision.
pub const EXOS_ABI_VERSION: u16 = 0x0001;

/// Every payload starts with this header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AbiHeader {
    pub size: u32,
    pub version: u16,
    pub flags: u16,
}

impl AbiHeader {
    pub fn new(size: u32) -> AbiHeader {
        AbiHeader {
            size,
            version: EXOS_ABI_VERSION,
            flags: 0,
        }
    }
}

/// Syscall numbers.
pub mod numbers {
    pub const GET_VERSION: u32 = 0x00;
    pub const GET_SYSTEM_INFO: u32 = 0x01;
    pub const GET_LAST_ERROR: u32 = 0x02;
    pub const SET_LAST_ERROR: u32 = 0x03;
    pub const GET_SYSTEM_TIME: u32 = 0x04;
    pub const GET_LOCAL_TIME: u32 = 0x05;
    pub const SET_LOCAL_TIME: u32 = 0x06;
    pub const DELETE_OBJECT: u32 = 0x07;
    pub const CREATE_PROCESS: u32 = 0x08;
    pub const KILL_PROCESS: u32 = 0x09;
    pub const CREATE_TASK: u32 = 0x0A;
    pub const KILL_TASK: u32 = 0x0B;
    pub const SUSPEND_TASK: u32 = 0x0C;
    pub const RESUME_TASK: u32 = 0x0D;
    pub const SLEEP: u32 = 0x0E;
    pub const POST_MESSAGE: u32 = 0x0F;
    pub const SEND_MESSAGE: u32 = 0x10;
    pub const PEEK_MESSAGE: u32 = 0x11;
    pub const GET_MESSAGE: u32 = 0x12;
    pub const DISPATCH_MESSAGE: u32 = 0x13;
    pub const CREATE_MUTEX: u32 = 0x14;
    pub const LOCK_MUTEX: u32 = 0x15;
    pub const UNLOCK_MUTEX: u32 = 0x16;
    pub const ALLOC_REGION: u32 = 0x17;
    pub const FREE_REGION: u32 = 0x18;
    pub const GET_PROCESS_HEAP: u32 = 0x19;
    pub const HEAP_ALLOC: u32 = 0x1A;
    pub const HEAP_FREE: u32 = 0x1B;
    pub const ENUM_VOLUMES: u32 = 0x1C;
    pub const GET_VOLUME_INFO: u32 = 0x1D;
    pub const OPEN_FILE: u32 = 0x1E;
    pub const READ_FILE: u32 = 0x1F;
    pub const WRITE_FILE: u32 = 0x20;
    pub const GET_FILE_SIZE: u32 = 0x21;
    pub const GET_FILE_POINTER: u32 = 0x22;
    pub const SET_FILE_POINTER: u32 = 0x23;
    pub const FIND_FIRST_FILE: u32 = 0x24;
    pub const FIND_NEXT_FILE: u32 = 0x25;
    pub const CONSOLE_PEEK_KEY: u32 = 0x2A;
    pub const CONSOLE_GET_KEY: u32 = 0x2B;
    pub const CONSOLE_PRINT: u32 = 0x2C;
    pub const CONSOLE_GET_STRING: u32 = 0x2D;
    pub const CONSOLE_GOTO_XY: u32 = 0x2E;
    /// First entry of the desktop/window/GDI range.
    pub const DESKTOP_FIRST: u32 = 0x40;
    pub const DESKTOP_LAST: u32 = 0x5F;
}

/// Entries past this are rejected outright.
pub const TABLE_SIZE: usize = 0x60;

type Handler = fn(VirtAddr) -> KernelResult<u32>;

/// One slot of the syscall table: the function and the weakest
/// privilege allowed to call it.
#[derive(Clone, Copy)]
pub struct SyscallEntry {
    pub handler: Handler,
    pub privilege: Privilege,
}

fn not_implemented(_payload: VirtAddr) -> KernelResult<u32> {
    Err(KernelError::NotImplemented)
}

const NOT_IMPLEMENTED: SyscallEntry = SyscallEntry {
    handler: not_implemented,
    privilege: Privilege::User,
};

const fn user(handler: Handler) -> SyscallEntry {
    SyscallEntry {
        handler,
        privilege: Privilege::User,
    }
}

const fn kernel_only(handler: Handler) -> SyscallEntry {
    SyscallEntry {
        handler,
        privilege: Privilege::Kernel,
    }
}

static TABLE: [SyscallEntry; TABLE_SIZE] = build_table();

const fn build_table() -> [SyscallEntry; TABLE_SIZE] {
    let mut table = [NOT_IMPLEMENTED; TABLE_SIZE];
    table[numbers::GET_VERSION as usize] = user(get_version);
    table[numbers::GET_LAST_ERROR as usize] = user(get_last_error);
    table[numbers::SET_LAST_ERROR as usize] = user(set_last_error);
    table[numbers::GET_SYSTEM_TIME as usize] = user(get_system_time);
    table[numbers::SET_LOCAL_TIME as usize] = kernel_only(not_implemented);
    table[numbers::DELETE_OBJECT as usize] = kernel_only(process::delete_object);
    table[numbers::CREATE_PROCESS as usize] = user(process::create_process);
    table[numbers::KILL_PROCESS as usize] = user(process::kill_process);
    table[numbers::CREATE_TASK as usize] = user(process::create_task);
    table[numbers::KILL_TASK as usize] = user(process::kill_task);
    table[numbers::SUSPEND_TASK as usize] = user(process::suspend_task);
    table[numbers::RESUME_TASK as usize] = user(process::resume_task);
    table[numbers::SLEEP as usize] = user(process::sleep);
    table[numbers::POST_MESSAGE as usize] = user(process::post_message);
    table[numbers::SEND_MESSAGE as usize] = user(process::post_message);
    table[numbers::PEEK_MESSAGE as usize] = user(process::peek_message);
    table[numbers::GET_MESSAGE as usize] = user(process::get_message);
    table[numbers::DISPATCH_MESSAGE as usize] = user(process::dispatch_message);
    table[numbers::CREATE_MUTEX as usize] = user(process::create_mutex);
    table[numbers::LOCK_MUTEX as usize] = user(process::lock_mutex);
    table[numbers::UNLOCK_MUTEX as usize] = user(process::unlock_mutex);
    table[numbers::ALLOC_REGION as usize] = user(memory::alloc_region);
    table[numbers::FREE_REGION as usize] = user(memory::free_region);
    table[numbers::GET_PROCESS_HEAP as usize] = user(memory::get_process_heap);
    table[numbers::HEAP_ALLOC as usize] = user(memory::heap_alloc);
    table[numbers::HEAP_FREE as usize] = user(memory::heap_free);
    table[numbers::ENUM_VOLUMES as usize] = user(filesystem::enum_volumes);
    table[numbers::GET_VOLUME_INFO as usize] = user(filesystem::get_volume_info);
    table[numbers::OPEN_FILE as usize] = user(filesystem::open_file);
    table[numbers::READ_FILE as usize] = user(filesystem::read_file);
    table[numbers::WRITE_FILE as usize] = user(filesystem::write_file);
    table[numbers::GET_FILE_SIZE as usize] = user(filesystem::get_file_size);
    table[numbers::GET_FILE_POINTER as usize] = user(filesystem::get_file_pointer);
    table[numbers::SET_FILE_POINTER as usize] = user(filesystem::set_file_pointer);
    table[numbers::FIND_FIRST_FILE as usize] = user(filesystem::find_file);
    table[numbers::FIND_NEXT_FILE as usize] = user(filesystem::find_file);
    table[numbers::GET_SYSTEM_INFO as usize] = user(get_system_info);
    table[numbers::CONSOLE_PRINT as usize] = user(console_print);
    table[numbers::CONSOLE_GOTO_XY as usize] = user(console_goto_xy);
    table
}

/// Validate payload memory and its ABI header, then read the typed
/// payload. `T` must begin with [`AbiHeader`].
pub(crate) fn read_payload<T: Copy>(payload: VirtAddr) -> KernelResult<T> {
    let size = core::mem::size_of::<T>() as u32;
    validate_user_range(payload, size)?;

    let header: AbiHeader = vmm::read_linear(payload)?;
    if header.version != EXOS_ABI_VERSION {
        return Err(KernelError::BadParameter);
    }
    if header.size < size {
        return Err(KernelError::BadParameter);
    }
    vmm::read_linear(payload)
}

/// Write a typed payload back to the caller.
pub(crate) fn write_payload<T: Copy>(payload: VirtAddr, value: &T) -> KernelResult<()> {
    validate_user_range(payload, core::mem::size_of::<T>() as u32)?;
    vmm::write_linear(payload, value)
}

/// Reject any pointer whose range is not mapped in the current space.
pub(crate) fn validate_user_range(base: VirtAddr, len: u32) -> KernelResult<()> {
    if base.as_u32() == 0 || len == 0 {
        return Err(KernelError::BadParameter);
    }
    if !vmm::is_valid_memory(base) || !vmm::is_valid_memory(VirtAddr::new(base.as_u32() + len - 1))
    {
        return Err(KernelError::BadParameter);
    }
    Ok(())
}

/// Turn a NUL-terminated byte array into a string slice.
pub(crate) fn c_name(bytes: &[u8]) -> KernelResult<&str> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).map_err(|_| KernelError::BadParameter)
}

fn get_version(_payload: VirtAddr) -> KernelResult<u32> {
    // Major in the high word, minor in the low word.
    Ok(1 << 16)
}

fn get_last_error(_payload: VirtAddr) -> KernelResult<u32> {
    Ok(sched::current_task()
        .map(|task| task.last_error() as u32)
        .unwrap_or(0))
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SetLastErrorPayload {
    header: AbiHeader,
    value: i32,
}

fn set_last_error(payload: VirtAddr) -> KernelResult<u32> {
    let request: SetLastErrorPayload = read_payload(payload)?;
    if let Some(task) = sched::current_task() {
        task.set_last_error(request.value);
    }
    Ok(0)
}

fn get_system_time(_payload: VirtAddr) -> KernelResult<u32> {
    Ok(crate::time::system_time_ms() as u32)
}

/// Coarse system summary: the managed physical page count.
fn get_system_info(_payload: VirtAddr) -> KernelResult<u32> {
    Ok(crate::mm::total_phys_pages())
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ConsolePrintPayload {
    header: AbiHeader,
    text: [u8; 256],
}

fn console_print(payload: VirtAddr) -> KernelResult<u32> {
    let request: ConsolePrintPayload = read_payload(payload)?;
    let text = c_name(&request.text)?;
    crate::kprint!("{}", text);
    Ok(text.len() as u32)
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ConsoleGotoPayload {
    header: AbiHeader,
    column: u32,
    row: u32,
}

fn console_goto_xy(payload: VirtAddr) -> KernelResult<u32> {
    let request: ConsoleGotoPayload = read_payload(payload)?;
    use crate::drivers::{DriverCommand, DriverFunction, Param};
    let selector = crate::graphics::selector();
    selector
        .command(
            DriverFunction::TextSetCursor,
            &mut Param::Text(&crate::graphics::TextRequest::SetCursor {
                column: request.column,
                row: request.row,
            }),
        )
        .map(|_| 0)
}

/// Dispatch one syscall. Returns the non-negative result value or the
/// negated error code, mirroring it into the task's last error.
pub fn dispatch(number: u32, payload: VirtAddr) -> i32 {
    let entry = match TABLE.get(number as usize) {
        Some(entry) => *entry,
        None => {
            record_error(KernelError::NotImplemented);
            return KernelError::NotImplemented.code();
        }
    };

    let caller = sched::current_process()
        .map(|process| process.privilege())
        .unwrap_or(Privilege::Kernel);
    if !caller.dominates(entry.privilege) {
        record_error(KernelError::NoPermission);
        return KernelError::NoPermission.code();
    }

    match (entry.handler)(payload) {
        Ok(value) => value as i32,
        Err(err) => {
            record_error(err);
            err.code()
        }
    }
}

fn record_error(err: KernelError) {
    if let Some(task) = sched::current_task() {
        task.set_last_error(err.code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{vmm::testing, PAGE_SIZE, VMA_KERNEL};
    use crate::test_support::TEST_GUARD;

    fn payload_at<T: Copy>(value: &T) -> VirtAddr {
        let addr = VirtAddr::new(VMA_KERNEL + 80 * PAGE_SIZE as u32);
        vmm::write_linear(addr, value).unwrap();
        addr
    }

    #[test]
    fn version_and_time_need_no_payload() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);

        assert_eq!(dispatch(numbers::GET_VERSION, VirtAddr::new(0)), 1 << 16);
        assert!(dispatch(numbers::GET_SYSTEM_TIME, VirtAddr::new(0)) >= 0);
    }

    #[test]
    fn bad_abi_version_is_rejected() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);

        let bad = SetLastErrorPayload {
            header: AbiHeader {
                size: core::mem::size_of::<SetLastErrorPayload>() as u32,
                version: 0x7777,
                flags: 0,
            },
            value: -5,
        };
        let addr = payload_at(&bad);
        assert_eq!(
            dispatch(numbers::SET_LAST_ERROR, addr),
            KernelError::BadParameter.code()
        );
    }

    #[test]
    fn short_payload_size_is_rejected() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);

        let bad = SetLastErrorPayload {
            header: AbiHeader {
                size: 4,
                version: EXOS_ABI_VERSION,
                flags: 0,
            },
            value: -5,
        };
        let addr = payload_at(&bad);
        assert_eq!(
            dispatch(numbers::SET_LAST_ERROR, addr),
            KernelError::BadParameter.code()
        );
    }

    #[test]
    fn unmapped_payload_is_rejected() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);

        assert_eq!(
            dispatch(numbers::SET_LAST_ERROR, VirtAddr::new(0x1000)),
            KernelError::BadParameter.code()
        );
    }

    #[test]
    fn unknown_numbers_answer_not_implemented() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);

        assert_eq!(
            dispatch(0x5555, VirtAddr::new(0)),
            KernelError::NotImplemented.code()
        );
        // Desktop range entries exist but are collaborator surface.
        assert_eq!(
            dispatch(numbers::DESKTOP_FIRST, VirtAddr::new(0)),
            KernelError::NotImplemented.code()
        );
    }

    #[test]
    fn last_error_round_trip() {
        let _guard = TEST_GUARD.lock();
        let _ram = testing::boot(256);
        crate::sched::scheduler::reset_for_tests();

        let task = crate::sched::Task::new(
            "syscall-test",
            crate::sched::TaskKind::Kernel,
            crate::sched::task::TASK_PRIORITY_NORMAL,
            crate::sched::TaskStatus::Running,
        );
        crate::sched::install_initial_task(task);

        let request = SetLastErrorPayload {
            header: AbiHeader::new(core::mem::size_of::<SetLastErrorPayload>() as u32),
            value: -42,
        };
        let addr = payload_at(&request);
        assert_eq!(dispatch(numbers::SET_LAST_ERROR, addr), 0);
        assert_eq!(
            dispatch(numbers::GET_LAST_ERROR, VirtAddr::new(0)),
            -42i32
        );

        crate::sched::scheduler::reset_for_tests();
    }
}
