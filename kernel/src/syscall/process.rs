//! Process, task, messaging and mutex syscalls

use alloc::string::String;

use crate::error::{KernelError, KernelResult};
use crate::mm::VirtAddr;
use crate::obj::{publish_handle, release_handle, resolve_handle, Handle, HandleTarget};
use crate::process::{self, Privilege, ProcessFlags};
use crate::sched::{self, TaskKind, TaskStatus};
use crate::sync::KMutex;

use super::{c_name, read_payload, write_payload, AbiHeader};

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CreateProcessPayload {
    pub header: AbiHeader,
    pub file_name: [u8; 256],
    pub command_line: [u8; 256],
    pub flags: u32,
}

pub fn create_process(payload: VirtAddr) -> KernelResult<u32> {
    let request: CreateProcessPayload = read_payload(payload)?;
    let file_name = c_name(&request.file_name)?;
    let command_line = c_name(&request.command_line)?;
    let work_folder = sched::current_process()
        .map(|process| process.work_folder())
        .unwrap_or_else(|| String::from("/"));

    let process = process::create_process(&process::ProcessInfo {
        file_name: String::from(file_name),
        command_line: String::from(command_line),
        work_folder,
        privilege: Privilege::User,
        flags: ProcessFlags::from_bits_truncate(request.flags),
    })?;
    Ok(publish_handle(HandleTarget::Process(process)).0)
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ObjectPayload {
    pub header: AbiHeader,
    pub object: u32,
    pub argument: u32,
}

fn target(handle: u32) -> KernelResult<HandleTarget> {
    resolve_handle(Handle(handle)).ok_or(KernelError::BadParameter)
}

pub fn kill_process(payload: VirtAddr) -> KernelResult<u32> {
    let request: ObjectPayload = read_payload(payload)?;
    match target(request.object)? {
        HandleTarget::Process(process) => {
            process::kill_process(&process, request.argument)?;
            Ok(0)
        }
        _ => Err(KernelError::BadParameter),
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CreateTaskPayload {
    pub header: AbiHeader,
    pub entry_point: u32,
    pub priority: u32,
    pub name: [u8; 32],
}

pub fn create_task(payload: VirtAddr) -> KernelResult<u32> {
    let request: CreateTaskPayload = read_payload(payload)?;
    let name = c_name(&request.name)?;
    let process = sched::current_process().ok_or(KernelError::Generic)?;

    let task = sched::create_task(
        name,
        &process,
        TaskKind::User,
        request.priority & 0xFF,
        request.entry_point,
        TaskStatus::Running,
    )?;
    Ok(publish_handle(HandleTarget::Task(task)).0)
}

pub fn kill_task(payload: VirtAddr) -> KernelResult<u32> {
    let request: ObjectPayload = read_payload(payload)?;
    match target(request.object)? {
        HandleTarget::Task(task) => {
            task.set_exit_code(request.argument);
            process::kill_task(&task);
            release_handle(Handle(request.object));
            Ok(0)
        }
        _ => Err(KernelError::BadParameter),
    }
}

pub fn suspend_task(payload: VirtAddr) -> KernelResult<u32> {
    let request: ObjectPayload = read_payload(payload)?;
    match target(request.object)? {
        HandleTarget::Task(task) => {
            process::suspend_task(&task);
            Ok(0)
        }
        _ => Err(KernelError::BadParameter),
    }
}

pub fn resume_task(payload: VirtAddr) -> KernelResult<u32> {
    let request: ObjectPayload = read_payload(payload)?;
    match target(request.object)? {
        HandleTarget::Task(task) => {
            process::resume_task(&task);
            Ok(0)
        }
        _ => Err(KernelError::BadParameter),
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SleepPayload {
    pub header: AbiHeader,
    pub milliseconds: u32,
}

pub fn sleep(payload: VirtAddr) -> KernelResult<u32> {
    let request: SleepPayload = read_payload(payload)?;
    sched::sleep(request.milliseconds);
    Ok(0)
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MessagePayload {
    pub header: AbiHeader,
    pub target: u32,
    pub message: u32,
    pub param1: u32,
    pub param2: u32,
    pub time: u32,
}

pub fn post_message(payload: VirtAddr) -> KernelResult<u32> {
    let request: MessagePayload = read_payload(payload)?;
    match target(request.target)? {
        HandleTarget::Task(task) => {
            let was_waiting = task.post_message(crate::sched::task::Message {
                target: Handle(request.target),
                message: request.message,
                time: crate::time::system_time_ms(),
                param1: request.param1,
                param2: request.param2,
            });
            if was_waiting {
                sched::unblock(&task);
            }
            Ok(0)
        }
        _ => Err(KernelError::BadParameter),
    }
}

fn message_out(payload: VirtAddr, message: crate::sched::task::Message) -> KernelResult<u32> {
    let mut request: MessagePayload = read_payload(payload)?;
    request.message = message.message;
    request.param1 = message.param1;
    request.param2 = message.param2;
    request.time = message.time as u32;
    write_payload(payload, &request)?;
    Ok(1)
}

/// Non-blocking queue inspection: answers zero when no message waits.
pub fn peek_message(payload: VirtAddr) -> KernelResult<u32> {
    let task = sched::current_task().ok_or(KernelError::Generic)?;
    match task.peek_message() {
        Some(message) => message_out(payload, message),
        None => Ok(0),
    }
}

/// Blocking receive: parks the task in the wait-message state until a
/// message arrives.
pub fn get_message(payload: VirtAddr) -> KernelResult<u32> {
    let task = sched::current_task().ok_or(KernelError::Generic)?;
    loop {
        if let Some(message) = task.take_message() {
            return message_out(payload, message);
        }
        task.set_status(TaskStatus::WaitMessage);
        sched::yield_now();
        if task.status() == TaskStatus::Dead {
            return Err(KernelError::Generic);
        }
        if task.status() == TaskStatus::WaitMessage {
            task.set_status(TaskStatus::Running);
        }
    }
}

/// Message routing to window procedures happens in user space; the
/// kernel side is a no-op.
pub fn dispatch_message(_payload: VirtAddr) -> KernelResult<u32> {
    Ok(0)
}

pub fn create_mutex(_payload: VirtAddr) -> KernelResult<u32> {
    let mutex = KMutex::create();
    Ok(publish_handle(HandleTarget::Mutex(mutex)).0)
}

pub fn lock_mutex(payload: VirtAddr) -> KernelResult<u32> {
    let request: ObjectPayload = read_payload(payload)?;
    match target(request.object)? {
        HandleTarget::Mutex(mutex) => {
            mutex.lock(request.argument)?;
            Ok(0)
        }
        _ => Err(KernelError::BadParameter),
    }
}

pub fn unlock_mutex(payload: VirtAddr) -> KernelResult<u32> {
    let request: ObjectPayload = read_payload(payload)?;
    match target(request.object)? {
        HandleTarget::Mutex(mutex) => {
            mutex.unlock()?;
            Ok(0)
        }
        _ => Err(KernelError::BadParameter),
    }
}

/// Release a handle-table entry for any object kind.
pub fn delete_object(payload: VirtAddr) -> KernelResult<u32> {
    let request: ObjectPayload = read_payload(payload)?;
    if release_handle(Handle(request.object)) {
        Ok(0)
    } else {
        Err(KernelError::BadParameter)
    }
}
