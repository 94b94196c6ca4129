//! File and volume syscalls

use alloc::vec;

use crate::error::{KernelError, KernelResult};
use crate::fs::{self, FileOpenInfo, OpenFlags};
use crate::mm::{vmm, VirtAddr};
use crate::obj::{publish_handle, resolve_handle, Handle, HandleTarget};

use super::{c_name, read_payload, validate_user_range, write_payload, AbiHeader};

#[repr(C)]
#[derive(Clone, Copy)]
pub struct OpenFilePayload {
    pub header: AbiHeader,
    pub name: [u8; 256],
    pub flags: u32,
}

pub fn open_file(payload: VirtAddr) -> KernelResult<u32> {
    let request: OpenFilePayload = read_payload(payload)?;
    let name = c_name(&request.name)?;
    let file = fs::open_file(&FileOpenInfo {
        name,
        flags: OpenFlags::from_bits_truncate(request.flags),
    })?;
    Ok(publish_handle(HandleTarget::File(file)).0)
}

fn file_for(handle: u32) -> KernelResult<alloc::sync::Arc<fs::file::File>> {
    match resolve_handle(Handle(handle)) {
        Some(HandleTarget::File(file)) => Ok(file),
        _ => Err(KernelError::BadParameter),
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct FileIoPayload {
    pub header: AbiHeader,
    pub file: u32,
    pub buffer: u32,
    pub num_bytes: u32,
}

pub fn read_file(payload: VirtAddr) -> KernelResult<u32> {
    let request: FileIoPayload = read_payload(payload)?;
    validate_user_range(VirtAddr::new(request.buffer), request.num_bytes)?;
    let file = file_for(request.file)?;

    let mut staging = vec![0u8; request.num_bytes as usize];
    let transferred = fs::read_file(&file, &mut staging)?;
    vmm::copy_to_linear(
        VirtAddr::new(request.buffer),
        &staging[..transferred as usize],
    )?;
    Ok(transferred)
}

pub fn write_file(payload: VirtAddr) -> KernelResult<u32> {
    let request: FileIoPayload = read_payload(payload)?;
    validate_user_range(VirtAddr::new(request.buffer), request.num_bytes)?;
    let file = file_for(request.file)?;

    let mut staging = vec![0u8; request.num_bytes as usize];
    vmm::copy_from_linear(VirtAddr::new(request.buffer), &mut staging)?;
    fs::write_file(&file, &staging)
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct FilePointerPayload {
    pub header: AbiHeader,
    pub file: u32,
    pub position: u32,
}

pub fn get_file_size(payload: VirtAddr) -> KernelResult<u32> {
    let request: FilePointerPayload = read_payload(payload)?;
    let file = file_for(request.file)?;
    Ok(fs::get_file_size(&file) as u32)
}

pub fn get_file_pointer(payload: VirtAddr) -> KernelResult<u32> {
    let request: FilePointerPayload = read_payload(payload)?;
    let file = file_for(request.file)?;
    Ok(fs::get_file_position(&file) as u32)
}

pub fn set_file_pointer(payload: VirtAddr) -> KernelResult<u32> {
    let request: FilePointerPayload = read_payload(payload)?;
    let file = file_for(request.file)?;
    fs::set_file_position(&file, request.position as u64)?;
    Ok(request.position)
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VolumePayload {
    pub header: AbiHeader,
    pub index: u32,
    pub name: [u8; fs::MAX_FS_LOGICAL_NAME],
    pub file_count: u32,
}

/// Enumerate mounted volumes by index; answers `NoMore` past the end.
pub fn enum_volumes(payload: VirtAddr) -> KernelResult<u32> {
    let mut request: VolumePayload = read_payload(payload)?;
    let volumes = fs::filesystems();
    let volume = volumes
        .get(request.index as usize)
        .ok_or(KernelError::NoMore)?;

    request.name = [0; fs::MAX_FS_LOGICAL_NAME];
    let name = volume.name();
    let bytes = name.as_bytes();
    let len = bytes.len().min(fs::MAX_FS_LOGICAL_NAME - 1);
    request.name[..len].copy_from_slice(&bytes[..len]);
    write_payload(payload, &request)?;
    Ok(volumes.len() as u32)
}

/// Directory enumeration routes to the owning FS driver's open-next
/// command; drivers without enumeration support answer accordingly.
pub fn find_file(payload: VirtAddr) -> KernelResult<u32> {
    let request: OpenFilePayload = read_payload(payload)?;
    let name = c_name(&request.name)?;

    let volume = match fs::split_volume(name) {
        Some((volume, _)) => fs::find_filesystem(volume),
        None => fs::system_filesystem(),
    }
    .ok_or(KernelError::NoDevice)?;

    let info = fs::FileInfo {
        file_system: volume.clone(),
        attributes: u32::MAX,
        flags: OpenFlags::from_bits_truncate(request.flags),
        name: alloc::string::String::from(name),
    };
    use crate::drivers::{DriverCommand, DriverFunction, DriverValue, Param};
    match volume
        .driver
        .command(DriverFunction::FsOpenNext, &mut Param::FsOpen(&info))?
    {
        DriverValue::File(file) => Ok(publish_handle(HandleTarget::File(file)).0),
        _ => Err(KernelError::NoMore),
    }
}

/// Volume details through the owning driver.
pub fn get_volume_info(payload: VirtAddr) -> KernelResult<u32> {
    let mut request: VolumePayload = read_payload(payload)?;
    let volumes = fs::filesystems();
    let volume = volumes
        .get(request.index as usize)
        .ok_or(KernelError::NoMore)?;

    let mut info = fs::VolumeInfo::default();
    use crate::drivers::{DriverCommand, DriverFunction, Param};
    let _ = volume.driver.command(
        DriverFunction::FsGetVolumeInfo,
        &mut Param::FsVolumeInfo(&mut info),
    );
    request.file_count = info.file_count;
    write_payload(payload, &request)?;
    Ok(0)
}
