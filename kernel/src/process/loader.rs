//! Executable image parsing and loading
//!
//! Executables are a signature header followed by `{id, size}`-prefixed
//! chunks. INIT appears exactly once and first, CODE exactly once, DATA
//! at most once, and a FIXUP chunk (relocation records adding the
//! load-time delta to 32-bit slots) terminates the stream. Anything else
//! is skipped by its declared size.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::mm::{vmm, VirtAddr};

/// Executable signature.
pub const EXOS_SIGNATURE: u32 = 0x5353_4F5A;

pub const EXOS_CHUNK_INIT: u32 = 0x0000_0001;
pub const EXOS_CHUNK_CODE: u32 = 0x0000_0002;
pub const EXOS_CHUNK_DATA: u32 = 0x0000_0003;
pub const EXOS_CHUNK_FIXUP: u32 = 0x0000_0004;

/// Fixup record target sections.
pub const EXOS_SECTION_CODE: u32 = 1;
pub const EXOS_SECTION_DATA: u32 = 2;

/// Loader-facing summary of an executable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutableInfo {
    pub entry_point: u32,
    pub code_base: u32,
    pub data_base: u32,
    pub code_size: u32,
    pub data_size: u32,
    pub stack_minimum: u32,
    pub stack_requested: u32,
    pub heap_minimum: u32,
    pub heap_requested: u32,
}

/// One relocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    pub section: u32,
    pub address: u32,
}

/// Parsed image: the info block plus borrowed payload ranges.
#[derive(Debug)]
pub struct ExosImage<'a> {
    pub info: ExecutableInfo,
    pub code: &'a [u8],
    pub data: &'a [u8],
    pub fixups: Vec<Fixup>,
}

fn read_u32(bytes: &[u8], offset: usize) -> KernelResult<u32> {
    let end = offset.checked_add(4).ok_or(KernelError::BadParameter)?;
    let slice = bytes.get(offset..end).ok_or(KernelError::BadParameter)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

/// Parse an executable image held in memory.
pub fn parse_image(bytes: &[u8]) -> KernelResult<ExosImage<'_>> {
    if read_u32(bytes, 0)? != EXOS_SIGNATURE {
        return Err(KernelError::BadParameter);
    }

    let mut offset = 4usize;
    let mut info: Option<ExecutableInfo> = None;
    let mut code: Option<&[u8]> = None;
    let mut data: Option<&[u8]> = None;
    let mut fixups: Vec<Fixup> = Vec::new();

    while offset + 8 <= bytes.len() {
        let id = read_u32(bytes, offset)?;
        let size = read_u32(bytes, offset + 4)? as usize;
        offset += 8;
        let end = offset.checked_add(size).ok_or(KernelError::BadParameter)?;
        if end > bytes.len() {
            return Err(KernelError::BadParameter);
        }
        let payload = &bytes[offset..end];

        match id {
            EXOS_CHUNK_INIT => {
                if info.is_some() || size < 9 * 4 {
                    return Err(KernelError::BadParameter);
                }
                info = Some(ExecutableInfo {
                    entry_point: read_u32(payload, 0)?,
                    code_base: read_u32(payload, 4)?,
                    data_base: read_u32(payload, 8)?,
                    code_size: read_u32(payload, 12)?,
                    data_size: read_u32(payload, 16)?,
                    stack_minimum: read_u32(payload, 20)?,
                    stack_requested: read_u32(payload, 24)?,
                    heap_minimum: read_u32(payload, 28)?,
                    heap_requested: read_u32(payload, 32)?,
                });
            }
            EXOS_CHUNK_CODE => {
                if info.is_none() || code.is_some() {
                    return Err(KernelError::BadParameter);
                }
                code = Some(payload);
            }
            EXOS_CHUNK_DATA => {
                if info.is_none() || data.is_some() {
                    return Err(KernelError::BadParameter);
                }
                data = Some(payload);
            }
            EXOS_CHUNK_FIXUP => {
                if info.is_none() {
                    return Err(KernelError::BadParameter);
                }
                let count = read_u32(payload, 0)? as usize;
                if payload.len() < 4 + count * 8 {
                    return Err(KernelError::BadParameter);
                }
                for index in 0..count {
                    fixups.push(Fixup {
                        section: read_u32(payload, 4 + index * 8)?,
                        address: read_u32(payload, 8 + index * 8)?,
                    });
                }
                // A fixup chunk terminates loading.
                offset = end;
                break;
            }
            _ => {}
        }
        offset = end;
    }

    let info = info.ok_or(KernelError::BadParameter)?;
    let code = code.ok_or(KernelError::BadParameter)?;
    Ok(ExosImage {
        info,
        code,
        data: data.unwrap_or(&[]),
        fixups,
    })
}

/// Copy the image into already-committed regions of the current address
/// space and apply fixups against the load-time deltas.
pub fn load_image(
    image: &ExosImage<'_>,
    code_base: VirtAddr,
    data_base: VirtAddr,
) -> KernelResult<()> {
    vmm::copy_to_linear(code_base, image.code)?;
    if !image.data.is_empty() {
        vmm::copy_to_linear(data_base, image.data)?;
    }

    let code_delta = code_base.as_u32().wrapping_sub(image.info.code_base);
    let data_delta = data_base.as_u32().wrapping_sub(image.info.data_base);

    for fixup in &image.fixups {
        let (region_base, link_base, delta) = match fixup.section {
            EXOS_SECTION_CODE => (code_base, image.info.code_base, code_delta),
            EXOS_SECTION_DATA => (data_base, image.info.data_base, data_delta),
            _ => return Err(KernelError::BadParameter),
        };
        let slot = VirtAddr::new(
            region_base
                .as_u32()
                .wrapping_add(fixup.address.wrapping_sub(link_base)),
        );
        let value: u32 = vmm::read_linear(slot)?;
        let patched = value.wrapping_add(delta);
        vmm::write_linear(slot, &patched)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn push_u32(bytes: &mut Vec<u8>, value: u32) {
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn push_chunk(bytes: &mut Vec<u8>, id: u32, payload: &[u8]) {
        push_u32(bytes, id);
        push_u32(bytes, payload.len() as u32);
        bytes.extend_from_slice(payload);
    }

    fn init_payload(info: &ExecutableInfo) -> Vec<u8> {
        let mut payload = Vec::new();
        for value in [
            info.entry_point,
            info.code_base,
            info.data_base,
            info.code_size,
            info.data_size,
            info.stack_minimum,
            info.stack_requested,
            info.heap_minimum,
            info.heap_requested,
        ] {
            push_u32(&mut payload, value);
        }
        payload
    }

    fn sample_info() -> ExecutableInfo {
        ExecutableInfo {
            entry_point: 0x0040_0000,
            code_base: 0x0040_0000,
            data_base: 0x0041_0000,
            code_size: 16,
            data_size: 8,
            stack_minimum: 0x1000,
            stack_requested: 0x4000,
            heap_minimum: 0x1000,
            heap_requested: 0x8000,
        }
    }

    #[test]
    fn parses_a_complete_image() {
        let info = sample_info();
        let mut bytes = Vec::new();
        push_u32(&mut bytes, EXOS_SIGNATURE);
        push_chunk(&mut bytes, EXOS_CHUNK_INIT, &init_payload(&info));
        push_chunk(&mut bytes, EXOS_CHUNK_CODE, &[0x90; 16]);
        push_chunk(&mut bytes, EXOS_CHUNK_DATA, &[0xAA; 8]);

        let mut fixup_payload = Vec::new();
        push_u32(&mut fixup_payload, 1);
        push_u32(&mut fixup_payload, EXOS_SECTION_CODE);
        push_u32(&mut fixup_payload, 0x0040_0004);
        push_chunk(&mut bytes, EXOS_CHUNK_FIXUP, &fixup_payload);

        let image = parse_image(&bytes).unwrap();
        assert_eq!(image.info, info);
        assert_eq!(image.code.len(), 16);
        assert_eq!(image.data.len(), 8);
        assert_eq!(
            image.fixups,
            [Fixup {
                section: EXOS_SECTION_CODE,
                address: 0x0040_0004
            }]
        );
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut bytes = Vec::new();
        push_u32(&mut bytes, 0xDEAD_BEEF);
        assert!(matches!(
            parse_image(&bytes),
            Err(KernelError::BadParameter)
        ));
    }

    #[test]
    fn duplicate_init_is_rejected() {
        let info = sample_info();
        let mut bytes = Vec::new();
        push_u32(&mut bytes, EXOS_SIGNATURE);
        push_chunk(&mut bytes, EXOS_CHUNK_INIT, &init_payload(&info));
        push_chunk(&mut bytes, EXOS_CHUNK_INIT, &init_payload(&info));
        assert!(parse_image(&bytes).is_err());
    }

    #[test]
    fn missing_code_is_rejected() {
        let info = sample_info();
        let mut bytes = Vec::new();
        push_u32(&mut bytes, EXOS_SIGNATURE);
        push_chunk(&mut bytes, EXOS_CHUNK_INIT, &init_payload(&info));
        assert!(parse_image(&bytes).is_err());
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let info = sample_info();
        let mut bytes = Vec::new();
        push_u32(&mut bytes, EXOS_SIGNATURE);
        push_chunk(&mut bytes, EXOS_CHUNK_INIT, &init_payload(&info));
        push_chunk(&mut bytes, 0x7777, &[1, 2, 3, 4, 5]);
        push_chunk(&mut bytes, EXOS_CHUNK_CODE, &[0x90; 16]);

        let image = parse_image(&bytes).unwrap();
        assert_eq!(image.code.len(), 16);
        assert!(image.fixups.is_empty());
    }

    #[test]
    fn fixup_terminates_the_stream() {
        let info = sample_info();
        let mut bytes = Vec::new();
        push_u32(&mut bytes, EXOS_SIGNATURE);
        push_chunk(&mut bytes, EXOS_CHUNK_INIT, &init_payload(&info));
        push_chunk(&mut bytes, EXOS_CHUNK_CODE, &[0x90; 16]);
        let mut fixup_payload = vec![];
        push_u32(&mut fixup_payload, 0);
        push_chunk(&mut bytes, EXOS_CHUNK_FIXUP, &fixup_payload);
        // Garbage after the fixup chunk is never reached.
        bytes.extend_from_slice(&[0xFF; 3]);

        let image = parse_image(&bytes).unwrap();
        assert!(image.fixups.is_empty());
    }

    #[test]
    fn truncated_chunk_is_rejected() {
        let info = sample_info();
        let mut bytes = Vec::new();
        push_u32(&mut bytes, EXOS_SIGNATURE);
        push_chunk(&mut bytes, EXOS_CHUNK_INIT, &init_payload(&info));
        push_u32(&mut bytes, EXOS_CHUNK_CODE);
        push_u32(&mut bytes, 1000);
        bytes.extend_from_slice(&[0x90; 4]);
        assert!(parse_image(&bytes).is_err());
    }
}
