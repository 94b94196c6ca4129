//! Sector-cache integration tests
//!
//! The cached read/write flow over a disk image, the way the SATA disk
//! driver drives it: reads served from cache after the first transfer,
//! writes pushed through and left clean, entries aging out by TTL.

use exos_kernel::drivers::ahci::cache::{
    cached_read, cached_write, SectorCache, DISK_CACHE_TTL_MS, NUM_CACHE_BUFFERS,
};
use exos_kernel::drivers::disk::SECTOR_SIZE;
use exos_kernel::error::KernelResult;

struct DiskImage {
    sectors: Vec<[u8; SECTOR_SIZE]>,
    device_reads: u32,
    device_writes: u32,
}

impl DiskImage {
    fn new(count: usize) -> DiskImage {
        DiskImage {
            sectors: vec![[0u8; SECTOR_SIZE]; count],
            device_reads: 0,
            device_writes: 0,
        }
    }

    fn with_mbr(count: usize) -> DiskImage {
        let mut image = DiskImage::new(count);
        image.sectors[0][510] = 0x55;
        image.sectors[0][511] = 0xAA;
        image
    }
}

fn read_one(
    image: &mut DiskImage,
    cache: &mut SectorCache,
    now: u64,
    sector: u32,
) -> KernelResult<[u8; SECTOR_SIZE]> {
    let mut out = [0u8; SECTOR_SIZE];
    let mut issue = |s: u32, _h: u32, data: &mut [u8; SECTOR_SIZE]| {
        image.device_reads += 1;
        data.copy_from_slice(&image.sectors[s as usize]);
        Ok(())
    };
    cached_read(cache, now, sector, 1, &mut out, &mut issue)?;
    Ok(out)
}

fn write_one(
    image: &mut DiskImage,
    cache: &mut SectorCache,
    now: u64,
    sector: u32,
    data: &[u8; SECTOR_SIZE],
) -> KernelResult<()> {
    let mut issue = |s: u32, _h: u32, bytes: &mut [u8; SECTOR_SIZE]| {
        image.device_writes += 1;
        image.sectors[s as usize].copy_from_slice(bytes);
        Ok(())
    };
    cached_write(cache, now, sector, 1, data, &mut issue)
}

#[test]
fn sector_zero_carries_the_boot_mark() {
    let mut image = DiskImage::with_mbr(256);
    let mut cache = SectorCache::new(NUM_CACHE_BUFFERS);

    let sector = read_one(&mut image, &mut cache, 0, 0).unwrap();
    assert_eq!(sector[510], 0x55);
    assert_eq!(sector[511], 0xAA);
}

#[test]
fn write_then_read_back_is_byte_identical_and_clean() {
    let mut image = DiskImage::with_mbr(256);
    let mut cache = SectorCache::new(NUM_CACHE_BUFFERS);

    let mut pattern = [0u8; SECTOR_SIZE];
    for (index, byte) in pattern.iter_mut().enumerate().take(64) {
        *byte = index as u8 ^ 0x5A;
    }
    write_one(&mut image, &mut cache, 10, 100, &pattern).unwrap();

    // The write went through to the image.
    assert_eq!(image.device_writes, 1);
    assert_eq!(image.sectors[100][..64], pattern[..64]);

    // The readback is byte-identical and never touches the device.
    let back = read_one(&mut image, &mut cache, 20, 100).unwrap();
    assert_eq!(back, pattern);
    assert_eq!(image.device_reads, 0);

    // The entry for sector 100 exists and is clean after the write.
    assert_eq!(cache.entry_state(100, 0), Some(false));
}

#[test]
fn repeated_reads_hit_the_cache_until_ttl() {
    let mut image = DiskImage::with_mbr(256);
    let mut cache = SectorCache::new(NUM_CACHE_BUFFERS);

    for _ in 0..5 {
        read_one(&mut image, &mut cache, 50, 7).unwrap();
    }
    assert_eq!(image.device_reads, 1);

    // Past the TTL the entry is gone and the device is read again.
    read_one(&mut image, &mut cache, 50 + DISK_CACHE_TTL_MS + 1, 7).unwrap();
    assert_eq!(image.device_reads, 2);
}

#[test]
fn cache_capacity_is_bounded_by_lru() {
    let mut image = DiskImage::with_mbr(NUM_CACHE_BUFFERS * 4);
    let mut cache = SectorCache::new(NUM_CACHE_BUFFERS);

    for sector in 0..(NUM_CACHE_BUFFERS as u32 * 2) {
        read_one(&mut image, &mut cache, sector as u64, sector).unwrap();
    }
    assert_eq!(cache.len(), NUM_CACHE_BUFFERS);

    // The oldest entries were evicted, the newest survive.
    assert!(cache.entry_state(0, 0).is_none());
    assert!(cache
        .entry_state(NUM_CACHE_BUFFERS as u32 * 2 - 1, 0)
        .is_some());
}

#[test]
fn device_errors_do_not_poison_the_cache() {
    let mut cache = SectorCache::new(NUM_CACHE_BUFFERS);
    let mut out = [0u8; SECTOR_SIZE];
    let mut failing = |_s: u32, _h: u32, _d: &mut [u8; SECTOR_SIZE]| {
        Err(exos_kernel::error::KernelError::Hardware)
    };
    assert!(cached_read(&mut cache, 0, 3, 1, &mut out, &mut failing).is_err());
    assert!(cache.is_empty());

    let pattern = [1u8; SECTOR_SIZE];
    assert!(cached_write(&mut cache, 0, 3, 1, &pattern, &mut failing).is_err());
    assert!(cache.entry_state(3, 0).is_none());
}
