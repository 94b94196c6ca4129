//! Per-port sector cache
//!
//! TTL-bounded LRU keyed by `(sector_low, sector_high)`. Reads are
//! served from the cache when possible; writes go through to the device
//! and update the entry, which is marked dirty only for the duration of
//! the device write. Entries never outlive the owning port.

use alloc::vec::Vec;

use crate::drivers::disk::SECTOR_SIZE;
use crate::error::{KernelError, KernelResult};

/// Lifetime of a cache entry.
pub const DISK_CACHE_TTL_MS: u64 = 2000;

/// Entries kept per port.
pub const NUM_CACHE_BUFFERS: usize = 32;

/// One cached sector.
pub struct SectorBuffer {
    pub sector_low: u32,
    pub sector_high: u32,
    pub dirty: bool,
    pub data: [u8; SECTOR_SIZE],
}

struct CacheEntry {
    buffer: SectorBuffer,
    expires_at_ms: u64,
    last_used_ms: u64,
}

/// TTL-bounded LRU of sector buffers.
pub struct SectorCache {
    entries: Vec<CacheEntry>,
    capacity: usize,
}

impl SectorCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose TTL has passed.
    pub fn cleanup(&mut self, now_ms: u64) {
        self.entries.retain(|entry| entry.expires_at_ms > now_ms);
    }

    pub fn find(&mut self, sector_low: u32, sector_high: u32, now_ms: u64) -> Option<&mut SectorBuffer> {
        let entry = self.entries.iter_mut().find(|entry| {
            entry.buffer.sector_low == sector_low && entry.buffer.sector_high == sector_high
        })?;
        entry.last_used_ms = now_ms;
        entry.expires_at_ms = now_ms + DISK_CACHE_TTL_MS;
        Some(&mut entry.buffer)
    }

    /// Insert a buffer, evicting the least-recently-used entry when the
    /// cache is full.
    pub fn insert(&mut self, buffer: SectorBuffer, now_ms: u64) {
        if self.entries.len() >= self.capacity {
            if let Some(victim) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.last_used_ms)
                .map(|(index, _)| index)
            {
                self.entries.swap_remove(victim);
            }
        }
        self.entries.push(CacheEntry {
            buffer,
            expires_at_ms: now_ms + DISK_CACHE_TTL_MS,
            last_used_ms: now_ms,
        });
    }

    /// Dirty state of a cached sector, for diagnostics.
    pub fn entry_state(&self, sector_low: u32, sector_high: u32) -> Option<bool> {
        self.entries
            .iter()
            .find(|entry| {
                entry.buffer.sector_low == sector_low && entry.buffer.sector_high == sector_high
            })
            .map(|entry| entry.buffer.dirty)
    }
}

/// Issue callback: transfer one sector at `(low, high)`; direction is
/// fixed by the caller.
pub type IssueSector<'f> = &'f mut dyn FnMut(u32, u32, &mut [u8; SECTOR_SIZE]) -> KernelResult<()>;

/// Sector-by-sector read through the cache: hits are copied out, misses
/// are fetched from the device and inserted clean.
pub fn cached_read(
    cache: &mut SectorCache,
    now_ms: u64,
    first_sector: u32,
    num_sectors: u32,
    buffer: &mut [u8],
    issue: IssueSector<'_>,
) -> KernelResult<()> {
    if buffer.len() < num_sectors as usize * SECTOR_SIZE {
        return Err(KernelError::BadParameter);
    }
    cache.cleanup(now_ms);

    for current in 0..num_sectors {
        let sector = first_sector + current;
        let out = &mut buffer[current as usize * SECTOR_SIZE..][..SECTOR_SIZE];

        if let Some(hit) = cache.find(sector, 0, now_ms) {
            out.copy_from_slice(&hit.data);
            continue;
        }

        let mut fresh = SectorBuffer {
            sector_low: sector,
            sector_high: 0,
            dirty: false,
            data: [0; SECTOR_SIZE],
        };
        issue(sector, 0, &mut fresh.data)?;
        out.copy_from_slice(&fresh.data);
        cache.insert(fresh, now_ms);
    }
    Ok(())
}

/// Write-through: each sector is copied into its (possibly fresh) cache
/// entry, marked dirty, pushed to the device, then marked clean.
pub fn cached_write(
    cache: &mut SectorCache,
    now_ms: u64,
    first_sector: u32,
    num_sectors: u32,
    buffer: &[u8],
    issue: IssueSector<'_>,
) -> KernelResult<()> {
    if buffer.len() < num_sectors as usize * SECTOR_SIZE {
        return Err(KernelError::BadParameter);
    }
    cache.cleanup(now_ms);

    for current in 0..num_sectors {
        let sector = first_sector + current;
        let source = &buffer[current as usize * SECTOR_SIZE..][..SECTOR_SIZE];

        if let Some(hit) = cache.find(sector, 0, now_ms) {
            hit.data.copy_from_slice(source);
            hit.dirty = true;
            let mut data = hit.data;
            issue(sector, 0, &mut data)?;
            if let Some(hit) = cache.find(sector, 0, now_ms) {
                hit.dirty = false;
            }
            continue;
        }

        let mut fresh = SectorBuffer {
            sector_low: sector,
            sector_high: 0,
            dirty: true,
            data: [0; SECTOR_SIZE],
        };
        fresh.data.copy_from_slice(source);
        issue(sector, 0, &mut fresh.data)?;
        fresh.dirty = false;
        cache.insert(fresh, now_ms);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn disk_of(sectors: usize) -> Vec<u8> {
        vec![0u8; sectors * SECTOR_SIZE]
    }

    fn issue_into<'d>(
        disk: &'d mut Vec<u8>,
        reads: &'d mut u32,
        is_write: bool,
    ) -> impl FnMut(u32, u32, &mut [u8; SECTOR_SIZE]) -> KernelResult<()> + 'd {
        move |sector, _high, data| {
            let start = sector as usize * SECTOR_SIZE;
            if is_write {
                disk[start..start + SECTOR_SIZE].copy_from_slice(data);
            } else {
                *reads += 1;
                data.copy_from_slice(&disk[start..start + SECTOR_SIZE]);
            }
            Ok(())
        }
    }

    #[test]
    fn read_miss_then_hit() {
        let mut disk = disk_of(16);
        disk[5 * SECTOR_SIZE] = 0x42;
        let mut reads = 0;
        let mut cache = SectorCache::new(NUM_CACHE_BUFFERS);

        let mut out = [0u8; SECTOR_SIZE];
        {
            let mut issue = issue_into(&mut disk, &mut reads, false);
            cached_read(&mut cache, 0, 5, 1, &mut out, &mut issue).unwrap();
            assert_eq!(out[0], 0x42);
            // Second read is served from the cache.
            cached_read(&mut cache, 10, 5, 1, &mut out, &mut issue).unwrap();
        }
        assert_eq!(reads, 1);
        assert_eq!(cache.entry_state(5, 0), Some(false));
    }

    #[test]
    fn write_through_lands_on_disk_and_marks_clean() {
        let mut disk = disk_of(16);
        let mut reads = 0;
        let mut cache = SectorCache::new(NUM_CACHE_BUFFERS);

        let pattern = [0xA5u8; SECTOR_SIZE];
        {
            let mut issue = issue_into(&mut disk, &mut reads, true);
            cached_write(&mut cache, 0, 7, 1, &pattern, &mut issue).unwrap();
        }
        assert_eq!(disk[7 * SECTOR_SIZE], 0xA5);
        assert_eq!(cache.entry_state(7, 0), Some(false));

        // A read of the written sector hits the cache, not the device.
        let mut out = [0u8; SECTOR_SIZE];
        {
            let mut issue = issue_into(&mut disk, &mut reads, false);
            cached_read(&mut cache, 1, 7, 1, &mut out, &mut issue).unwrap();
        }
        assert_eq!(reads, 0);
        assert_eq!(out[0], 0xA5);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut disk = disk_of(4);
        let mut reads = 0;
        let mut cache = SectorCache::new(NUM_CACHE_BUFFERS);

        let mut out = [0u8; SECTOR_SIZE];
        {
            let mut issue = issue_into(&mut disk, &mut reads, false);
            cached_read(&mut cache, 0, 1, 1, &mut out, &mut issue).unwrap();
            cached_read(&mut cache, DISK_CACHE_TTL_MS + 1, 1, 1, &mut out, &mut issue).unwrap();
        }
        assert_eq!(reads, 2);
    }

    #[test]
    fn lru_eviction_prefers_stale_entries() {
        let mut cache = SectorCache::new(2);
        for (sector, used_at) in [(1u32, 10u64), (2, 20)] {
            cache.insert(
                SectorBuffer {
                    sector_low: sector,
                    sector_high: 0,
                    dirty: false,
                    data: [0; SECTOR_SIZE],
                },
                used_at,
            );
        }

        cache.insert(
            SectorBuffer {
                sector_low: 3,
                sector_high: 0,
                dirty: false,
                data: [0; SECTOR_SIZE],
            },
            30,
        );
        assert_eq!(cache.len(), 2);
        assert!(cache.entry_state(1, 0).is_none());
        assert!(cache.entry_state(2, 0).is_some());
        assert!(cache.entry_state(3, 0).is_some());
    }

    #[test]
    fn failed_issue_propagates_and_skips_insert() {
        let mut cache = SectorCache::new(NUM_CACHE_BUFFERS);
        let mut out = [0u8; SECTOR_SIZE];
        let mut issue =
            |_s: u32, _h: u32, _d: &mut [u8; SECTOR_SIZE]| Err(KernelError::Hardware);
        assert!(matches!(
            cached_read(&mut cache, 0, 9, 1, &mut out, &mut issue),
            Err(KernelError::Hardware)
        ));
        assert!(cache.is_empty());
    }
}
