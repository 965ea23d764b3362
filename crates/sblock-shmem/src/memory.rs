use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use crate::error::{Result, ShmemError};
use crate::region::{PhysAddr, SharedRegion};

/// Allocation granularity for regions.
pub const PAGE_SIZE: usize = 4096;

/// Start of the simulated physical window used by [`PhysicalMemory::new`].
pub const DEFAULT_PHYS_BASE: u32 = 0x8000_0000;

/// Allocator and mapper for memory visible to both domains.
///
/// The domain that creates a channel calls `alloc`; the other domain learns
/// the physical base through the signalling channel and calls `map`.
pub trait ShmemProvider: Send + Sync {
    /// Allocate and map a new zero-filled region of at least `size` bytes.
    fn alloc(&self, size: usize) -> Result<SharedRegion>;

    /// Map an existing region given its physical base address.
    fn map(&self, addr: PhysAddr, size: usize) -> Result<SharedRegion>;

    /// Give a region back to the allocator.
    fn free(&self, region: &SharedRegion);
}

/// In-process physical memory shared by every domain holding the same handle.
///
/// Regions are carved from a simulated 32-bit physical window with a
/// page-aligned bump allocator and backed by anonymous shared mappings.
/// Freed address ranges are not reused.
pub struct PhysicalMemory {
    inner: Mutex<Window>,
}

struct Window {
    next: u64,
    end: u64,
    regions: BTreeMap<u32, SharedRegion>,
}

impl PhysicalMemory {
    /// Create a window starting at [`DEFAULT_PHYS_BASE`] and spanning the
    /// rest of the 32-bit address space.
    pub fn new() -> Self {
        Self::with_window(
            PhysAddr(DEFAULT_PHYS_BASE),
            (u32::MAX - DEFAULT_PHYS_BASE) as usize,
        )
    }

    /// Create a window of `size` bytes starting at `base`.
    pub fn with_window(base: PhysAddr, size: usize) -> Self {
        let start = u64::from(base.get());
        let end = (start + size as u64).min(u64::from(u32::MAX) + 1);
        Self {
            inner: Mutex::new(Window {
                next: start,
                end,
                regions: BTreeMap::new(),
            }),
        }
    }

    /// Number of regions currently allocated.
    pub fn region_count(&self) -> usize {
        self.lock().regions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PhysicalMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ShmemProvider for PhysicalMemory {
    fn alloc(&self, size: usize) -> Result<SharedRegion> {
        if size == 0 {
            return Err(ShmemError::ZeroSize);
        }
        let rounded = size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(ShmemError::Exhausted { requested: size })?;

        let mut window = self.lock();
        let start = window.next;
        // Keep one byte of headroom so `base + len` never wraps a u32.
        if start + rounded as u64 >= window.end {
            return Err(ShmemError::Exhausted { requested: size });
        }
        let base = PhysAddr(start as u32);
        let region = SharedRegion::anonymous(base, rounded)?;
        window.next = start + rounded as u64;
        window.regions.insert(base.get(), region.clone());

        info!(phys = %base, size = rounded, "allocated shared region");
        Ok(region)
    }

    fn map(&self, addr: PhysAddr, size: usize) -> Result<SharedRegion> {
        let window = self.lock();
        let region = window
            .regions
            .get(&addr.get())
            .ok_or(ShmemError::Unmapped(addr))?;
        region.check_range(0, size)?;
        debug!(phys = %addr, size, "mapped existing shared region");
        Ok(region.clone())
    }

    fn free(&self, region: &SharedRegion) {
        let mut window = self.lock();
        if window.regions.remove(&region.phys_base().get()).is_some() {
            debug!(phys = %region.phys_base(), "released shared region");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_page_aligned_and_disjoint() {
        let mem = PhysicalMemory::new();
        let a = mem.alloc(100).unwrap();
        let b = mem.alloc(5000).unwrap();

        assert_eq!(a.phys_base(), PhysAddr(DEFAULT_PHYS_BASE));
        assert_eq!(a.len(), PAGE_SIZE);
        assert_eq!(b.phys_base().get() as usize % PAGE_SIZE, 0);
        assert_eq!(b.len(), 2 * PAGE_SIZE);
        assert!(!a.contains(b.phys_base()));
        assert_eq!(mem.region_count(), 2);
    }

    #[test]
    fn map_returns_the_same_memory() {
        let mem = PhysicalMemory::new();
        let local = mem.alloc(4096).unwrap();
        local.store_u32(0, 0xCAFE);

        let remote = mem.map(local.phys_base(), 4096).unwrap();
        assert!(remote.same_mapping(&local));
        assert_eq!(remote.load_u32(0), 0xCAFE);
    }

    #[test]
    fn map_of_unknown_address_fails() {
        let mem = PhysicalMemory::new();
        let err = mem.map(PhysAddr(0x1234_0000), 16).unwrap_err();
        assert!(matches!(err, ShmemError::Unmapped(_)));
    }

    #[test]
    fn map_larger_than_region_fails() {
        let mem = PhysicalMemory::new();
        let region = mem.alloc(4096).unwrap();
        let err = mem.map(region.phys_base(), 8192).unwrap_err();
        assert!(matches!(err, ShmemError::OutOfBounds { .. }));
    }

    #[test]
    fn free_forgets_the_region() {
        let mem = PhysicalMemory::new();
        let region = mem.alloc(4096).unwrap();
        mem.free(&region);
        assert_eq!(mem.region_count(), 0);
        assert!(mem.map(region.phys_base(), 4096).is_err());
    }

    #[test]
    fn small_window_exhausts() {
        let mem = PhysicalMemory::with_window(PhysAddr(0x1000_0000), 3 * PAGE_SIZE);
        mem.alloc(PAGE_SIZE).unwrap();
        let err = mem.alloc(4 * PAGE_SIZE).unwrap_err();
        assert!(matches!(err, ShmemError::Exhausted { .. }));
    }
}
