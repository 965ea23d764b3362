use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::error::{Result, ShmemError};

/// A 32-bit physical address as exchanged with the peer domain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    /// The raw address word.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Address `bytes` past this one, or `None` on 32-bit overflow.
    pub fn checked_add(self, bytes: usize) -> Option<PhysAddr> {
        let bytes = u32::try_from(bytes).ok()?;
        self.0.checked_add(bytes).map(PhysAddr)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Backing storage for a region; unmapped when the last handle drops.
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory. All shared mutation goes through
// `AtomicU32` words or through byte ranges whose exclusive use is arbitrated
// by the block ownership protocol above this layer.
unsafe impl Send for Mapping {}
// SAFETY: see `Send` above.
unsafe impl Sync for Mapping {}

impl Mapping {
    #[cfg(unix)]
    fn anonymous(len: usize) -> Result<Self> {
        // SAFETY: requesting a fresh anonymous mapping; no existing memory is
        // aliased and the result is checked against MAP_FAILED.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(ShmemError::Map {
                size: len,
                source: std::io::Error::last_os_error(),
            });
        }
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(|| ShmemError::Map {
            size: len,
            source: std::io::Error::other("mmap returned null"),
        })?;
        Ok(Self { ptr, len })
    }

    #[cfg(not(unix))]
    fn anonymous(len: usize) -> Result<Self> {
        let layout = std::alloc::Layout::from_size_align(len, crate::memory::PAGE_SIZE).map_err(
            |err| ShmemError::Map {
                size: len,
                source: std::io::Error::other(err.to_string()),
            },
        )?;
        // SAFETY: layout has a non-zero size (checked by the caller).
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| ShmemError::Map {
            size: len,
            source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
        })?;
        Ok(Self { ptr, len })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: ptr/len describe a mapping created by `mmap` above and
            // no handle to it survives this drop.
            let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.len) };
            if rc != 0 {
                tracing::warn!(
                    len = self.len,
                    error = %std::io::Error::last_os_error(),
                    "munmap failed"
                );
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) =
                std::alloc::Layout::from_size_align(self.len, crate::memory::PAGE_SIZE)
            {
                // SAFETY: allocated in `anonymous` with this exact layout.
                unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
            }
        }
    }
}

/// One contiguous shared-memory region.
///
/// Cloning yields another handle to the same mapping, which is how a second
/// domain in the same process "maps" a region it learned about by address.
/// Descriptor words are accessed as little-endian 32-bit atomics with
/// acquire/release ordering so pointer updates become visible to the peer in
/// program order.
#[derive(Clone)]
pub struct SharedRegion {
    map: Arc<Mapping>,
    phys_base: PhysAddr,
}

impl SharedRegion {
    /// Map a fresh zero-filled region and place it at `phys_base`.
    pub fn anonymous(phys_base: PhysAddr, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(ShmemError::ZeroSize);
        }
        if phys_base.checked_add(len).is_none() {
            return Err(ShmemError::Exhausted { requested: len });
        }
        let map = Mapping::anonymous(len)?;
        trace!(phys = %phys_base, len, "mapped shared region");
        Ok(Self {
            map: Arc::new(map),
            phys_base,
        })
    }

    /// Physical address of the first byte.
    pub fn phys_base(&self) -> PhysAddr {
        self.phys_base
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize {
        self.map.len
    }

    /// Always false; zero-sized regions cannot be created.
    pub fn is_empty(&self) -> bool {
        self.map.len == 0
    }

    /// Whether `addr` falls inside this region.
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.phys_base && ((addr.0 - self.phys_base.0) as usize) < self.map.len
    }

    /// Translate a physical address into a local offset.
    pub fn offset_of(&self, addr: PhysAddr) -> Result<usize> {
        if !self.contains(addr) {
            return Err(ShmemError::Unmapped(addr));
        }
        Ok((addr.0 - self.phys_base.0) as usize)
    }

    /// Translate a local offset into a physical address.
    ///
    /// # Panics
    ///
    /// Panics if `offset` lies beyond the end of the region.
    pub fn phys_at(&self, offset: usize) -> PhysAddr {
        assert!(
            offset <= self.map.len,
            "offset {offset:#x} outside region of {:#x} bytes",
            self.map.len
        );
        PhysAddr(self.phys_base.0 + offset as u32)
    }

    /// Validate that `offset..offset + len` lies inside the region.
    pub fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.map.len => Ok(()),
            _ => Err(ShmemError::OutOfBounds {
                offset,
                len,
                size: self.map.len,
            }),
        }
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.map.len,
            "word offset {offset:#x} invalid for region of {:#x} bytes",
            self.map.len
        );
        // SAFETY: offset is in bounds and 4-byte aligned (the mapping itself is
        // page aligned); AtomicU32 has the size and alignment of u32.
        unsafe { &*self.map.ptr.as_ptr().add(offset).cast::<AtomicU32>() }
    }

    /// Load a little-endian descriptor word.
    ///
    /// # Panics
    ///
    /// Panics if the word is misaligned or out of bounds. Descriptor offsets
    /// are fixed by the layout, so this indicates a layout bug.
    pub fn load_u32(&self, offset: usize) -> u32 {
        u32::from_le(self.word(offset).load(Ordering::Acquire))
    }

    /// Store a little-endian descriptor word.
    ///
    /// # Panics
    ///
    /// Same conditions as [`SharedRegion::load_u32`].
    pub fn store_u32(&self, offset: usize, value: u32) {
        self.word(offset).store(value.to_le(), Ordering::Release);
    }

    /// Copy bytes out of the region.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        // SAFETY: range checked above; the destination is a distinct local buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map.ptr.as_ptr().add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes into the region.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        // SAFETY: range checked above; the source is a distinct local buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.map.ptr.as_ptr().add(offset),
                src.len(),
            );
        }
        Ok(())
    }

    /// Fill a byte range with `value`.
    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: range checked above.
        unsafe { std::ptr::write_bytes(self.map.ptr.as_ptr().add(offset), value, len) };
        Ok(())
    }

    /// Borrow a byte range.
    ///
    /// # Safety
    ///
    /// The range must be in bounds and no other party (local or peer) may
    /// write to it while the returned slice is alive.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.map.ptr.as_ptr().add(offset), len)
    }

    /// Mutably borrow a byte range.
    ///
    /// # Safety
    ///
    /// The range must be in bounds and the caller must hold exclusive
    /// ownership of it for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.map.ptr.as_ptr().add(offset), len)
    }

    /// Whether two handles refer to the same mapping.
    pub fn same_mapping(&self, other: &SharedRegion) -> bool {
        Arc::ptr_eq(&self.map, &other.map)
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("phys_base", &self.phys_base)
            .field("len", &self.map.len)
            .finish()
    }
}
