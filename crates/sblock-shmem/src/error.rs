use crate::region::PhysAddr;

/// Errors that can occur while mapping or addressing shared memory.
#[derive(Debug, thiserror::Error)]
pub enum ShmemError {
    /// The operating system refused the mapping.
    #[error("failed to map {size} bytes of shared memory: {source}")]
    Map {
        size: usize,
        source: std::io::Error,
    },

    /// A zero-sized region was requested.
    #[error("shared memory region size must be non-zero")]
    ZeroSize,

    /// The physical address does not belong to any known region.
    #[error("physical address {0} is not mapped")]
    Unmapped(PhysAddr),

    /// A byte range falls outside the region.
    #[error("range {offset:#x}+{len:#x} exceeds region of {size:#x} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// The simulated physical window has no room left.
    #[error("physical address space exhausted ({requested} bytes requested)")]
    Exhausted { requested: usize },
}

pub type Result<T> = std::result::Result<T, ShmemError>;
