//! Shared-memory regions shared between two processor domains.
//!
//! Two address spaces are involved whenever a region is shared with a peer:
//! - the *physical* space, where every address is a 32-bit word as it appears
//!   in shared descriptors and on the signalling wire ([`PhysAddr`])
//! - the *local* space, the mapping this process dereferences
//!
//! A [`SharedRegion`] carries both and translates between them. Nothing above
//! this layer does pointer arithmetic on mappings directly.
//!
//! This is the lowest layer of sblock. Allocation and mapping of regions is
//! delegated to a [`ShmemProvider`]; [`PhysicalMemory`] is the in-process
//! implementation used when both domains live in one address space.

pub mod error;
pub mod memory;
pub mod region;

pub use error::{Result, ShmemError};
pub use memory::{PhysicalMemory, ShmemProvider, DEFAULT_PHYS_BASE, PAGE_SIZE};
pub use region::{PhysAddr, SharedRegion};
