use std::fmt;

use serde::Serialize;
use sblock_shmem::{PhysAddr, SharedRegion};

use crate::error::{BlockError, Result};
use crate::queue::Slot;

/// Which way a block travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Obtained with `get`, handed over with `send`.
    Tx,
    /// Obtained with `receive`, returned with `release`.
    Rx,
}

/// The pool that owns a block's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Home {
    /// The channel's own pool.
    Private,
    /// The peer-wide shared pool.
    Shared,
}

/// A fixed-size chunk of shared memory on loan to the caller.
///
/// Blocks are not `Clone`: exactly one owner exists at a time, and the
/// block must eventually be handed back through `send`, `put` or
/// `release`. Dropping a block leaks it until the next recovery.
pub struct Block {
    region: SharedRegion,
    offset: usize,
    addr: PhysAddr,
    index: u32,
    capacity: u32,
    len: u32,
    direction: Direction,
    home: Home,
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        region: SharedRegion,
        offset: usize,
        addr: PhysAddr,
        index: u32,
        capacity: u32,
        len: u32,
        direction: Direction,
        home: Home,
    ) -> Self {
        Self {
            region,
            offset,
            addr,
            index,
            capacity,
            len: len.min(capacity),
            direction,
            home,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn home(&self) -> Home {
        self.home
    }

    /// Position of the block in its pool's storage.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Valid payload bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Block size.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the range lies inside the region (checked when the storage
        // was attached) and this handle is the block's only owner.
        unsafe { self.region.bytes(self.offset, self.len as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` makes the borrow exclusive locally.
        unsafe { self.region.bytes_mut(self.offset, self.len as usize) }
    }

    /// Replace the payload with `data`.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity as usize {
            return Err(BlockError::InvalidBlock(format!(
                "payload of {} bytes exceeds block size {}",
                data.len(),
                self.capacity
            )));
        }
        self.region.write_bytes(self.offset, data)?;
        self.len = data.len() as u32;
        Ok(())
    }

    /// Set the number of valid payload bytes.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.capacity as usize {
            return Err(BlockError::InvalidBlock(format!(
                "length {len} exceeds block size {}",
                self.capacity
            )));
        }
        self.len = len as u32;
        Ok(())
    }

    pub(crate) fn addr(&self) -> PhysAddr {
        self.addr
    }

    pub(crate) fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub(crate) fn slot(&self) -> Slot {
        Slot {
            addr: self.addr,
            len: self.len,
        }
    }

    /// Slot describing the whole block, as pools store it.
    pub(crate) fn full_slot(&self) -> Slot {
        Slot {
            addr: self.addr,
            len: self.capacity,
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("direction", &self.direction)
            .field("home", &self.home)
            .field("index", &self.index)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}
