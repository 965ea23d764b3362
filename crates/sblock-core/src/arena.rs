//! Block storage areas and their ledgers.

use std::sync::Arc;

use sblock_shmem::{PhysAddr, SharedRegion};

use crate::block::{Block, Direction, Home};
use crate::error::Result;
use crate::layout::{Descriptor, Geometry};
use crate::ledger::Ledger;

/// Contiguous block storage described by a pool descriptor.
pub(crate) struct Storage {
    region: SharedRegion,
    base: PhysAddr,
    offset: usize,
    geometry: Geometry,
}

impl Storage {
    pub(crate) fn from_descriptor(desc: &Descriptor) -> Result<Self> {
        let region = desc.region().clone();
        let geometry = Geometry::new(desc.block_size(), desc.block_count());
        let base = desc.base();
        let offset = if geometry.block_count == 0 {
            0
        } else {
            let offset = region.offset_of(base)?;
            region.check_range(offset, geometry.bytes().unwrap_or(usize::MAX))?;
            offset
        };
        Ok(Self {
            region,
            base,
            offset,
            geometry,
        })
    }

    pub(crate) fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Index of the block starting at `addr`, if it belongs here.
    pub(crate) fn index_of(&self, addr: PhysAddr) -> Option<u32> {
        let delta = addr.get().checked_sub(self.base.get())?;
        if self.geometry.block_size == 0 || delta % self.geometry.block_size != 0 {
            return None;
        }
        let index = delta / self.geometry.block_size;
        (index < self.geometry.block_count).then_some(index)
    }

    pub(crate) fn addr_of(&self, index: u32) -> PhysAddr {
        PhysAddr(self.base.get() + index * self.geometry.block_size)
    }

    fn offset_of(&self, index: u32) -> usize {
        self.offset + index as usize * self.geometry.block_size as usize
    }
}

/// One storage area plus the ledger tracking its blocks.
pub(crate) struct Lane {
    storage: Storage,
    ledger: Ledger,
    home: Home,
    direction: Direction,
}

impl Lane {
    pub(crate) fn new(storage: Storage, home: Home, direction: Direction) -> Self {
        let ledger = Ledger::new(storage.geometry.block_count);
        Self {
            storage,
            ledger,
            home,
            direction,
        }
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub(crate) fn block(&self, index: u32, len: u32) -> Block {
        Block::new(
            self.storage.region.clone(),
            self.storage.offset_of(index),
            self.storage.addr_of(index),
            index,
            self.storage.geometry.block_size,
            len,
            self.direction,
            self.home,
        )
    }

    /// Why `block` cannot be returned to this lane, if it cannot.
    pub(crate) fn reject_reason(&self, block: &Block) -> Option<String> {
        if block.direction() != self.direction {
            return Some(format!(
                "{:?} block used on the {:?} path",
                block.direction(),
                self.direction
            ));
        }
        if block.home() != self.home || !block.region().same_mapping(&self.storage.region) {
            return Some("block belongs to another channel or pool".into());
        }
        if self.storage.index_of(block.addr()) != Some(block.index()) {
            return Some(format!("block {} outside storage", block.index()));
        }
        None
    }
}

/// The lanes a channel can see for one direction.
#[derive(Clone)]
pub(crate) struct Lanes {
    pub private: Arc<Lane>,
    pub shared: Option<Arc<Lane>>,
}

impl Lanes {
    pub(crate) fn home(&self, home: Home) -> Option<&Arc<Lane>> {
        match home {
            Home::Private => Some(&self.private),
            Home::Shared => self.shared.as_ref(),
        }
    }

    /// Find the lane and index owning `addr`.
    pub(crate) fn resolve(&self, addr: PhysAddr) -> Option<(&Arc<Lane>, u32)> {
        if let Some(index) = self.private.storage.index_of(addr) {
            return Some((&self.private, index));
        }
        let shared = self.shared.as_ref()?;
        shared.storage.index_of(addr).map(|index| (shared, index))
    }
}
