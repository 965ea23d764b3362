use sblock_shmem::PhysAddr;

use crate::error::Result;
use crate::layout::{Descriptor, DescriptorId, SLOT_SIZE};

/// One slot entry: which block, and how many bytes of it are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub addr: PhysAddr,
    pub len: u32,
}

/// FIFO over a descriptor and its slot array.
///
/// `rdptr`/`wrptr` only ever increase; the slot for a pointer is
/// `ptr % capacity`. Callers serialize access with a local lock. The peer
/// writes the opposite pointer concurrently, so every pointer read goes
/// back to shared memory.
pub(crate) struct Queue {
    desc: Descriptor,
    slots: usize,
    capacity: u32,
}

impl Queue {
    pub(crate) fn attach(desc: Descriptor) -> Result<Self> {
        let capacity = desc.block_count();
        let slots = if capacity == 0 {
            0
        } else {
            let region = desc.region();
            let slots = region.offset_of(desc.slots())?;
            region.check_range(slots, capacity as usize * SLOT_SIZE)?;
            slots
        };
        Ok(Self {
            desc,
            slots,
            capacity,
        })
    }

    pub(crate) fn id(&self) -> DescriptorId {
        self.desc.id()
    }

    pub(crate) fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    pub(crate) fn occupancy(&self) -> u32 {
        self.desc.wrptr().wrapping_sub(self.desc.rdptr())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    fn slot_offset(&self, ptr: u32) -> usize {
        self.slots + (ptr % self.capacity) as usize * SLOT_SIZE
    }

    fn read_slot(&self, ptr: u32) -> Slot {
        let offset = self.slot_offset(ptr);
        let region = self.desc.region();
        Slot {
            addr: PhysAddr(region.load_u32(offset)),
            len: region.load_u32(offset + 4),
        }
    }

    fn write_slot(&self, ptr: u32, slot: Slot) {
        let offset = self.slot_offset(ptr);
        let region = self.desc.region();
        region.store_u32(offset, slot.addr.get());
        region.store_u32(offset + 4, slot.len);
    }

    /// Append at `wrptr`. Returns `false` if the queue is full.
    pub(crate) fn push_back(&mut self, slot: Slot) -> bool {
        if self.occupancy() >= self.capacity {
            return false;
        }
        let wr = self.desc.wrptr();
        self.write_slot(wr, slot);
        self.desc.set_wrptr(wr.wrapping_add(1));
        true
    }

    /// Take from `rdptr`.
    pub(crate) fn pop_front(&mut self) -> Option<Slot> {
        if self.is_empty() {
            return None;
        }
        let rd = self.desc.rdptr();
        let slot = self.read_slot(rd);
        self.desc.set_rdptr(rd.wrapping_add(1));
        Some(slot)
    }

    /// Insert ahead of `rdptr` so the slot is the next one popped.
    pub(crate) fn push_front(&mut self, slot: Slot) -> bool {
        if self.occupancy() >= self.capacity {
            return false;
        }
        let rd = self.desc.rdptr().wrapping_sub(1);
        self.write_slot(rd, slot);
        self.desc.set_rdptr(rd);
        true
    }

    /// Drop everything queued (`rdptr := wrptr`). Returns how many slots
    /// were discarded.
    pub(crate) fn collapse(&mut self) -> u32 {
        let discarded = self.occupancy();
        self.desc.set_rdptr(self.desc.wrptr());
        discarded
    }
}
