use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{trace, warn};

use crate::arena::Lane;
use crate::block::Block;
use crate::error::{BlockError, Rejected, Result};
use crate::ledger::BlockState;
use crate::queue::{Queue, Slot};

/// Free list of one storage area.
///
/// The ledger is updated under the same lock that moves the pointer, so a
/// block's entry and its presence in the queue never disagree.
pub(crate) struct Pool {
    queue: Mutex<Queue>,
    lane: Arc<Lane>,
}

impl Pool {
    pub(crate) fn new(queue: Queue, lane: Arc<Lane>) -> Self {
        Self {
            queue: Mutex::new(queue),
            lane,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lane(&self) -> &Arc<Lane> {
        &self.lane
    }

    pub(crate) fn occupancy(&self) -> u32 {
        self.lock().occupancy()
    }

    /// Take the oldest free block. Never blocks.
    pub(crate) fn acquire(&self) -> Result<Option<Block>> {
        let mut queue = self.lock();
        let Some(slot) = queue.pop_front() else {
            return Ok(None);
        };
        let Some(index) = self.lane.storage().index_of(slot.addr) else {
            warn!(pool = queue.id().name(), addr = %slot.addr, "pool slot outside storage, dropping");
            return Err(BlockError::InvalidBlock(format!(
                "pool slot {} outside storage",
                slot.addr
            )));
        };
        self.lane.ledger().mark(index, BlockState::Pending);
        trace!(pool = queue.id().name(), index, "acquired");
        Ok(Some(self.lane.block(index, slot.len)))
    }

    /// Return a block at the tail. Reports whether the pool went from empty
    /// to non-empty.
    pub(crate) fn release(&self, block: Block) -> std::result::Result<bool, Rejected> {
        if let Err(error) = self.admit(&block) {
            return Err(Rejected::new(error, block));
        }
        let mut queue = self.lock();
        let was_empty = queue.is_empty();
        if !queue.push_back(block.full_slot()) {
            drop(queue);
            return Err(Rejected::new(
                BlockError::InvalidBlock("pool already full".into()),
                block,
            ));
        }
        self.lane.ledger().mark(block.index(), BlockState::Done);
        trace!(pool = queue.id().name(), index = block.index(), "released");
        Ok(was_empty)
    }

    /// Return a block ahead of the read pointer so the next `acquire` hands
    /// the same block out again.
    pub(crate) fn give_back(&self, block: Block) -> std::result::Result<(), Rejected> {
        if let Err(error) = self.admit(&block) {
            return Err(Rejected::new(error, block));
        }
        let mut queue = self.lock();
        if !queue.push_front(block.full_slot()) {
            drop(queue);
            return Err(Rejected::new(
                BlockError::InvalidBlock("pool already full".into()),
                block,
            ));
        }
        self.lane.ledger().mark(block.index(), BlockState::Done);
        trace!(pool = queue.id().name(), index = block.index(), "given back");
        Ok(())
    }

    fn admit(&self, block: &Block) -> Result<()> {
        if let Some(reason) = self.lane.reject_reason(block) {
            return Err(BlockError::InvalidBlock(reason));
        }
        if self.lane.ledger().state(block.index()) != Some(BlockState::Pending) {
            return Err(BlockError::InvalidBlock(format!(
                "block {} is not on loan",
                block.index()
            )));
        }
        Ok(())
    }
}

/// Refill a pool from its ledger: every block reading `Done` goes back in,
/// `Pending` blocks stay out. Returns the new occupancy.
pub(crate) fn rebuild(queue: &mut Queue, lane: &Lane) -> u32 {
    queue.collapse();
    let block_size = lane.storage().geometry().block_size;
    for index in lane.ledger().done_indices() {
        let slot = Slot {
            addr: lane.storage().addr_of(index),
            len: block_size,
        };
        if !queue.push_back(slot) {
            warn!(pool = queue.id().name(), index, "pool full during rebuild");
            break;
        }
    }
    queue.occupancy()
}

#[cfg(test)]
mod tests {
    use sblock_shmem::{PhysicalMemory, ShmemProvider};

    use super::*;
    use crate::arena::Storage;
    use crate::block::{Direction, Home};
    use crate::layout::{Descriptor, DescriptorId, Geometry, RegionLayout};

    fn pool(count: u32) -> Pool {
        let layout =
            RegionLayout::channel(Geometry::new(128, count), Geometry::new(64, 1), count, 1)
                .expect("fits");
        let region = PhysicalMemory::new().alloc(layout.size).expect("alloc");
        layout.format(&region).expect("format");
        let desc = Descriptor::new(&region, DescriptorId::PoolTx);
        let lane = Arc::new(Lane::new(
            Storage::from_descriptor(&desc).expect("storage"),
            Home::Private,
            Direction::Tx,
        ));
        Pool::new(Queue::attach(desc).expect("queue"), lane)
    }

    #[test]
    fn acquire_until_empty() {
        let pool = pool(4);
        let blocks: Vec<_> = (0..4)
            .map(|_| pool.acquire().expect("acquire").expect("block"))
            .collect();
        assert!(pool.acquire().expect("acquire").is_none());
        assert_eq!(pool.lane().ledger().pending_count(), 4);
        assert_eq!(
            blocks.iter().map(Block::index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert!(blocks.iter().all(|block| block.len() == 128));
    }

    #[test]
    fn release_reports_empty_edge() {
        let pool = pool(2);
        let a = pool.acquire().expect("acquire").expect("block");
        let b = pool.acquire().expect("acquire").expect("block");
        assert!(pool.release(a).expect("release"));
        assert!(!pool.release(b).expect("release"));
        assert_eq!(pool.occupancy(), 2);
        assert_eq!(pool.lane().ledger().pending_count(), 0);
    }

    #[test]
    fn give_back_is_lifo() {
        let pool = pool(4);
        let first = pool.acquire().expect("acquire").expect("block");
        let index = first.index();
        pool.give_back(first).expect("give back");
        assert_eq!(pool.occupancy(), 4);
        let again = pool.acquire().expect("acquire").expect("block");
        assert_eq!(again.index(), index);
    }

    #[test]
    fn block_not_on_loan_is_rejected() {
        let pool = pool(2);
        let block = pool.acquire().expect("acquire").expect("block");
        let forged = pool.lane().block(1, 0);
        let rejected = pool.release(forged).unwrap_err();
        assert!(matches!(rejected.error, BlockError::InvalidBlock(_)));
        assert_eq!(rejected.into_block().index(), 1);
        pool.release(block).expect("real block returns");
    }

    #[test]
    fn rebuild_skips_pending() {
        let pool = pool(4);
        let held_a = pool.acquire().expect("acquire").expect("block");
        let held_b = pool.acquire().expect("acquire").expect("block");
        let returned = pool.acquire().expect("acquire").expect("block");
        pool.release(returned).expect("release");

        let lane = Arc::clone(pool.lane());
        let occupancy = rebuild(&mut pool.lock(), &lane);
        assert_eq!(occupancy, 2);

        let mut seen = Vec::new();
        while let Some(block) = pool.acquire().expect("acquire") {
            seen.push(block.index());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 3]);
        assert!(!seen.contains(&held_a.index()));
        assert!(!seen.contains(&held_b.index()));
    }
}
