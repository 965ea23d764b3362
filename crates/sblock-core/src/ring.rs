use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{trace, warn};

use crate::arena::{Lane, Lanes};
use crate::block::Block;
use crate::error::{BlockError, Rejected, Result};
use crate::ledger::BlockState;
use crate::queue::{Queue, Slot};

/// Transfer ring: FIFO of blocks in flight to or from the peer.
pub(crate) struct Ring {
    queue: Mutex<Queue>,
}

impl Ring {
    pub(crate) fn new(queue: Queue) -> Self {
        Self {
            queue: Mutex::new(queue),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn occupancy(&self) -> u32 {
        self.lock().occupancy()
    }

    /// Hand a block to the peer. The block stops being on loan.
    pub(crate) fn enqueue(&self, block: Block, lane: &Lane) -> std::result::Result<(), Rejected> {
        if let Some(reason) = lane.reject_reason(&block) {
            return Err(Rejected::new(BlockError::InvalidBlock(reason), block));
        }
        if lane.ledger().state(block.index()) != Some(BlockState::Pending) {
            let error = BlockError::InvalidBlock(format!("block {} is not on loan", block.index()));
            return Err(Rejected::new(error, block));
        }

        let mut queue = self.lock();
        if !queue.push_back(block.slot()) {
            drop(queue);
            return Err(Rejected::new(
                BlockError::InvalidBlock("transfer ring full".into()),
                block,
            ));
        }
        lane.ledger().mark(block.index(), BlockState::Done);
        trace!(ring = queue.id().name(), index = block.index(), len = block.len(), "enqueued");
        Ok(())
    }

    /// Take the oldest arrived block, resolving which lane owns it.
    pub(crate) fn dequeue(&self, lanes: &Lanes) -> Result<Option<Block>> {
        let mut queue = self.lock();
        let Some(Slot { addr, len }) = queue.pop_front() else {
            return Ok(None);
        };
        let Some((lane, index)) = lanes.resolve(addr) else {
            warn!(ring = queue.id().name(), %addr, "ring slot outside storage, dropping");
            return Err(BlockError::InvalidBlock(format!(
                "ring slot {addr} outside storage"
            )));
        };
        let capacity = lane.storage().geometry().block_size;
        if len > capacity {
            warn!(ring = queue.id().name(), index, len, capacity, "slot length clamped");
        }
        lane.ledger().mark(index, BlockState::Pending);
        trace!(ring = queue.id().name(), index, len, "dequeued");
        Ok(Some(lane.block(index, len)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sblock_shmem::{PhysicalMemory, ShmemProvider};

    use super::*;
    use crate::arena::Storage;
    use crate::block::{Direction, Home};
    use crate::layout::{Descriptor, DescriptorId, Geometry, RegionLayout};
    use crate::pool::Pool;

    struct Fixture {
        pool: Pool,
        ring: Ring,
        rx: Lanes,
    }

    // Loop the host tx ring back into a receive path over the same storage.
    fn fixture() -> Fixture {
        let layout =
            RegionLayout::channel(Geometry::new(64, 3), Geometry::new(64, 1), 3, 1).expect("fits");
        let region = PhysicalMemory::new().alloc(layout.size).expect("alloc");
        layout.format(&region).expect("format");
        let pool_desc = Descriptor::new(&region, DescriptorId::PoolTx);
        let storage = || Storage::from_descriptor(&pool_desc).expect("storage");
        let tx_lane = Arc::new(Lane::new(storage(), Home::Private, Direction::Tx));
        let rx_lane = Arc::new(Lane::new(storage(), Home::Private, Direction::Rx));
        Fixture {
            pool: Pool::new(Queue::attach(pool_desc.clone()).expect("queue"), tx_lane),
            ring: Ring::new(
                Queue::attach(Descriptor::new(&region, DescriptorId::RingTx)).expect("queue"),
            ),
            rx: Lanes {
                private: rx_lane,
                shared: None,
            },
        }
    }

    #[test]
    fn enqueue_dequeue_preserves_order_and_payload() {
        let fx = fixture();
        let mut first = fx.pool.acquire().expect("acquire").expect("block");
        first.write(b"one").expect("write");
        let mut second = fx.pool.acquire().expect("acquire").expect("block");
        second.write(b"two!").expect("write");

        fx.ring.enqueue(first, fx.pool.lane()).expect("enqueue");
        fx.ring.enqueue(second, fx.pool.lane()).expect("enqueue");
        assert_eq!(fx.ring.occupancy(), 2);
        assert_eq!(fx.pool.lane().ledger().pending_count(), 0);

        let a = fx.ring.dequeue(&fx.rx).expect("dequeue").expect("block");
        let b = fx.ring.dequeue(&fx.rx).expect("dequeue").expect("block");
        assert_eq!(a.as_slice(), b"one");
        assert_eq!(b.as_slice(), b"two!");
        assert_eq!(a.direction(), Direction::Rx);
        assert_eq!(fx.rx.private.ledger().pending_count(), 2);
        assert!(fx.ring.dequeue(&fx.rx).expect("dequeue").is_none());
    }

    #[test]
    fn enqueue_rejects_wrong_direction() {
        let fx = fixture();
        let block = fx.pool.acquire().expect("acquire").expect("block");
        fx.ring.enqueue(block, fx.pool.lane()).expect("enqueue");
        let received = fx.ring.dequeue(&fx.rx).expect("dequeue").expect("block");

        let rejected = fx.ring.enqueue(received, fx.pool.lane()).unwrap_err();
        assert!(matches!(rejected.error, BlockError::InvalidBlock(_)));
        assert_eq!(fx.ring.occupancy(), 0);
    }
}
