//! Shared-region layout.
//!
//! The peer domain parses this layout directly, so every offset and word
//! below is part of the wire contract:
//!
//! ```text
//! offset 0    header: 4 descriptors x 24 bytes
//!             [ring tx][ring rx][pool tx][pool rx]
//!             descriptor = base, block size, block count, slots, rdptr, wrptr
//!             (six little-endian u32 words; addresses are physical)
//! align 64    tx block storage   (tx count x tx size)
//! align 64    rx block storage   (rx count x rx size)
//! align 8     ring tx slots, ring rx slots, pool tx slots, pool rx slots
//!             slot = { physical address u32, length u32 }
//! ```
//!
//! `tx`/`rx` are named from the host's point of view. The companion reads
//! the same header with directions swapped.

use serde::Serialize;
use sblock_shmem::{PhysAddr, SharedRegion};

use crate::config::Role;
use crate::error::{BlockError, Result};

/// Size of one descriptor.
pub const DESCRIPTOR_SIZE: usize = 24;
/// Size of the header (four descriptors).
pub const HEADER_SIZE: usize = 4 * DESCRIPTOR_SIZE;
/// Size of one slot.
pub const SLOT_SIZE: usize = 8;

/// Largest region a single channel or pool may occupy.
pub const MAX_REGION_SIZE: usize = 1 << 31;

const STORAGE_ALIGN: usize = 64;
const SLOT_ALIGN: usize = 8;

const WORD_BASE: usize = 0;
const WORD_BLOCK_SIZE: usize = 4;
const WORD_BLOCK_COUNT: usize = 8;
const WORD_SLOTS: usize = 12;
const WORD_RDPTR: usize = 16;
const WORD_WRPTR: usize = 20;

/// Descriptor position in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorId {
    RingTx,
    RingRx,
    PoolTx,
    PoolRx,
}

impl DescriptorId {
    pub const ALL: [DescriptorId; 4] = [
        DescriptorId::RingTx,
        DescriptorId::RingRx,
        DescriptorId::PoolTx,
        DescriptorId::PoolRx,
    ];

    /// Byte offset of this descriptor in the header.
    pub fn offset(self) -> usize {
        let index = match self {
            DescriptorId::RingTx => 0,
            DescriptorId::RingRx => 1,
            DescriptorId::PoolTx => 2,
            DescriptorId::PoolRx => 3,
        };
        index * DESCRIPTOR_SIZE
    }

    pub fn name(self) -> &'static str {
        match self {
            DescriptorId::RingTx => "ring-tx",
            DescriptorId::RingRx => "ring-rx",
            DescriptorId::PoolTx => "pool-tx",
            DescriptorId::PoolRx => "pool-rx",
        }
    }
}

/// Which header descriptor backs each local queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LocalView {
    pub ring_tx: DescriptorId,
    pub ring_rx: DescriptorId,
    pub pool_tx: DescriptorId,
    pub pool_rx: DescriptorId,
}

impl LocalView {
    pub(crate) fn for_role(role: Role) -> Self {
        match role {
            Role::Host => Self {
                ring_tx: DescriptorId::RingTx,
                ring_rx: DescriptorId::RingRx,
                pool_tx: DescriptorId::PoolTx,
                pool_rx: DescriptorId::PoolRx,
            },
            Role::Companion => Self {
                ring_tx: DescriptorId::RingRx,
                ring_rx: DescriptorId::RingTx,
                pool_tx: DescriptorId::PoolRx,
                pool_rx: DescriptorId::PoolTx,
            },
        }
    }
}

/// Block size and count of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub block_size: u32,
    pub block_count: u32,
}

impl Geometry {
    pub fn new(block_size: u32, block_count: u32) -> Self {
        Self {
            block_size,
            block_count,
        }
    }

    /// Bytes of block storage.
    pub fn bytes(&self) -> Option<usize> {
        (self.block_size as usize).checked_mul(self.block_count as usize)
    }
}

/// Computed placement of every structure in a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionLayout {
    pub tx: Geometry,
    pub rx: Geometry,
    pub ring_tx_capacity: u32,
    pub ring_rx_capacity: u32,
    pub tx_storage: usize,
    pub rx_storage: usize,
    pub ring_tx_slots: usize,
    pub ring_rx_slots: usize,
    pub pool_tx_slots: usize,
    pub pool_rx_slots: usize,
    pub size: usize,
}

impl RegionLayout {
    /// Layout of a channel region. Ring capacities exceed the pool counts
    /// when the channel also carries blocks borrowed from a shared pool.
    ///
    /// Returns `None` if the region would exceed [`MAX_REGION_SIZE`].
    pub fn channel(
        tx: Geometry,
        rx: Geometry,
        ring_tx_capacity: u32,
        ring_rx_capacity: u32,
    ) -> Option<Self> {
        let mut end = HEADER_SIZE;
        let tx_storage = place(&mut end, STORAGE_ALIGN, tx.bytes()?)?;
        let rx_storage = place(&mut end, STORAGE_ALIGN, rx.bytes()?)?;
        let ring_tx_slots = place(&mut end, SLOT_ALIGN, slots_len(ring_tx_capacity)?)?;
        let ring_rx_slots = place(&mut end, SLOT_ALIGN, slots_len(ring_rx_capacity)?)?;
        let pool_tx_slots = place(&mut end, SLOT_ALIGN, slots_len(tx.block_count)?)?;
        let pool_rx_slots = place(&mut end, SLOT_ALIGN, slots_len(rx.block_count)?)?;

        if end > MAX_REGION_SIZE {
            return None;
        }

        Some(Self {
            tx,
            rx,
            ring_tx_capacity,
            ring_rx_capacity,
            tx_storage,
            rx_storage,
            ring_tx_slots,
            ring_rx_slots,
            pool_tx_slots,
            pool_rx_slots,
            size: end,
        })
    }

    /// Layout of a shared-pool region: the same header with empty rings.
    pub fn pool(tx: Geometry, rx: Geometry) -> Option<Self> {
        Self::channel(tx, rx, 0, 0)
    }

    /// Zero the region and write a fresh header: rings empty, pools full.
    pub(crate) fn format(&self, region: &SharedRegion) -> Result<()> {
        region.check_range(0, self.size)?;
        region.fill(0, self.size, 0)?;

        let tx_base = region.phys_at(self.tx_storage);
        let rx_base = region.phys_at(self.rx_storage);

        let ring_tx = Descriptor::new(region, DescriptorId::RingTx);
        ring_tx.init(
            tx_base,
            self.tx.block_size,
            self.ring_tx_capacity,
            region.phys_at(self.ring_tx_slots),
            0,
        );
        let ring_rx = Descriptor::new(region, DescriptorId::RingRx);
        ring_rx.init(
            rx_base,
            self.rx.block_size,
            self.ring_rx_capacity,
            region.phys_at(self.ring_rx_slots),
            0,
        );

        let pool_tx = Descriptor::new(region, DescriptorId::PoolTx);
        pool_tx.init(
            tx_base,
            self.tx.block_size,
            self.tx.block_count,
            region.phys_at(self.pool_tx_slots),
            self.tx.block_count,
        );
        fill_slots(region, self.pool_tx_slots, tx_base, self.tx);

        let pool_rx = Descriptor::new(region, DescriptorId::PoolRx);
        pool_rx.init(
            rx_base,
            self.rx.block_size,
            self.rx.block_count,
            region.phys_at(self.pool_rx_slots),
            self.rx.block_count,
        );
        fill_slots(region, self.pool_rx_slots, rx_base, self.rx);

        Ok(())
    }
}

fn place(end: &mut usize, align: usize, len: usize) -> Option<usize> {
    let start = end.checked_next_multiple_of(align)?;
    *end = start.checked_add(len)?;
    Some(start)
}

fn slots_len(count: u32) -> Option<usize> {
    (count as usize).checked_mul(SLOT_SIZE)
}

fn fill_slots(region: &SharedRegion, slots: usize, base: PhysAddr, geometry: Geometry) {
    for index in 0..geometry.block_count {
        let offset = slots + index as usize * SLOT_SIZE;
        region.store_u32(offset, base.get() + index * geometry.block_size);
        region.store_u32(offset + 4, geometry.block_size);
    }
}

/// View of one descriptor inside a mapped region.
#[derive(Clone)]
pub(crate) struct Descriptor {
    region: SharedRegion,
    id: DescriptorId,
}

impl Descriptor {
    pub(crate) fn new(region: &SharedRegion, id: DescriptorId) -> Self {
        Self {
            region: region.clone(),
            id,
        }
    }

    fn load(&self, word: usize) -> u32 {
        self.region.load_u32(self.id.offset() + word)
    }

    fn store(&self, word: usize, value: u32) {
        self.region.store_u32(self.id.offset() + word, value);
    }

    fn init(&self, base: PhysAddr, block_size: u32, block_count: u32, slots: PhysAddr, wrptr: u32) {
        self.store(WORD_BASE, base.get());
        self.store(WORD_BLOCK_SIZE, block_size);
        self.store(WORD_BLOCK_COUNT, block_count);
        self.store(WORD_SLOTS, slots.get());
        self.store(WORD_RDPTR, 0);
        self.store(WORD_WRPTR, wrptr);
    }

    pub(crate) fn id(&self) -> DescriptorId {
        self.id
    }

    pub(crate) fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub(crate) fn base(&self) -> PhysAddr {
        PhysAddr(self.load(WORD_BASE))
    }

    pub(crate) fn block_size(&self) -> u32 {
        self.load(WORD_BLOCK_SIZE)
    }

    pub(crate) fn block_count(&self) -> u32 {
        self.load(WORD_BLOCK_COUNT)
    }

    pub(crate) fn slots(&self) -> PhysAddr {
        PhysAddr(self.load(WORD_SLOTS))
    }

    pub(crate) fn rdptr(&self) -> u32 {
        self.load(WORD_RDPTR)
    }

    pub(crate) fn wrptr(&self) -> u32 {
        self.load(WORD_WRPTR)
    }

    pub(crate) fn set_rdptr(&self, value: u32) {
        self.store(WORD_RDPTR, value);
    }

    pub(crate) fn set_wrptr(&self, value: u32) {
        self.store(WORD_WRPTR, value);
    }

    /// Validate a pool descriptor written by the host.
    pub(crate) fn check_pool(&self, expect: Geometry) -> Result<()> {
        self.check_shape(expect.block_size, expect.block_count)?;
        if expect.block_count > 0 {
            let len = expect.bytes().unwrap_or(usize::MAX);
            self.check_span("storage", self.base(), len)?;
        }
        Ok(())
    }

    /// Validate a ring descriptor written by the host.
    pub(crate) fn check_ring(&self, block_size: u32, capacity: u32) -> Result<()> {
        self.check_shape(block_size, capacity)
    }

    fn check_shape(&self, block_size: u32, block_count: u32) -> Result<()> {
        if self.block_size() != block_size || self.block_count() != block_count {
            return Err(BlockError::LayoutMismatch(format!(
                "{}: header has {} x {} bytes, expected {} x {} bytes",
                self.id.name(),
                self.block_count(),
                self.block_size(),
                block_count,
                block_size
            )));
        }
        if block_count > 0 {
            self.check_span("slots", self.slots(), block_count as usize * SLOT_SIZE)?;
        }
        let occupancy = self.wrptr().wrapping_sub(self.rdptr());
        if occupancy > block_count {
            return Err(BlockError::LayoutMismatch(format!(
                "{}: occupancy {occupancy} exceeds capacity {block_count}",
                self.id.name()
            )));
        }
        Ok(())
    }

    fn check_span(&self, what: &str, addr: PhysAddr, len: usize) -> Result<()> {
        self.region
            .offset_of(addr)
            .and_then(|offset| self.region.check_range(offset, len))
            .map_err(|err| {
                BlockError::LayoutMismatch(format!("{} {what} at {addr}: {err}", self.id.name()))
            })
    }
}
