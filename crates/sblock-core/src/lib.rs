//! Zero-copy block transport between two processor domains.
//!
//! Two domains share one physical memory region and otherwise only exchange
//! short messages over a signalling link. A channel carves the region into:
//! - a transmit and a receive pool of fixed-size blocks (free lists)
//! - a transmit and a receive ring of blocks in flight to the peer
//!
//! Callers borrow a block with [`ChannelHandle::get`], fill it, and hand it to
//! the peer with [`ChannelHandle::send`]. The peer takes it with
//! [`ChannelHandle::receive`] and gives it back with
//! [`ChannelHandle::release`]. Payloads never cross the signalling link.
//!
//! Every queue pointer in the shared header has exactly one writer domain,
//! so no cross-domain atomics are needed. A per-block ledger records which
//! blocks local callers hold; when the peer resets, rings are discarded and
//! pools are rebuilt from the ledger.
//!
//! [`SharedPool`] lets many channels of one peer borrow from a common pool
//! on top of their private ones.

mod arena;
pub mod block;
pub mod channel;
pub mod config;
pub mod error;
pub mod layout;
mod ledger;
mod pool;
mod queue;
pub mod recovery;
pub mod registry;
mod ring;
pub mod sched;
pub mod shared;
pub mod snapshot;
mod wait;
mod worker;

pub use block::{Block, Direction, Home};
pub use channel::{ChannelEvent, ChannelHandle, ChannelState};
pub use config::{ChannelConfig, NotifierPolicy, Role, SharedPoolConfig, Wait, MAX_BLOCK_COUNT};
pub use error::{BlockError, Rejected, Result};
pub use layout::{DescriptorId, Geometry, RegionLayout, DESCRIPTOR_SIZE, HEADER_SIZE, SLOT_SIZE};
pub use recovery::RecoveryReport;
pub use registry::Registry;
pub use shared::SharedPool;
pub use snapshot::{ChannelSnapshot, QueueSnapshot, RegistrySnapshot, SharedPoolSnapshot};
