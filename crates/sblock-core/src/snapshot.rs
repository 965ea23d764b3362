//! Read-only diagnostics of live channels and shared pools.

use std::fmt;

use serde::Serialize;

use crate::channel::ChannelState;
use crate::config::Role;
use crate::queue::Queue;
use crate::recovery::RecoveryReport;

/// One descriptor as it currently reads in shared memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Local name (`ring-tx`, `pool-rx`, ...).
    pub name: &'static str,
    /// Header slot the descriptor lives in.
    pub descriptor: &'static str,
    pub base: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub rdptr: u32,
    pub wrptr: u32,
    pub occupancy: u32,
}

impl QueueSnapshot {
    pub(crate) fn capture(name: &'static str, queue: &Queue) -> Self {
        let desc = queue.descriptor();
        Self {
            name,
            descriptor: queue.id().name(),
            base: desc.base().get(),
            block_size: desc.block_size(),
            block_count: desc.block_count(),
            rdptr: desc.rdptr(),
            wrptr: desc.wrptr(),
            occupancy: queue.occupancy(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub peer_id: u8,
    pub channel_id: u8,
    pub role: Role,
    pub state: ChannelState,
    pub shared_pool: bool,
    pub region_base: Option<u32>,
    pub region_size: Option<usize>,
    pub queues: Vec<QueueSnapshot>,
    /// Private transmit blocks held by local callers.
    pub pending_tx: u32,
    /// Private receive blocks held by local callers.
    pub pending_rx: u32,
    pub notifier: bool,
    pub last_recovery: Option<RecoveryReport>,
}

impl ChannelSnapshot {
    pub fn queue(&self, name: &str) -> Option<&QueueSnapshot> {
        self.queues.iter().find(|queue| queue.name == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SharedPoolSnapshot {
    pub peer_id: u8,
    pub channel_id: u8,
    pub role: Role,
    pub state: ChannelState,
    pub region_base: Option<u32>,
    pub region_size: Option<usize>,
    pub queues: Vec<QueueSnapshot>,
    pub pending_tx: u32,
    pub pending_rx: u32,
    pub members: Vec<u8>,
    pub last_recovery: Option<RecoveryReport>,
}

/// Everything a [`Registry`](crate::Registry) currently holds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    pub channels: Vec<ChannelSnapshot>,
    pub shared_pools: Vec<SharedPoolSnapshot>,
}

fn write_region(f: &mut fmt::Formatter<'_>, base: Option<u32>, size: Option<usize>) -> fmt::Result {
    match (base, size) {
        (Some(base), Some(size)) => write!(f, "region {base:#010x} +{size:#x}"),
        _ => f.write_str("region unmapped"),
    }
}

fn write_queues(f: &mut fmt::Formatter<'_>, queues: &[QueueSnapshot]) -> fmt::Result {
    for queue in queues {
        writeln!(
            f,
            "    {:<8} [{:<7}] base {:#010x} size {:>5} count {:>5} rd {:>10} wr {:>10} occ {}",
            queue.name,
            queue.descriptor,
            queue.base,
            queue.block_size,
            queue.block_count,
            queue.rdptr,
            queue.wrptr,
            queue.occupancy
        )?;
    }
    Ok(())
}

impl fmt::Display for RegistrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.channels.is_empty() && self.shared_pools.is_empty() {
            return writeln!(f, "no channels");
        }
        for pool in &self.shared_pools {
            write!(
                f,
                "shared pool peer {} channel {} ({}, {}) ",
                pool.peer_id, pool.channel_id, pool.role, pool.state
            )?;
            write_region(f, pool.region_base, pool.region_size)?;
            writeln!(
                f,
                " pending tx {} rx {} members {:?}",
                pool.pending_tx, pool.pending_rx, pool.members
            )?;
            write_queues(f, &pool.queues)?;
        }
        for channel in &self.channels {
            write!(
                f,
                "channel peer {} channel {} ({}, {}{}) ",
                channel.peer_id,
                channel.channel_id,
                channel.role,
                channel.state,
                if channel.shared_pool { ", shared" } else { "" }
            )?;
            write_region(f, channel.region_base, channel.region_size)?;
            writeln!(
                f,
                " pending tx {} rx {}",
                channel.pending_tx, channel.pending_rx
            )?;
            write_queues(f, &channel.queues)?;
        }
        Ok(())
    }
}
