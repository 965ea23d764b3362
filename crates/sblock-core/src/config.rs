use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::{BlockError, Result};
use crate::layout::{Geometry, RegionLayout};

/// Upper bound on blocks per pool.
pub const MAX_BLOCK_COUNT: u32 = 1 << 16;

/// Which side of the shared region this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Allocates and formats the region, answers the init command.
    Host,
    /// Requests init and attaches to the host's region.
    Companion,
}

impl Role {
    /// The role of the other domain.
    pub fn opposite(self) -> Role {
        match self {
            Role::Host => Role::Companion,
            Role::Companion => Role::Host,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Host => "host",
            Role::Companion => "companion",
        })
    }
}

/// Behaviour when a second notifier is registered on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierPolicy {
    /// Reject with [`BlockError::NotifierRegistered`].
    #[default]
    Strict,
    /// Replace the previous notifier (driver reload).
    Replace,
}

/// How long `get`/`receive` may block on an empty structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Poll once.
    NoWait,
    /// Block until a block arrives or the channel is torn down.
    Forever,
    /// Block for at most this long.
    Timeout(Duration),
}

impl Wait {
    /// Integer convention: `0` polls, negative waits forever, positive is a
    /// bound in milliseconds.
    pub fn from_millis(ms: i64) -> Wait {
        match ms {
            0 => Wait::NoWait,
            ms if ms < 0 => Wait::Forever,
            ms => Wait::Timeout(Duration::from_millis(ms.unsigned_abs())),
        }
    }
}

/// Static configuration of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelConfig {
    pub peer_id: u8,
    pub channel_id: u8,
    pub tx_block_size: u32,
    pub tx_block_count: u32,
    pub rx_block_size: u32,
    pub rx_block_count: u32,
    pub role: Role,
    pub notifier_policy: NotifierPolicy,
    /// Real-time priority hint for the event thread.
    pub realtime_priority: Option<i32>,
    /// Borrow from the peer's shared pool when the private pool runs dry.
    pub shared_pool: bool,
}

impl ChannelConfig {
    pub fn new(peer_id: u8, channel_id: u8) -> Self {
        Self {
            peer_id,
            channel_id,
            tx_block_size: 1024,
            tx_block_count: 16,
            rx_block_size: 1024,
            rx_block_count: 16,
            role: Role::Host,
            notifier_policy: NotifierPolicy::Strict,
            realtime_priority: None,
            shared_pool: false,
        }
    }

    pub fn with_tx(mut self, block_size: u32, block_count: u32) -> Self {
        self.tx_block_size = block_size;
        self.tx_block_count = block_count;
        self
    }

    pub fn with_rx(mut self, block_size: u32, block_count: u32) -> Self {
        self.rx_block_size = block_size;
        self.rx_block_count = block_count;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_notifier_policy(mut self, policy: NotifierPolicy) -> Self {
        self.notifier_policy = policy;
        self
    }

    pub fn with_realtime_priority(mut self, priority: i32) -> Self {
        self.realtime_priority = Some(priority);
        self
    }

    pub fn with_shared_pool(mut self, enabled: bool) -> Self {
        self.shared_pool = enabled;
        self
    }

    /// The configuration the other domain must use for the same channel.
    pub fn mirrored(&self) -> Self {
        Self {
            tx_block_size: self.rx_block_size,
            tx_block_count: self.rx_block_count,
            rx_block_size: self.tx_block_size,
            rx_block_count: self.tx_block_count,
            role: self.role.opposite(),
            ..self.clone()
        }
    }

    pub(crate) fn tx(&self) -> Geometry {
        Geometry::new(self.tx_block_size, self.tx_block_count)
    }

    pub(crate) fn rx(&self) -> Geometry {
        Geometry::new(self.rx_block_size, self.rx_block_count)
    }

    /// Check sizes and counts, and that the region fits the 32-bit
    /// physical address space.
    ///
    /// Channels that borrow from a shared pool may declare an empty private
    /// pool.
    pub fn validate(&self) -> Result<()> {
        let min_count = if self.shared_pool { 0 } else { 1 };
        check_geometry("tx", self.tx(), min_count)?;
        check_geometry("rx", self.rx(), min_count)?;
        RegionLayout::channel(
            self.tx(),
            self.rx(),
            self.tx_block_count,
            self.rx_block_count,
        )
        .ok_or_else(|| BlockError::InvalidConfig("region exceeds 32-bit address space".into()))?;
        Ok(())
    }
}

/// Configuration of the shared pool one peer's channels can borrow from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedPoolConfig {
    pub peer_id: u8,
    /// Signalling channel reserved for the pool's own control traffic.
    pub channel_id: u8,
    pub tx_block_size: u32,
    pub tx_block_count: u32,
    pub rx_block_size: u32,
    pub rx_block_count: u32,
    pub role: Role,
    pub realtime_priority: Option<i32>,
}

impl SharedPoolConfig {
    pub fn new(peer_id: u8, channel_id: u8) -> Self {
        Self {
            peer_id,
            channel_id,
            tx_block_size: 1024,
            tx_block_count: 64,
            rx_block_size: 1024,
            rx_block_count: 64,
            role: Role::Host,
            realtime_priority: None,
        }
    }

    pub fn with_tx(mut self, block_size: u32, block_count: u32) -> Self {
        self.tx_block_size = block_size;
        self.tx_block_count = block_count;
        self
    }

    pub fn with_rx(mut self, block_size: u32, block_count: u32) -> Self {
        self.rx_block_size = block_size;
        self.rx_block_count = block_count;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_realtime_priority(mut self, priority: i32) -> Self {
        self.realtime_priority = Some(priority);
        self
    }

    /// The configuration the other domain must use for the same pool.
    pub fn mirrored(&self) -> Self {
        Self {
            tx_block_size: self.rx_block_size,
            tx_block_count: self.rx_block_count,
            rx_block_size: self.tx_block_size,
            rx_block_count: self.tx_block_count,
            role: self.role.opposite(),
            ..self.clone()
        }
    }

    pub(crate) fn tx(&self) -> Geometry {
        Geometry::new(self.tx_block_size, self.tx_block_count)
    }

    pub(crate) fn rx(&self) -> Geometry {
        Geometry::new(self.rx_block_size, self.rx_block_count)
    }

    pub fn validate(&self) -> Result<()> {
        check_geometry("shared tx", self.tx(), 1)?;
        check_geometry("shared rx", self.rx(), 1)?;
        RegionLayout::pool(self.tx(), self.rx()).ok_or_else(|| {
            BlockError::InvalidConfig("shared region exceeds 32-bit address space".into())
        })?;
        Ok(())
    }
}

fn check_geometry(label: &str, geometry: Geometry, min_count: u32) -> Result<()> {
    if geometry.block_size == 0 || geometry.block_size % 4 != 0 {
        return Err(BlockError::InvalidConfig(format!(
            "{label} block size {} must be a non-zero multiple of 4",
            geometry.block_size
        )));
    }
    if geometry.block_count < min_count || geometry.block_count > MAX_BLOCK_COUNT {
        return Err(BlockError::InvalidConfig(format!(
            "{label} block count {} outside {min_count}..={MAX_BLOCK_COUNT}",
            geometry.block_count
        )));
    }
    Ok(())
}
