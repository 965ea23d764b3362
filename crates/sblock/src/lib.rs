//! Zero-copy block transport between two processor domains sharing memory.
//!
//! # Crate Structure
//!
//! - [`shmem`]: shared regions and the physical allocator/mapper
//! - [`signal`]: control messages and the signalling link
//! - the crate root: channels, shared pools, recovery and the registry
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use sblock::shmem::PhysicalMemory;
//! use sblock::signal::SignalPort;
//! use sblock::{ChannelConfig, Registry, Wait};
//!
//! let (host_link, companion_link) = SignalPort::pair()?;
//! let memory = Arc::new(PhysicalMemory::new());
//!
//! let host = Registry::new();
//! host.attach_peer(1, Arc::new(host_link), memory.clone())?;
//! let companion = Registry::new();
//! companion.attach_peer(1, Arc::new(companion_link), memory)?;
//!
//! let config = ChannelConfig::new(1, 1).with_tx(256, 8).with_rx(256, 8);
//! let tx = host.create(config.clone())?;
//! let rx = companion.create(config.mirrored())?;
//! tx.wait_ready(Wait::Timeout(Duration::from_secs(5)))?;
//! rx.wait_ready(Wait::Timeout(Duration::from_secs(5)))?;
//!
//! let mut block = tx.get(Wait::Forever)?;
//! block.write(b"hello")?;
//! tx.send(block)?;
//! let block = rx.receive(Wait::Forever)?;
//! rx.release(block)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Re-export shared-memory types.
pub mod shmem {
    pub use sblock_shmem::*;
}

/// Re-export signalling types.
pub mod signal {
    pub use sblock_signal::*;
}

pub use sblock_core::*;
