//! Process-wide table of channels and shared pools.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sblock_shmem::ShmemProvider;
use sblock_signal::SignalLink;
use tracing::{debug, info};

use crate::channel::{ChannelHandle, ChannelInner, ChannelState};
use crate::config::{ChannelConfig, SharedPoolConfig};
use crate::error::{BlockError, Result};
use crate::shared::{SharedPool, SharedPoolInner};
use crate::snapshot::RegistrySnapshot;

struct PeerEntry {
    link: Arc<dyn SignalLink>,
    provider: Arc<dyn ShmemProvider>,
    channels: BTreeMap<u8, ChannelHandle>,
    shared: Option<SharedPool>,
}

impl PeerEntry {
    fn channel_taken(&self, channel_id: u8) -> bool {
        self.channels.contains_key(&channel_id)
            || self
                .shared
                .as_ref()
                .is_some_and(|pool| pool.channel_id() == channel_id)
    }
}

/// Owns every channel and shared pool created through it.
///
/// Peers are attached first, each with the signalling link and the memory
/// provider used to reach it. Dropping the registry destroys everything it
/// still holds.
#[derive(Default)]
pub struct Registry {
    peers: Mutex<BTreeMap<u8, PeerEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> MutexGuard<'_, BTreeMap<u8, PeerEntry>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `peer_id` reachable through `link` and `provider`.
    pub fn attach_peer(
        &self,
        peer_id: u8,
        link: Arc<dyn SignalLink>,
        provider: Arc<dyn ShmemProvider>,
    ) -> Result<()> {
        let mut peers = self.peers();
        if peers.contains_key(&peer_id) {
            return Err(BlockError::AlreadyExists(format!("peer {peer_id}")));
        }
        peers.insert(
            peer_id,
            PeerEntry {
                link,
                provider,
                channels: BTreeMap::new(),
                shared: None,
            },
        );
        debug!(peer = peer_id, "peer attached");
        Ok(())
    }

    /// Forget a peer that has no channels or shared pool left.
    pub fn detach_peer(&self, peer_id: u8) -> Result<()> {
        let mut peers = self.peers();
        let entry = peers.get(&peer_id).ok_or(BlockError::NotFound {
            peer: peer_id,
            channel: 0,
        })?;
        if !entry.channels.is_empty() || entry.shared.is_some() {
            return Err(BlockError::InUse(format!("peer {peer_id} still has channels")));
        }
        peers.remove(&peer_id);
        debug!(peer = peer_id, "peer detached");
        Ok(())
    }

    /// Create a channel and start its event thread.
    ///
    /// The channel starts Idle and becomes Ready once the peer completes the
    /// open handshake and init exchange; see [`ChannelHandle::wait_ready`].
    pub fn create(&self, config: ChannelConfig) -> Result<ChannelHandle> {
        config.validate()?;
        let peer = config.peer_id;
        let channel = config.channel_id;

        let mut peers = self.peers();
        let entry = peers
            .get_mut(&peer)
            .ok_or(BlockError::NotFound { peer, channel })?;
        if entry.channel_taken(channel) {
            return Err(BlockError::AlreadyExists(format!(
                "peer {peer} channel {channel}"
            )));
        }

        let shared = if config.shared_pool {
            let pool = entry.shared.as_ref().ok_or_else(|| {
                BlockError::InvalidConfig(format!("peer {peer} has no shared pool"))
            })?;
            pool.inner.check_member(&config)?;
            Some(Arc::clone(&pool.inner))
        } else {
            None
        };

        let inner = ChannelInner::create(
            config,
            Arc::clone(&entry.link),
            Arc::clone(&entry.provider),
            shared.clone(),
        )?;
        if let Some(pool) = &shared {
            pool.add_member(&inner);
        }
        if let Err(err) = inner.start() {
            inner.teardown();
            return Err(err);
        }

        let handle = ChannelHandle::new(inner);
        entry.channels.insert(channel, handle.clone());
        info!(
            peer,
            channel,
            role = %handle.config().role,
            shared = handle.config().shared_pool,
            "channel created"
        );
        Ok(handle)
    }

    pub fn lookup(&self, peer_id: u8, channel_id: u8) -> Result<ChannelHandle> {
        self.peers()
            .get(&peer_id)
            .and_then(|entry| entry.channels.get(&channel_id))
            .cloned()
            .ok_or(BlockError::NotFound {
                peer: peer_id,
                channel: channel_id,
            })
    }

    /// All live channels, ordered by peer then channel id.
    pub fn channels(&self) -> Vec<ChannelHandle> {
        self.peers()
            .values()
            .flat_map(|entry| entry.channels.values().cloned())
            .collect()
    }

    /// Destroy a channel: close its signalling channel, stop its thread,
    /// fail blocked callers and release the region.
    ///
    /// Blocks still held by callers stay valid memory but every operation
    /// on them is rejected afterwards.
    pub fn destroy(&self, handle: &ChannelHandle) -> Result<()> {
        let peer = handle.peer_id();
        let channel = handle.channel_id();
        let removed = {
            let mut peers = self.peers();
            let entry = peers
                .get_mut(&peer)
                .ok_or(BlockError::NotFound { peer, channel })?;
            match entry.channels.get(&channel) {
                Some(existing) if Arc::ptr_eq(&existing.inner, &handle.inner) => {
                    entry.channels.remove(&channel)
                }
                _ => None,
            }
        };
        let removed = removed.ok_or(BlockError::NotFound { peer, channel })?;
        removed.inner.teardown();
        Ok(())
    }

    /// Create the peer's shared pool. Members opt in with
    /// [`ChannelConfig::with_shared_pool`].
    pub fn create_shared_pool(&self, config: SharedPoolConfig) -> Result<SharedPool> {
        config.validate()?;
        let peer = config.peer_id;
        let channel = config.channel_id;

        let mut peers = self.peers();
        let entry = peers
            .get_mut(&peer)
            .ok_or(BlockError::NotFound { peer, channel })?;
        if entry.shared.is_some() {
            return Err(BlockError::AlreadyExists(format!(
                "peer {peer} shared pool"
            )));
        }
        if entry.channel_taken(channel) {
            return Err(BlockError::AlreadyExists(format!(
                "peer {peer} channel {channel}"
            )));
        }

        let inner = SharedPoolInner::create(
            config,
            Arc::clone(&entry.link),
            Arc::clone(&entry.provider),
        )?;
        if let Err(err) = inner.start() {
            inner.teardown();
            return Err(err);
        }
        let pool = SharedPool::new(inner);
        entry.shared = Some(pool.clone());
        info!(peer, channel, role = %pool.config().role, "shared pool created");
        Ok(pool)
    }

    pub fn shared_pool(&self, peer_id: u8) -> Option<SharedPool> {
        self.peers()
            .get(&peer_id)
            .and_then(|entry| entry.shared.clone())
    }

    /// Destroy a shared pool. Fails with [`BlockError::InUse`] while any
    /// member channel is alive.
    pub fn destroy_shared_pool(&self, pool: &SharedPool) -> Result<()> {
        let peer = pool.peer_id();
        let channel = pool.channel_id();
        let removed = {
            let mut peers = self.peers();
            let entry = peers
                .get_mut(&peer)
                .ok_or(BlockError::NotFound { peer, channel })?;
            match &entry.shared {
                Some(existing) if Arc::ptr_eq(&existing.inner, &pool.inner) => {
                    let members = pool.member_ids();
                    if !members.is_empty() {
                        return Err(BlockError::InUse(format!(
                            "shared pool still has members {members:?}"
                        )));
                    }
                    entry.shared.take()
                }
                _ => None,
            }
        };
        let removed = removed.ok_or(BlockError::NotFound { peer, channel })?;
        removed.inner.teardown();
        Ok(())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let (channels, pools) = {
            let peers = self.peers();
            let channels: Vec<ChannelHandle> = peers
                .values()
                .flat_map(|entry| entry.channels.values().cloned())
                .collect();
            let pools: Vec<SharedPool> = peers
                .values()
                .filter_map(|entry| entry.shared.clone())
                .collect();
            (channels, pools)
        };
        RegistrySnapshot {
            channels: channels.iter().map(ChannelHandle::snapshot).collect(),
            shared_pools: pools.iter().map(SharedPool::snapshot).collect(),
        }
    }

    /// Text dump of every live channel's descriptors and pointers.
    pub fn dump(&self) -> String {
        self.snapshot().to_string()
    }

    fn destroy_all(&self) {
        let peers = std::mem::take(&mut *self.peers());
        for entry in peers.into_values() {
            for handle in entry.channels.into_values() {
                handle.inner.teardown();
            }
            if let Some(pool) = entry.shared {
                pool.inner.teardown();
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peers = self.peers();
        let mut list = f.debug_list();
        for (peer, entry) in peers.iter() {
            list.entry(&(
                peer,
                entry.channels.keys().collect::<Vec<_>>(),
                entry.shared.as_ref().map(SharedPool::channel_id),
            ));
        }
        list.finish()
    }
}
