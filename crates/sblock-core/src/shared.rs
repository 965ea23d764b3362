//! Domain-wide shared pool.
//!
//! A shared pool is a region holding one transmit and one receive pool that
//! any number of member channels of the same peer borrow from. Members keep
//! their private pools and consult them first; shared blocks travel over the
//! member's own rings and always come back to the shared pool.
//!
//! The pool has its own signalling channel and event thread. Its init
//! exchange announces the region base, and a peer reset seen there triggers
//! recovery of the whole domain.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use sblock_shmem::{PhysAddr, SharedRegion, ShmemProvider};
use sblock_signal::{SignalLink, SignalMessage, EVENT_BLOCK_RELEASE};
use tracing::{debug, info, warn};

use crate::arena::{Lane, Storage};
use crate::block::{Block, Direction, Home};
use crate::channel::{ChannelEvent, ChannelInner, ChannelState, StateCell};
use crate::config::{ChannelConfig, Role, SharedPoolConfig, Wait};
use crate::error::{BlockError, Rejected, Result};
use crate::layout::{Descriptor, LocalView, RegionLayout};
use crate::pool::Pool;
use crate::queue::Queue;
use crate::recovery::{self, RecoveryReport};
use crate::snapshot::{QueueSnapshot, SharedPoolSnapshot};
use crate::wait::{WaitOutcome, WaitQueue};
use crate::worker::{self, ControlTarget};

/// Local view of a mapped shared-pool region.
pub(crate) struct PoolEndpoint {
    region: SharedRegion,
    pool_tx: Pool,
    pool_rx: Pool,
}

impl PoolEndpoint {
    fn attach(region: SharedRegion, config: &SharedPoolConfig) -> Result<Self> {
        let view = LocalView::for_role(config.role);
        let pool_tx = Descriptor::new(&region, view.pool_tx);
        let pool_rx = Descriptor::new(&region, view.pool_rx);
        pool_tx.check_pool(config.tx())?;
        pool_rx.check_pool(config.rx())?;

        let tx_lane = Arc::new(Lane::new(
            Storage::from_descriptor(&pool_tx)?,
            Home::Shared,
            Direction::Tx,
        ));
        let rx_lane = Arc::new(Lane::new(
            Storage::from_descriptor(&pool_rx)?,
            Home::Shared,
            Direction::Rx,
        ));
        Ok(Self {
            pool_tx: Pool::new(Queue::attach(pool_tx)?, tx_lane),
            pool_rx: Pool::new(Queue::attach(pool_rx)?, rx_lane),
            region,
        })
    }

    pub(crate) fn pool_tx(&self) -> &Pool {
        &self.pool_tx
    }

    pub(crate) fn pool_rx(&self) -> &Pool {
        &self.pool_rx
    }

    pub(crate) fn tx_lane(&self) -> &Arc<Lane> {
        self.pool_tx.lane()
    }

    pub(crate) fn rx_lane(&self) -> &Arc<Lane> {
        self.pool_rx.lane()
    }
}

pub(crate) struct SharedPoolInner {
    config: SharedPoolConfig,
    state: StateCell,
    initialized: AtomicBool,
    /// Domain recovery already ran since the pool last left Ready.
    recovered: AtomicBool,
    link: Arc<dyn SignalLink>,
    provider: Arc<dyn ShmemProvider>,
    endpoint: OnceLock<PoolEndpoint>,
    members: Mutex<Vec<Weak<ChannelInner>>>,
    state_waiters: WaitQueue,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_recovery: Mutex<Option<RecoveryReport>>,
}

impl SharedPoolInner {
    pub(crate) fn create(
        config: SharedPoolConfig,
        link: Arc<dyn SignalLink>,
        provider: Arc<dyn ShmemProvider>,
    ) -> Result<Arc<Self>> {
        let inner = Self {
            config,
            state: StateCell::new(),
            initialized: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            link,
            provider,
            endpoint: OnceLock::new(),
            members: Mutex::new(Vec::new()),
            state_waiters: WaitQueue::default(),
            worker: Mutex::new(None),
            last_recovery: Mutex::new(None),
        };

        if inner.config.role == Role::Host {
            let layout = inner.header_layout()?;
            let region = inner.provider.alloc(layout.size)?;
            let endpoint = layout
                .format(&region)
                .and_then(|()| PoolEndpoint::attach(region.clone(), &inner.config));
            match endpoint {
                Ok(endpoint) => inner.store_endpoint(endpoint),
                Err(err) => {
                    inner.provider.free(&region);
                    return Err(err);
                }
            }
        }

        Ok(Arc::new(inner))
    }

    fn store_endpoint(&self, endpoint: PoolEndpoint) {
        if self.endpoint.set(endpoint).is_err() {
            warn!(
                peer = self.config.peer_id,
                channel = self.config.channel_id,
                "shared pool endpoint already bound, keeping the first"
            );
        }
    }

    fn header_layout(&self) -> Result<RegionLayout> {
        let (tx, rx) = match self.config.role {
            Role::Host => (self.config.tx(), self.config.rx()),
            Role::Companion => (self.config.rx(), self.config.tx()),
        };
        RegionLayout::pool(tx, rx)
            .ok_or_else(|| BlockError::InvalidConfig("shared pool region too large".into()))
    }

    pub(crate) fn config(&self) -> &SharedPoolConfig {
        &self.config
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state.get() == ChannelState::Ready
    }

    pub(crate) fn endpoint(&self) -> Option<&PoolEndpoint> {
        self.endpoint.get()
    }

    /// Check that `config` can join this domain.
    pub(crate) fn check_member(&self, config: &ChannelConfig) -> Result<()> {
        if self.state.get() == ChannelState::Destroyed {
            return Err(BlockError::NotFound {
                peer: self.config.peer_id,
                channel: self.config.channel_id,
            });
        }
        if self.endpoint.get().is_none() {
            return Err(BlockError::NotReady);
        }
        if config.channel_id == self.config.channel_id {
            return Err(BlockError::AlreadyExists(format!(
                "channel {} is the shared pool's signalling channel",
                config.channel_id
            )));
        }
        if config.role != self.config.role {
            return Err(BlockError::InvalidConfig(format!(
                "member role {} differs from shared pool role {}",
                config.role, self.config.role
            )));
        }
        if config.tx_block_size != self.config.tx_block_size
            || config.rx_block_size != self.config.rx_block_size
        {
            return Err(BlockError::LayoutMismatch(format!(
                "member block sizes {}/{} differ from shared pool {}/{}",
                config.tx_block_size,
                config.rx_block_size,
                self.config.tx_block_size,
                self.config.rx_block_size
            )));
        }
        Ok(())
    }

    fn members(&self) -> MutexGuard<'_, Vec<Weak<ChannelInner>>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_member(&self, member: &Arc<ChannelInner>) {
        let mut members = self.members();
        members.retain(|weak| {
            weak.upgrade()
                .is_some_and(|member| member.state() != ChannelState::Destroyed)
        });
        members.push(Arc::downgrade(member));
    }

    /// Members that have not been destroyed.
    pub(crate) fn live_members(&self) -> Vec<Arc<ChannelInner>> {
        self.members()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|member| member.state() != ChannelState::Destroyed)
            .collect()
    }

    fn wake_member_getters(&self) {
        for member in self.live_members() {
            member.wake_getters();
        }
    }

    /// LIFO give-back of an unsent shared block.
    pub(crate) fn give_back(&self, block: Block) -> std::result::Result<(), Rejected> {
        let Some(endpoint) = self.endpoint.get() else {
            return Err(Rejected::new(BlockError::NotReady, block));
        };
        endpoint.pool_tx.give_back(block)?;
        self.wake_member_getters();
        Ok(())
    }

    /// Return a received shared block to the peer, notifying it on the pool
    /// channel when its free list was empty.
    pub(crate) fn release(&self, block: Block) -> std::result::Result<(), Rejected> {
        let Some(endpoint) = self.endpoint.get() else {
            return Err(Rejected::new(BlockError::NotReady, block));
        };
        let refilled = endpoint.pool_rx.release(block)?;
        if refilled && self.is_ready() {
            let msg = SignalMessage::event(self.config.channel_id, EVENT_BLOCK_RELEASE, 0);
            if let Err(err) = self.link.send(msg) {
                warn!(
                    peer = self.config.peer_id,
                    channel = self.config.channel_id,
                    error = %err,
                    "peer notification failed"
                );
            }
        }
        Ok(())
    }

    fn set_idle(&self) -> bool {
        let was_ready = self.state.make_idle();
        if was_ready {
            self.state_waiters.wake_all();
            self.wake_member_getters();
        }
        was_ready
    }

    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        let handle = worker::spawn(Arc::clone(self))?;
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    pub(crate) fn teardown(&self) {
        let peer = self.config.peer_id;
        let channel = self.config.channel_id;
        self.state.destroy();
        self.state_waiters.wake_all();
        self.wake_member_getters();

        if let Err(err) = self.link.close(channel) {
            debug!(peer, channel, error = %err, "close not delivered");
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!(peer, channel, "event thread panicked");
            }
        }
        if self.config.role == Role::Host {
            if let Some(endpoint) = self.endpoint.get() {
                self.provider.free(&endpoint.region);
            }
        }
        info!(peer, channel, "shared pool destroyed");
    }

    pub(crate) fn snapshot(&self) -> SharedPoolSnapshot {
        let endpoint = self.endpoint.get();
        let queues = endpoint
            .map(|endpoint| {
                vec![
                    QueueSnapshot::capture("pool-tx", &endpoint.pool_tx.lock()),
                    QueueSnapshot::capture("pool-rx", &endpoint.pool_rx.lock()),
                ]
            })
            .unwrap_or_default();
        let mut members: Vec<u8> = self
            .live_members()
            .iter()
            .map(|member| member.config().channel_id)
            .collect();
        members.sort_unstable();
        SharedPoolSnapshot {
            peer_id: self.config.peer_id,
            channel_id: self.config.channel_id,
            role: self.config.role,
            state: self.state.get(),
            region_base: endpoint.map(|endpoint| endpoint.region.phys_base().get()),
            region_size: endpoint.map(|endpoint| endpoint.region.len()),
            queues,
            pending_tx: endpoint.map_or(0, |endpoint| endpoint.tx_lane().ledger().pending_count()),
            pending_rx: endpoint.map_or(0, |endpoint| endpoint.rx_lane().ledger().pending_count()),
            members,
            last_recovery: *self
                .last_recovery
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl ControlTarget for SharedPoolInner {
    fn label(&self) -> &'static str {
        "shared-pool"
    }

    fn peer_id(&self) -> u8 {
        self.config.peer_id
    }

    fn channel_id(&self) -> u8 {
        self.config.channel_id
    }

    fn role(&self) -> Role {
        self.config.role
    }

    fn realtime_priority(&self) -> Option<i32> {
        self.config.realtime_priority
    }

    fn link(&self) -> &dyn SignalLink {
        self.link.as_ref()
    }

    fn is_ready(&self) -> bool {
        SharedPoolInner::is_ready(self)
    }

    fn first_init(&self) -> bool {
        !self.initialized.swap(true, Ordering::AcqRel)
    }

    /// Domain-wide recovery: every member first, then the shared pools.
    /// Runs at most once per departure from Ready.
    fn recover(&self) {
        if self.recovered.swap(true, Ordering::AcqRel) {
            debug!(
                peer = self.config.peer_id,
                channel = self.config.channel_id,
                "shared pool already recovered since last ready"
            );
            return;
        }
        self.set_idle();
        let members = self.live_members();
        for member in &members {
            member.recover_now();
        }
        let Some(endpoint) = self.endpoint.get() else {
            self.recovered.store(false, Ordering::Release);
            return;
        };
        let report = recovery::recover_shared(endpoint);
        info!(
            peer = self.config.peer_id,
            channel = self.config.channel_id,
            members = members.len(),
            pool_tx = report.pool_tx,
            pool_rx = report.pool_rx,
            on_loan_tx = report.on_loan_tx,
            on_loan_rx = report.on_loan_rx,
            "shared pool recovered"
        );
        *self
            .last_recovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report);
    }

    fn go_idle(&self) {
        if self.set_idle() {
            info!(
                peer = self.config.peer_id,
                channel = self.config.channel_id,
                "shared pool idle"
            );
        }
    }

    fn mark_ready(&self) -> bool {
        if self.endpoint.get().is_none() {
            return false;
        }
        self.recovered.store(false, Ordering::Release);
        if !self.state.make_ready() {
            return false;
        }
        self.state_waiters.wake_all();
        true
    }

    fn announce_open(&self) {
        self.wake_member_getters();
    }

    fn region_base(&self) -> Option<PhysAddr> {
        self.endpoint.get().map(|endpoint| endpoint.region.phys_base())
    }

    fn attach(&self, base: PhysAddr) -> Result<()> {
        if let Some(endpoint) = self.endpoint.get() {
            if endpoint.region.phys_base() == base {
                return Ok(());
            }
            return Err(BlockError::LayoutMismatch(format!(
                "peer announced {base}, shared pool is bound to {}",
                endpoint.region.phys_base()
            )));
        }
        let layout = self.header_layout()?;
        let region = self.provider.map(base, layout.size)?;
        let endpoint = PoolEndpoint::attach(region, &self.config)?;
        self.store_endpoint(endpoint);
        debug!(
            peer = self.config.peer_id,
            channel = self.config.channel_id,
            base = %base,
            "attached to peer shared pool"
        );
        Ok(())
    }

    fn on_send_event(&self) {
        debug!(
            peer = self.config.peer_id,
            channel = self.config.channel_id,
            "send event on shared pool channel ignored"
        );
    }

    fn on_release_event(&self) {
        for member in self.live_members() {
            member.wake_getters();
            if member.state() == ChannelState::Ready {
                member.fire(ChannelEvent::Get);
            }
        }
    }
}

/// Handle to a peer's shared pool.
#[derive(Clone)]
pub struct SharedPool {
    pub(crate) inner: Arc<SharedPoolInner>,
}

impl SharedPool {
    pub(crate) fn new(inner: Arc<SharedPoolInner>) -> Self {
        Self { inner }
    }

    pub fn peer_id(&self) -> u8 {
        self.inner.config.peer_id
    }

    /// Signalling channel used by the pool itself.
    pub fn channel_id(&self) -> u8 {
        self.inner.config.channel_id
    }

    pub fn config(&self) -> &SharedPoolConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Shared transmit blocks available to members.
    pub fn free_count(&self) -> u32 {
        self.inner
            .endpoint
            .get()
            .map_or(0, |endpoint| endpoint.pool_tx.occupancy())
    }

    /// Shared receive blocks available to the peer.
    pub fn peer_free_count(&self) -> u32 {
        self.inner
            .endpoint
            .get()
            .map_or(0, |endpoint| endpoint.pool_rx.occupancy())
    }

    /// Channel ids of the members that are still alive.
    pub fn member_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self
            .inner
            .live_members()
            .iter()
            .map(|member| member.config().channel_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Wait for the pool's init exchange to complete.
    pub fn wait_ready(&self, wait: Wait) -> Result<()> {
        let inner = &*self.inner;
        let outcome = inner
            .state_waiters
            .wait_while(wait, || inner.state.get() == ChannelState::Idle);
        match inner.state.get() {
            ChannelState::Ready => Ok(()),
            ChannelState::Destroyed => Err(BlockError::NotFound {
                peer: inner.config.peer_id,
                channel: inner.config.channel_id,
            }),
            ChannelState::Idle => match (outcome, wait) {
                (WaitOutcome::TimedOut, Wait::Timeout(timeout)) => {
                    Err(BlockError::DeadlineExceeded(timeout))
                }
                _ => Err(BlockError::NotReady),
            },
        }
    }

    pub fn snapshot(&self) -> SharedPoolSnapshot {
        self.inner.snapshot()
    }
}

impl fmt::Debug for SharedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPool")
            .field("peer_id", &self.peer_id())
            .field("channel_id", &self.channel_id())
            .field("role", &self.inner.config.role)
            .field("state", &self.state())
            .finish()
    }
}
