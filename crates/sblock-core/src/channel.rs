use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use sblock_shmem::{PhysAddr, SharedRegion, ShmemProvider};
use sblock_signal::{SignalLink, SignalMessage, EVENT_BLOCK_RELEASE, EVENT_BLOCK_SEND};
use tracing::{debug, info, warn};

use crate::arena::{Lane, Lanes, Storage};
use crate::block::{Block, Direction, Home};
use crate::config::{ChannelConfig, NotifierPolicy, Role, Wait};
use crate::error::{BlockError, Rejected, Result};
use crate::layout::{Descriptor, LocalView, RegionLayout};
use crate::pool::Pool;
use crate::queue::Queue;
use crate::recovery::{self, RecoveryReport};
use crate::ring::Ring;
use crate::shared::{PoolEndpoint, SharedPoolInner};
use crate::snapshot::{ChannelSnapshot, QueueSnapshot};
use crate::wait::{WaitOutcome, WaitQueue};
use crate::worker::{self, ControlTarget};

const STATE_IDLE: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_DESTROYED: u8 = 2;

/// Lifecycle state of a channel or shared pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Idle,
    Ready,
    Destroyed,
}

impl ChannelState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_READY => ChannelState::Ready,
            STATE_DESTROYED => ChannelState::Destroyed,
            _ => ChannelState::Idle,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelState::Idle => "idle",
            ChannelState::Ready => "ready",
            ChannelState::Destroyed => "destroyed",
        })
    }
}

/// Atomic lifecycle cell shared by channels and shared pools.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(STATE_IDLE))
    }

    pub(crate) fn get(&self) -> ChannelState {
        ChannelState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Idle -> Ready.
    pub(crate) fn make_ready(&self) -> bool {
        self.0
            .compare_exchange(STATE_IDLE, STATE_READY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Ready -> Idle. Returns whether the state was Ready.
    pub(crate) fn make_idle(&self) -> bool {
        self.0
            .compare_exchange(STATE_READY, STATE_IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Any -> Destroyed. Returns whether the state was Ready.
    pub(crate) fn destroy(&self) -> bool {
        self.0.swap(STATE_DESTROYED, Ordering::AcqRel) == STATE_READY
    }
}

/// Events reported to a channel's notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelEvent {
    /// The channel became Ready.
    Open,
    /// The channel left Ready (peer close, link loss, recovery, destroy).
    Close,
    /// The peer appended blocks to the receive ring.
    Receive,
    /// The peer returned blocks to the transmit pool.
    Get,
}

type Notifier = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Local view of a mapped channel region.
pub(crate) struct ChannelEndpoint {
    region: SharedRegion,
    tx: Lanes,
    rx: Lanes,
    ring_tx: Ring,
    ring_rx: Ring,
    pool_tx: Pool,
    pool_rx: Pool,
}

impl ChannelEndpoint {
    /// Bind to a formatted region, validating the header against the local
    /// configuration.
    fn attach(
        region: SharedRegion,
        config: &ChannelConfig,
        rings: (u32, u32),
        shared: Option<(Arc<Lane>, Arc<Lane>)>,
    ) -> Result<Self> {
        let view = LocalView::for_role(config.role);
        let pool_tx = Descriptor::new(&region, view.pool_tx);
        let pool_rx = Descriptor::new(&region, view.pool_rx);
        let ring_tx = Descriptor::new(&region, view.ring_tx);
        let ring_rx = Descriptor::new(&region, view.ring_rx);

        pool_tx.check_pool(config.tx())?;
        pool_rx.check_pool(config.rx())?;
        ring_tx.check_ring(config.tx_block_size, rings.0)?;
        ring_rx.check_ring(config.rx_block_size, rings.1)?;

        let tx_lane = Arc::new(Lane::new(
            Storage::from_descriptor(&pool_tx)?,
            Home::Private,
            Direction::Tx,
        ));
        let rx_lane = Arc::new(Lane::new(
            Storage::from_descriptor(&pool_rx)?,
            Home::Private,
            Direction::Rx,
        ));
        let (shared_tx, shared_rx) = match shared {
            Some((tx, rx)) => (Some(tx), Some(rx)),
            None => (None, None),
        };

        Ok(Self {
            tx: Lanes {
                private: Arc::clone(&tx_lane),
                shared: shared_tx,
            },
            rx: Lanes {
                private: Arc::clone(&rx_lane),
                shared: shared_rx,
            },
            ring_tx: Ring::new(Queue::attach(ring_tx)?),
            ring_rx: Ring::new(Queue::attach(ring_rx)?),
            pool_tx: Pool::new(Queue::attach(pool_tx)?, tx_lane),
            pool_rx: Pool::new(Queue::attach(pool_rx)?, rx_lane),
            region,
        })
    }

    pub(crate) fn ring_tx(&self) -> &Ring {
        &self.ring_tx
    }

    pub(crate) fn ring_rx(&self) -> &Ring {
        &self.ring_rx
    }

    pub(crate) fn pool_tx(&self) -> &Pool {
        &self.pool_tx
    }

    pub(crate) fn pool_rx(&self) -> &Pool {
        &self.pool_rx
    }
}

pub(crate) struct ChannelInner {
    config: ChannelConfig,
    state: StateCell,
    initialized: AtomicBool,
    /// Recovery already ran since the channel last left Ready.
    recovered: AtomicBool,
    link: Arc<dyn SignalLink>,
    provider: Arc<dyn ShmemProvider>,
    endpoint: OnceLock<ChannelEndpoint>,
    shared: Option<Arc<SharedPoolInner>>,
    get_waiters: WaitQueue,
    recv_waiters: WaitQueue,
    state_waiters: WaitQueue,
    notifier: Mutex<Option<Notifier>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_recovery: Mutex<Option<RecoveryReport>>,
}

impl ChannelInner {
    /// Build the channel. The host allocates and formats its region here;
    /// the companion attaches once the init exchange delivers the base.
    pub(crate) fn create(
        config: ChannelConfig,
        link: Arc<dyn SignalLink>,
        provider: Arc<dyn ShmemProvider>,
        shared: Option<Arc<SharedPoolInner>>,
    ) -> Result<Arc<Self>> {
        let inner = Self {
            config,
            state: StateCell::new(),
            initialized: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            link,
            provider,
            endpoint: OnceLock::new(),
            shared,
            get_waiters: WaitQueue::default(),
            recv_waiters: WaitQueue::default(),
            state_waiters: WaitQueue::default(),
            notifier: Mutex::new(None),
            worker: Mutex::new(None),
            last_recovery: Mutex::new(None),
        };

        if inner.config.role == Role::Host {
            let layout = inner.header_layout()?;
            let region = inner.provider.alloc(layout.size)?;
            let endpoint = layout
                .format(&region)
                .and_then(|()| inner.bind(region.clone()));
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

    /// Local ring capacities: every block that can be on loan, private or
    /// borrowed, must fit in flight.
    fn ring_capacities(&self) -> (u32, u32) {
        let (shared_tx, shared_rx) = self
            .shared
            .as_ref()
            .map(|pool| (pool.config().tx_block_count, pool.config().rx_block_count))
            .unwrap_or((0, 0));
        (
            self.config.tx_block_count + shared_tx,
            self.config.rx_block_count + shared_rx,
        )
    }

    /// Region layout in header (host) terms.
    fn header_layout(&self) -> Result<RegionLayout> {
        let (ring_tx, ring_rx) = self.ring_capacities();
        let layout = match self.config.role {
            Role::Host => RegionLayout::channel(self.config.tx(), self.config.rx(), ring_tx, ring_rx),
            Role::Companion => {
                RegionLayout::channel(self.config.rx(), self.config.tx(), ring_rx, ring_tx)
            }
        };
        layout.ok_or_else(|| BlockError::InvalidConfig("channel region too large".into()))
    }

    fn bind(&self, region: SharedRegion) -> Result<ChannelEndpoint> {
        let shared = match &self.shared {
            Some(pool) => {
                let endpoint = pool.endpoint().ok_or(BlockError::NotReady)?;
                Some((Arc::clone(endpoint.tx_lane()), Arc::clone(endpoint.rx_lane())))
            }
            None => None,
        };
        ChannelEndpoint::attach(region, &self.config, self.ring_capacities(), shared)
    }

    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state.get()
    }

    fn is_ready(&self) -> bool {
        self.state.get() == ChannelState::Ready
    }

    pub(crate) fn endpoint(&self) -> Option<&ChannelEndpoint> {
        self.endpoint.get()
    }

    /// Endpoint for operations that only need the channel to exist.
    fn live_endpoint(&self) -> Result<&ChannelEndpoint> {
        if self.state.get() == ChannelState::Destroyed {
            return Err(self.not_found());
        }
        self.endpoint.get().ok_or(BlockError::NotReady)
    }

    /// Endpoint for operations that need the handshake to be complete.
    fn ready_endpoint(&self) -> Result<&ChannelEndpoint> {
        match self.state.get() {
            ChannelState::Ready => self.endpoint.get().ok_or(BlockError::NotReady),
            ChannelState::Idle => Err(BlockError::NotReady),
            ChannelState::Destroyed => Err(self.not_found()),
        }
    }

    fn not_found(&self) -> BlockError {
        BlockError::NotFound {
            peer: self.config.peer_id,
            channel: self.config.channel_id,
        }
    }

    fn shared_ready(&self) -> Option<&PoolEndpoint> {
        self.shared
            .as_ref()
            .filter(|pool| pool.is_ready())
            .and_then(|pool| pool.endpoint())
    }

    fn try_get(&self, endpoint: &ChannelEndpoint) -> Result<Option<Block>> {
        if let Some(block) = endpoint.pool_tx.acquire()? {
            return Ok(Some(block));
        }
        match self.shared_ready() {
            Some(shared) => shared.pool_tx().acquire(),
            None => Ok(None),
        }
    }

    fn tx_free(&self, endpoint: &ChannelEndpoint) -> u32 {
        let shared = self
            .shared_ready()
            .map_or(0, |shared| shared.pool_tx().occupancy());
        endpoint.pool_tx.occupancy() + shared
    }

    /// Shared part of `get`/`receive`: poll, then block per `wait`.
    fn take_or_wait(
        &self,
        waiters: &WaitQueue,
        wait: Wait,
        empty: impl Fn() -> bool,
        take: impl Fn() -> Result<Option<Block>>,
    ) -> Result<Block> {
        if let Some(block) = take()? {
            return Ok(block);
        }
        let timeout = match wait {
            Wait::NoWait => return Err(BlockError::Empty),
            Wait::Forever => None,
            Wait::Timeout(timeout) => Some(timeout),
        };
        match waiters.wait_while(wait, || self.is_ready() && empty()) {
            WaitOutcome::TimedOut => Err(BlockError::DeadlineExceeded(timeout.unwrap_or_default())),
            WaitOutcome::Interrupted => Err(BlockError::Interrupted),
            WaitOutcome::Woken => {
                if !self.is_ready() {
                    return Err(BlockError::TornDown);
                }
                take()?.ok_or(BlockError::Retry)
            }
        }
    }

    pub(crate) fn fire(&self, event: ChannelEvent) {
        let notifier = self
            .notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(notifier) = notifier {
            notifier(event);
        }
    }

    fn notify_peer(&self, flag: u16) {
        let msg = SignalMessage::event(self.config.channel_id, flag, 0);
        if let Err(err) = self.link.send(msg) {
            warn!(
                peer = self.config.peer_id,
                channel = self.config.channel_id,
                error = %err,
                "peer notification failed"
            );
        }
    }

    /// Ready -> Idle, waking everyone blocked on the channel. Returns whether
    /// the channel was Ready.
    pub(crate) fn set_idle(&self) -> bool {
        let was_ready = self.state.make_idle();
        if was_ready {
            self.wake_everyone();
        }
        was_ready
    }

    /// Recover at most once per departure from Ready. A peer restart shows
    /// up as a re-Open followed by a second Init.
    pub(crate) fn recover_now(&self) {
        if self.recovered.swap(true, Ordering::AcqRel) {
            debug!(
                peer = self.config.peer_id,
                channel = self.config.channel_id,
                "already recovered since last ready"
            );
            return;
        }
        match recovery::recover_channel(self) {
            Some(report) => {
                *self
                    .last_recovery
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(report);
            }
            None => self.recovered.store(false, Ordering::Release),
        }
    }

    fn store_endpoint(&self, endpoint: ChannelEndpoint) {
        if self.endpoint.set(endpoint).is_err() {
            warn!(
                peer = self.config.peer_id,
                channel = self.config.channel_id,
                "endpoint already bound, keeping the first"
            );
        }
    }

    pub(crate) fn wake_getters(&self) {
        self.get_waiters.wake_all();
    }

    fn wake_everyone(&self) {
        self.get_waiters.wake_all();
        self.recv_waiters.wake_all();
        self.state_waiters.wake_all();
    }

    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        let handle = worker::spawn(Arc::clone(self))?;
        *self.worker_slot() = Some(handle);
        Ok(())
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Destroy: fail all waiters, close the signalling channel, stop the
    /// event thread and give the host region back.
    pub(crate) fn teardown(&self) {
        let peer = self.config.peer_id;
        let channel = self.config.channel_id;
        let was_ready = self.state.destroy();
        self.wake_everyone();

        if let Err(err) = self.link.close(channel) {
            debug!(peer, channel, error = %err, "close not delivered");
        }
        let worker = self.worker_slot().take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!(peer, channel, "event thread panicked");
            }
        }
        if was_ready {
            self.fire(ChannelEvent::Close);
        }
        if self.config.role == Role::Host {
            if let Some(endpoint) = self.endpoint.get() {
                self.provider.free(&endpoint.region);
            }
        }
        info!(peer, channel, "channel destroyed");
    }

    pub(crate) fn snapshot(&self) -> ChannelSnapshot {
        let endpoint = self.endpoint.get();
        let queues = endpoint
            .map(|endpoint| {
                vec![
                    QueueSnapshot::capture("ring-tx", &endpoint.ring_tx.lock()),
                    QueueSnapshot::capture("ring-rx", &endpoint.ring_rx.lock()),
                    QueueSnapshot::capture("pool-tx", &endpoint.pool_tx.lock()),
                    QueueSnapshot::capture("pool-rx", &endpoint.pool_rx.lock()),
                ]
            })
            .unwrap_or_default();
        ChannelSnapshot {
            peer_id: self.config.peer_id,
            channel_id: self.config.channel_id,
            role: self.config.role,
            state: self.state.get(),
            shared_pool: self.shared.is_some(),
            region_base: endpoint.map(|endpoint| endpoint.region.phys_base().get()),
            region_size: endpoint.map(|endpoint| endpoint.region.len()),
            queues,
            pending_tx: endpoint.map_or(0, |endpoint| {
                endpoint.tx.private.ledger().pending_count()
            }),
            pending_rx: endpoint.map_or(0, |endpoint| {
                endpoint.rx.private.ledger().pending_count()
            }),
            notifier: self
                .notifier
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some(),
            last_recovery: *self
                .last_recovery
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl ControlTarget for ChannelInner {
    fn label(&self) -> &'static str {
        "channel"
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
        ChannelInner::is_ready(self)
    }

    fn first_init(&self) -> bool {
        !self.initialized.swap(true, Ordering::AcqRel)
    }

    fn recover(&self) {
        self.recover_now();
    }

    fn go_idle(&self) {
        if self.set_idle() {
            info!(
                peer = self.config.peer_id,
                channel = self.config.channel_id,
                "channel idle"
            );
            self.fire(ChannelEvent::Close);
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
        self.wake_everyone();
        true
    }

    fn announce_open(&self) {
        self.fire(ChannelEvent::Open);
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
                "peer announced {base}, channel is bound to {}",
                endpoint.region.phys_base()
            )));
        }
        let layout = self.header_layout()?;
        let region = self.provider.map(base, layout.size)?;
        let endpoint = self.bind(region)?;
        self.store_endpoint(endpoint);
        debug!(
            peer = self.config.peer_id,
            channel = self.config.channel_id,
            base = %base,
            "attached to peer region"
        );
        Ok(())
    }

    fn on_send_event(&self) {
        self.recv_waiters.wake_all();
        self.fire(ChannelEvent::Receive);
    }

    fn on_release_event(&self) {
        self.get_waiters.wake_all();
        self.fire(ChannelEvent::Get);
    }
}

/// Handle to one channel. Cheap to clone; all clones refer to the same
/// channel.
#[derive(Clone)]
pub struct ChannelHandle {
    pub(crate) inner: Arc<ChannelInner>,
}

impl ChannelHandle {
    pub(crate) fn new(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    pub fn peer_id(&self) -> u8 {
        self.inner.config.peer_id
    }

    pub fn channel_id(&self) -> u8 {
        self.inner.config.channel_id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Borrow a free transmit block.
    ///
    /// Blocks according to `wait` when the pool is empty. A waiter that is
    /// woken but loses the block to a concurrent caller gets
    /// [`BlockError::Retry`].
    pub fn get(&self, wait: Wait) -> Result<Block> {
        let inner = &*self.inner;
        let endpoint = inner.ready_endpoint()?;
        inner.take_or_wait(
            &inner.get_waiters,
            wait,
            || inner.tx_free(endpoint) == 0,
            || inner.try_get(endpoint),
        )
    }

    /// Return a block obtained with [`get`](Self::get) without sending it.
    /// The block becomes the next one `get` hands out.
    pub fn put(&self, block: Block) -> std::result::Result<(), Rejected> {
        let inner = &*self.inner;
        let endpoint = match inner.live_endpoint() {
            Ok(endpoint) => endpoint,
            Err(error) => return Err(Rejected::new(error, block)),
        };
        match block.home() {
            Home::Private => {
                endpoint.pool_tx.give_back(block)?;
                inner.get_waiters.wake_all();
            }
            Home::Shared => {
                let Some(pool) = inner.shared.as_ref() else {
                    let error = BlockError::InvalidBlock("channel has no shared pool".into());
                    return Err(Rejected::new(error, block));
                };
                pool.give_back(block)?;
            }
        }
        Ok(())
    }

    /// Queue a block for the peer and notify it.
    pub fn send(&self, block: Block) -> std::result::Result<(), Rejected> {
        self.enqueue(block)?;
        self.inner.notify_peer(EVENT_BLOCK_SEND);
        Ok(())
    }

    /// Queue a block for the peer without notifying it. Follow a batch of
    /// these with one [`send_finish`](Self::send_finish).
    pub fn send_prepare(&self, block: Block) -> std::result::Result<(), Rejected> {
        self.enqueue(block)
    }

    /// Notify the peer once for everything queued by `send_prepare`.
    pub fn send_finish(&self) -> Result<()> {
        self.inner.ready_endpoint()?;
        self.inner.notify_peer(EVENT_BLOCK_SEND);
        Ok(())
    }

    fn enqueue(&self, block: Block) -> std::result::Result<(), Rejected> {
        let endpoint = match self.inner.ready_endpoint() {
            Ok(endpoint) => endpoint,
            Err(error) => return Err(Rejected::new(error, block)),
        };
        let Some(lane) = endpoint.tx.home(block.home()) else {
            let error = BlockError::InvalidBlock("channel has no shared pool".into());
            return Err(Rejected::new(error, block));
        };
        endpoint.ring_tx.enqueue(block, lane)
    }

    /// Take the oldest block the peer sent. Blocking semantics match
    /// [`get`](Self::get).
    pub fn receive(&self, wait: Wait) -> Result<Block> {
        let inner = &*self.inner;
        let endpoint = inner.ready_endpoint()?;
        inner.take_or_wait(
            &inner.recv_waiters,
            wait,
            || endpoint.ring_rx.occupancy() == 0,
            || endpoint.ring_rx.dequeue(&endpoint.rx),
        )
    }

    /// Return a received block to the peer's free list.
    pub fn release(&self, block: Block) -> std::result::Result<(), Rejected> {
        let inner = &*self.inner;
        let endpoint = match inner.live_endpoint() {
            Ok(endpoint) => endpoint,
            Err(error) => return Err(Rejected::new(error, block)),
        };
        match block.home() {
            Home::Private => {
                let refilled = endpoint.pool_rx.release(block)?;
                if refilled && inner.is_ready() {
                    inner.notify_peer(EVENT_BLOCK_RELEASE);
                }
            }
            Home::Shared => {
                let Some(pool) = inner.shared.as_ref() else {
                    let error = BlockError::InvalidBlock("channel has no shared pool".into());
                    return Err(Rejected::new(error, block));
                };
                pool.release(block)?;
            }
        }
        Ok(())
    }

    /// Blocks available to `get` right now (private plus shared).
    pub fn free_count(&self) -> u32 {
        self.inner
            .endpoint
            .get()
            .map_or(0, |endpoint| self.inner.tx_free(endpoint))
    }

    /// Blocks waiting to be received.
    pub fn arrived_count(&self) -> u32 {
        self.inner
            .endpoint
            .get()
            .map_or(0, |endpoint| endpoint.ring_rx.occupancy())
    }

    /// Register the channel's event callback.
    ///
    /// The callback runs on the channel's event thread (or the caller's
    /// thread for events caused locally) and must not block. If the channel
    /// is already Ready, `Open` (and `Receive` when blocks are waiting) is
    /// reported immediately.
    pub fn register_notifier<F>(&self, notifier: F) -> Result<()>
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        let inner = &*self.inner;
        if inner.state.get() == ChannelState::Destroyed {
            return Err(inner.not_found());
        }
        {
            let mut slot = inner
                .notifier
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                match inner.config.notifier_policy {
                    NotifierPolicy::Strict => return Err(BlockError::NotifierRegistered),
                    NotifierPolicy::Replace => debug!(
                        peer = inner.config.peer_id,
                        channel = inner.config.channel_id,
                        "replacing notifier"
                    ),
                }
            }
            *slot = Some(Arc::new(notifier));
        }
        if inner.is_ready() {
            inner.fire(ChannelEvent::Open);
            if self.arrived_count() > 0 {
                inner.fire(ChannelEvent::Receive);
            }
        }
        Ok(())
    }

    /// Wake every blocked `get`/`receive` with [`BlockError::Interrupted`].
    pub fn interrupt(&self) {
        self.inner.get_waiters.interrupt_all();
        self.inner.recv_waiters.interrupt_all();
    }

    /// Wait for the open handshake to complete.
    pub fn wait_ready(&self, wait: Wait) -> Result<()> {
        let inner = &*self.inner;
        let outcome = inner
            .state_waiters
            .wait_while(wait, || inner.state.get() == ChannelState::Idle);
        match inner.state.get() {
            ChannelState::Ready => Ok(()),
            ChannelState::Destroyed => Err(inner.not_found()),
            ChannelState::Idle => match (outcome, wait) {
                (WaitOutcome::TimedOut, Wait::Timeout(timeout)) => {
                    Err(BlockError::DeadlineExceeded(timeout))
                }
                (WaitOutcome::Interrupted, _) => Err(BlockError::Interrupted),
                _ => Err(BlockError::NotReady),
            },
        }
    }

    /// Descriptor and pointer snapshot for diagnostics.
    pub fn snapshot(&self) -> ChannelSnapshot {
        self.inner.snapshot()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("peer_id", &self.peer_id())
            .field("channel_id", &self.channel_id())
            .field("role", &self.inner.config.role)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use sblock_shmem::PhysicalMemory;
    use sblock_signal::SignalPort;

    use super::*;

    /// A host channel with no worker, driven directly.
    fn host_channel() -> (Arc<ChannelInner>, SignalPort) {
        let (link, raw) = SignalPort::pair().expect("socketpair");
        let inner = ChannelInner::create(
            ChannelConfig::new(1, 1).with_tx(64, 4).with_rx(64, 4),
            Arc::new(link),
            Arc::new(PhysicalMemory::new()),
            None,
        )
        .expect("create host channel");
        (inner, raw)
    }

    fn last_recovery(inner: &ChannelInner) -> Option<RecoveryReport> {
        *inner
            .last_recovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[test]
    fn recovery_runs_once_until_ready_again() {
        let (inner, _raw) = host_channel();
        assert!(inner.mark_ready());
        let handle = ChannelHandle::new(Arc::clone(&inner));
        for _ in 0..2 {
            let block = handle.get(Wait::NoWait).expect("get");
            handle.send(block).expect("send");
        }

        inner.recover_now();
        let first = last_recovery(&inner).expect("first recovery");
        assert_eq!(first.discarded_tx, 2);
        assert_eq!(first.pool_tx, 4);

        // Second restart signal before the channel came back up.
        inner.recover_now();
        assert_eq!(last_recovery(&inner), Some(first));

        assert!(inner.mark_ready());
        inner.recover_now();
        let next = last_recovery(&inner).expect("next recovery");
        assert_eq!(next.discarded_tx, 0);
        assert_eq!(next.pool_tx, 4);
    }

    #[test]
    fn second_bind_keeps_first_endpoint() {
        let (inner, _raw) = host_channel();
        let base = inner.region_base().expect("host region");

        let layout = inner.header_layout().expect("layout");
        let other = inner.provider.alloc(layout.size).expect("alloc");
        layout.format(&other).expect("format");
        inner.store_endpoint(inner.bind(other.clone()).expect("bind"));

        assert_eq!(inner.region_base(), Some(base));
        assert!(matches!(
            inner.attach(other.phys_base()),
            Err(BlockError::LayoutMismatch(_))
        ));
        inner.attach(base).expect("same base attaches");
    }
}
