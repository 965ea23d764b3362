//! Reconciling pools and rings after a peer reset.
//!
//! Ring contents cannot be trusted once the peer restarted, so both rings are
//! collapsed. Each pool is then rebuilt from its ledger: every block not held
//! by a local caller goes back on the free list, blocks still on loan stay
//! out so they are never handed out twice.

use serde::Serialize;
use tracing::info;

use crate::channel::{ChannelEvent, ChannelInner};
use crate::pool;
use crate::shared::PoolEndpoint;

/// What one recovery pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Blocks dropped from the transmit ring.
    pub discarded_tx: u32,
    /// Blocks dropped from the receive ring.
    pub discarded_rx: u32,
    /// Transmit pool occupancy after the rebuild.
    pub pool_tx: u32,
    /// Receive pool occupancy after the rebuild.
    pub pool_rx: u32,
    /// Transmit blocks left out because a caller still holds them.
    pub on_loan_tx: u32,
    /// Receive blocks left out because a caller still holds them.
    pub on_loan_rx: u32,
}

/// Run recovery on one channel. Returns `None` when the channel has no
/// region yet, in which case there is nothing to reconcile.
pub(crate) fn recover_channel(channel: &ChannelInner) -> Option<RecoveryReport> {
    if channel.set_idle() {
        channel.fire(ChannelEvent::Close);
    }
    let endpoint = channel.endpoint()?;

    // Fixed order: ring-tx, ring-rx, pool-tx, pool-rx.
    let mut ring_tx = endpoint.ring_tx().lock();
    let mut ring_rx = endpoint.ring_rx().lock();
    let mut pool_tx = endpoint.pool_tx().lock();
    let mut pool_rx = endpoint.pool_rx().lock();

    let tx_lane = endpoint.pool_tx().lane();
    let rx_lane = endpoint.pool_rx().lane();
    let report = RecoveryReport {
        discarded_tx: ring_tx.collapse(),
        discarded_rx: ring_rx.collapse(),
        pool_tx: pool::rebuild(&mut pool_tx, tx_lane),
        pool_rx: pool::rebuild(&mut pool_rx, rx_lane),
        on_loan_tx: tx_lane.ledger().pending_count(),
        on_loan_rx: rx_lane.ledger().pending_count(),
    };
    drop((ring_tx, ring_rx, pool_tx, pool_rx));

    let config = channel.config();
    info!(
        peer = config.peer_id,
        channel = config.channel_id,
        discarded_tx = report.discarded_tx,
        discarded_rx = report.discarded_rx,
        pool_tx = report.pool_tx,
        pool_rx = report.pool_rx,
        on_loan_tx = report.on_loan_tx,
        on_loan_rx = report.on_loan_rx,
        "channel recovered"
    );
    Some(report)
}

/// Rebuild both pools of a shared domain from the shared ledgers.
pub(crate) fn recover_shared(endpoint: &PoolEndpoint) -> RecoveryReport {
    let mut pool_tx = endpoint.pool_tx().lock();
    let mut pool_rx = endpoint.pool_rx().lock();

    let tx_lane = endpoint.pool_tx().lane();
    let rx_lane = endpoint.pool_rx().lane();
    RecoveryReport {
        discarded_tx: 0,
        discarded_rx: 0,
        pool_tx: pool::rebuild(&mut pool_tx, tx_lane),
        pool_rx: pool::rebuild(&mut pool_rx, rx_lane),
        on_loan_tx: tx_lane.ledger().pending_count(),
        on_loan_rx: rx_lane.ledger().pending_count(),
    }
}
