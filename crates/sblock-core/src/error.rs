use std::time::Duration;

use crate::block::Block;

/// Errors returned by block transport operations.
///
/// None of these are fatal to the process. The first group describes
/// expected runtime conditions; the second group reports contract violations
/// by the caller.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    /// No channel with this identity exists (never created or destroyed).
    #[error("channel {channel} on peer {peer} not found")]
    NotFound { peer: u8, channel: u8 },

    /// The open handshake has not completed.
    #[error("channel not ready")]
    NotReady,

    /// Non-blocking call found the structure empty.
    #[error("no block available")]
    Empty,

    /// Bounded wait expired.
    #[error("no block available within {0:?}")]
    DeadlineExceeded(Duration),

    /// The wait was interrupted by [`ChannelHandle::interrupt`](crate::ChannelHandle::interrupt).
    #[error("wait interrupted")]
    Interrupted,

    /// The channel went idle or was destroyed while the caller waited.
    #[error("channel torn down")]
    TornDown,

    /// Another caller took the block this waiter was woken for.
    #[error("lost race for a freed block, retry")]
    Retry,

    /// A notifier is already registered and the policy is strict.
    #[error("notifier already registered")]
    NotifierRegistered,

    /// The block does not belong here (wrong channel, direction or state).
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// Channel or pool configuration rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The shared header does not match the local configuration.
    #[error("shared-memory layout mismatch: {0}")]
    LayoutMismatch(String),

    /// A channel or shared pool with this identity already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The object is still referenced and cannot be destroyed.
    #[error("{0} still in use")]
    InUse(String),

    /// Shared-memory error.
    #[error("shared memory error: {0}")]
    Shmem(#[from] sblock_shmem::ShmemError),

    /// Signalling channel error.
    #[error("signal error: {0}")]
    Signal(#[from] sblock_signal::SignalError),

    /// The event thread could not be started.
    #[error("failed to spawn event thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl BlockError {
    /// Whether the condition is expected to clear on its own (the caller may
    /// simply try again later).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BlockError::Empty
                | BlockError::DeadlineExceeded(_)
                | BlockError::Interrupted
                | BlockError::Retry
                | BlockError::NotReady
        )
    }
}

/// A block-consuming operation failed; the block is handed back.
#[derive(Debug, thiserror::Error)]
#[error("block rejected: {error}")]
pub struct Rejected {
    pub error: BlockError,
    pub block: Block,
}

impl Rejected {
    pub(crate) fn new(error: BlockError, block: Block) -> Self {
        Self { error, block }
    }

    /// Recover the block.
    pub fn into_block(self) -> Block {
        self.block
    }
}

impl From<Rejected> for BlockError {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

pub type Result<T> = std::result::Result<T, BlockError>;
