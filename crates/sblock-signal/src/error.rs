/// Errors that can occur on the signalling channel.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// An I/O error occurred on the underlying link.
    #[error("signal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The link was closed before a complete message was received.
    #[error("connection closed (incomplete message)")]
    ConnectionClosed,

    /// The channel was closed locally.
    #[error("channel {0} closed")]
    Closed(u8),

    /// No message arrived within the requested time.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The link to the peer domain is gone.
    #[error("link to peer is down")]
    LinkDown,
}

pub type Result<T> = std::result::Result<T, SignalError>;
