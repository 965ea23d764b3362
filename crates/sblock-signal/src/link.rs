use std::time::Duration;

use crate::error::Result;
use crate::message::SignalMessage;

/// The signalling channel as seen by the block transport.
///
/// Timeouts are `None` for "wait forever". Implementations must be safe to
/// call concurrently: the channel event thread blocks in `recv` while API
/// callers `send` events from arbitrary threads.
pub trait SignalLink: Send + Sync {
    /// Open `channel` and wait until the peer has opened it as well.
    fn open(&self, channel: u8, timeout: Option<Duration>) -> Result<()>;

    /// Close `channel`: notify the peer and fail any local `recv` on it.
    fn close(&self, channel: u8) -> Result<()>;

    /// Send one message without waiting for the peer to consume it.
    fn send(&self, msg: SignalMessage) -> Result<()>;

    /// Wait for the next message on `channel`.
    fn recv(&self, channel: u8, timeout: Option<Duration>) -> Result<SignalMessage>;

    /// Acknowledge the peer's open request.
    fn open_ack(&self, channel: u8) -> Result<()> {
        self.send(SignalMessage::open(channel))
    }

    /// Acknowledge the peer's close request.
    fn close_ack(&self, channel: u8) -> Result<()> {
        self.send(SignalMessage::close(channel))
    }
}
