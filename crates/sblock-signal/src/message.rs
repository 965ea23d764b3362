//! Signalling message shapes.
//!
//! Type codes and flags are part of the wire contract with the peer domain.

use std::fmt;

/// Flag carried by `Open` messages.
pub const OPEN_MAGIC: u16 = 0xBEEE;

/// Flag carried by `Close` messages.
pub const CLOSE_MAGIC: u16 = 0xEDDD;

/// `Command` flag: request the block transport's shared-memory layout.
pub const CMD_BLOCK_INIT: u16 = 0x0002;

/// `Done` flag: block transport initialised; value is the region's physical base.
pub const DONE_BLOCK_INIT: u16 = 0x0002;

/// `Event` flag: blocks were appended to a transfer ring.
pub const EVENT_BLOCK_SEND: u16 = 0x0003;

/// `Event` flag: blocks were returned to a pool.
pub const EVENT_BLOCK_RELEASE: u16 = 0x0004;

const TYPE_OPEN: u8 = 1;
const TYPE_CLOSE: u8 = 2;
const TYPE_EVENT: u8 = 5;
const TYPE_COMMAND: u8 = 6;
const TYPE_DONE: u8 = 7;

/// Message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Channel open request, or acknowledgement of the peer's open.
    Open,
    /// Channel close request, or acknowledgement of the peer's close.
    Close,
    /// Request for the peer to perform an action (flag selects which).
    Command,
    /// Completion of a previous command.
    Done,
    /// Asynchronous notification.
    Event,
    /// A type this side does not understand.
    Other(u8),
}

impl MessageKind {
    /// Wire code for this type.
    pub fn code(self) -> u8 {
        match self {
            MessageKind::Open => TYPE_OPEN,
            MessageKind::Close => TYPE_CLOSE,
            MessageKind::Event => TYPE_EVENT,
            MessageKind::Command => TYPE_COMMAND,
            MessageKind::Done => TYPE_DONE,
            MessageKind::Other(code) => code,
        }
    }

    /// Parse a wire code. Unknown codes are preserved as `Other`.
    pub fn from_code(code: u8) -> Self {
        match code {
            TYPE_OPEN => MessageKind::Open,
            TYPE_CLOSE => MessageKind::Close,
            TYPE_EVENT => MessageKind::Event,
            TYPE_COMMAND => MessageKind::Command,
            TYPE_DONE => MessageKind::Done,
            other => MessageKind::Other(other),
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Open => "OPEN",
            MessageKind::Close => "CLOSE",
            MessageKind::Event => "EVENT",
            MessageKind::Command => "CMD",
            MessageKind::Done => "DONE",
            MessageKind::Other(_) => "UNKNOWN",
        }
    }
}

/// One signalling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalMessage {
    /// Logical channel this message belongs to.
    pub channel: u8,
    /// Message type.
    pub kind: MessageKind,
    /// Type-specific flag.
    pub flag: u16,
    /// Type-specific value.
    pub value: u32,
}

impl SignalMessage {
    /// Create a message.
    pub fn new(channel: u8, kind: MessageKind, flag: u16, value: u32) -> Self {
        Self {
            channel,
            kind,
            flag,
            value,
        }
    }

    /// Open request / acknowledgement.
    pub fn open(channel: u8) -> Self {
        Self::new(channel, MessageKind::Open, OPEN_MAGIC, 0)
    }

    /// Close request / acknowledgement.
    pub fn close(channel: u8) -> Self {
        Self::new(channel, MessageKind::Close, CLOSE_MAGIC, 0)
    }

    /// Command message.
    pub fn command(channel: u8, flag: u16, value: u32) -> Self {
        Self::new(channel, MessageKind::Command, flag, value)
    }

    /// Completion message.
    pub fn done(channel: u8, flag: u16, value: u32) -> Self {
        Self::new(channel, MessageKind::Done, flag, value)
    }

    /// Event message.
    pub fn event(channel: u8, flag: u16, value: u32) -> Self {
        Self::new(channel, MessageKind::Event, flag, value)
    }

    /// Whether this is an event carrying `flag`.
    pub fn is_event(&self, flag: u16) -> bool {
        self.kind == MessageKind::Event && self.flag == flag
    }
}

impl fmt::Display for SignalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(channel={}, flag={:#06x}, value={:#010x})",
            self.kind.name(),
            self.channel,
            self.flag,
            self.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_roundtrip() {
        for kind in [
            MessageKind::Open,
            MessageKind::Close,
            MessageKind::Event,
            MessageKind::Command,
            MessageKind::Done,
        ] {
            assert_eq!(MessageKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn unknown_code_is_preserved() {
        let kind = MessageKind::from_code(0x42);
        assert_eq!(kind, MessageKind::Other(0x42));
        assert_eq!(kind.code(), 0x42);
        assert_eq!(kind.name(), "UNKNOWN");
    }

    #[test]
    fn constructors_set_magic() {
        assert_eq!(SignalMessage::open(3).flag, OPEN_MAGIC);
        assert_eq!(SignalMessage::close(3).flag, CLOSE_MAGIC);
        assert!(SignalMessage::event(3, EVENT_BLOCK_SEND, 0).is_event(EVENT_BLOCK_SEND));
        assert!(!SignalMessage::event(3, EVENT_BLOCK_SEND, 0).is_event(EVENT_BLOCK_RELEASE));
    }

    #[test]
    fn display_is_compact() {
        let msg = SignalMessage::done(7, DONE_BLOCK_INIT, 0x8000_0000);
        assert_eq!(
            msg.to_string(),
            "DONE(channel=7, flag=0x0002, value=0x80000000)"
        );
    }
}
