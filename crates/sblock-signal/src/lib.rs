//! Signalling channel between two processor domains.
//!
//! Block payloads never travel here. This path only carries short control
//! and event messages that bootstrap a channel and wake the peer:
//! - an 8-byte message: channel id, type, 16-bit flag, 32-bit value
//! - per-channel open/close handshakes
//! - fire-and-forget events ("blocks were sent", "blocks were released")
//!
//! [`SignalLink`] is the interface the block transport consumes.
//! [`SignalPort`] implements it over a Unix socketpair so both domains can
//! run inside one process.

pub mod codec;
pub mod error;
pub mod link;
pub mod message;
#[cfg(unix)]
pub mod port;
pub mod reader;
pub mod writer;

pub use codec::{decode_message, encode_message, MESSAGE_SIZE};
pub use error::{Result, SignalError};
pub use link::SignalLink;
pub use message::{
    MessageKind, SignalMessage, CLOSE_MAGIC, CMD_BLOCK_INIT, DONE_BLOCK_INIT, EVENT_BLOCK_RELEASE,
    EVENT_BLOCK_SEND, OPEN_MAGIC,
};
#[cfg(unix)]
pub use port::SignalPort;
pub use reader::MessageReader;
pub use writer::MessageWriter;
