use bytes::{Buf, BufMut, BytesMut};

use crate::message::{MessageKind, SignalMessage};

/// Size of one message on the wire.
pub const MESSAGE_SIZE: usize = 8;

/// Encode a message into the wire format.
///
/// Wire format:
/// ```text
/// ┌───────────┬──────────┬──────────┬────────────┐
/// │ Channel   │ Type     │ Flag     │ Value      │
/// │ (1B)      │ (1B)     │ (2B LE)  │ (4B LE)    │
/// └───────────┴──────────┴──────────┴────────────┘
/// ```
pub fn encode_message(msg: &SignalMessage, dst: &mut BytesMut) {
    dst.reserve(MESSAGE_SIZE);
    dst.put_u8(msg.channel);
    dst.put_u8(msg.kind.code());
    dst.put_u16_le(msg.flag);
    dst.put_u32_le(msg.value);
}

/// Decode a message from a buffer.
///
/// Returns `None` if the buffer doesn't hold a complete message yet.
/// On success, consumes the message bytes from the buffer.
pub fn decode_message(src: &mut BytesMut) -> Option<SignalMessage> {
    if src.len() < MESSAGE_SIZE {
        return None;
    }

    let channel = src.get_u8();
    let kind = MessageKind::from_code(src.get_u8());
    let flag = src.get_u16_le();
    let value = src.get_u32_le();

    Some(SignalMessage {
        channel,
        kind,
        flag,
        value,
    })
}
