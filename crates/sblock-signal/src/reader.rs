use std::io::{ErrorKind, Read};

use bytes::BytesMut;

use crate::codec::{decode_message, MESSAGE_SIZE};
use crate::error::{Result, SignalError};
use crate::message::SignalMessage;

const INITIAL_BUFFER_CAPACITY: usize = 32 * MESSAGE_SIZE;
const READ_CHUNK_SIZE: usize = 32 * MESSAGE_SIZE;

/// Reads complete signalling messages from any `Read` stream.
///
/// Partial reads are buffered internally; callers only see complete messages.
pub struct MessageReader<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Read> MessageReader<T> {
    /// Create a new message reader.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Err(SignalError::ConnectionClosed)` when EOF is reached.
    pub fn read_message(&mut self) -> Result<SignalMessage> {
        loop {
            if let Some(msg) = decode_message(&mut self.buf) {
                return Ok(msg);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(SignalError::Io(err)),
            };

            if read == 0 {
                return Err(SignalError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::encode_message;
    use crate::message::{EVENT_BLOCK_RELEASE, EVENT_BLOCK_SEND};

    fn wire(messages: &[SignalMessage]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for msg in messages {
            encode_message(msg, &mut buf);
        }
        buf.to_vec()
    }

    #[test]
    fn read_multiple_messages() {
        let bytes = wire(&[
            SignalMessage::open(1),
            SignalMessage::event(1, EVENT_BLOCK_SEND, 0),
            SignalMessage::event(2, EVENT_BLOCK_RELEASE, 0),
        ]);
        let mut reader = MessageReader::new(Cursor::new(bytes));

        assert_eq!(reader.read_message().unwrap(), SignalMessage::open(1));
        assert!(reader.read_message().unwrap().is_event(EVENT_BLOCK_SEND));
        let third = reader.read_message().unwrap();
        assert_eq!(third.channel, 2);
        assert!(third.is_event(EVENT_BLOCK_RELEASE));
    }

    #[test]
    fn partial_read_handling() {
        let byte_reader = ByteByByteReader {
            bytes: wire(&[SignalMessage::close(9)]),
            pos: 0,
        };
        let mut reader = MessageReader::new(byte_reader);
        assert_eq!(reader.read_message().unwrap(), SignalMessage::close(9));
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = MessageReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, SignalError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_message() {
        let mut bytes = wire(&[SignalMessage::open(1)]);
        bytes.truncate(5);
        let mut reader = MessageReader::new(Cursor::new(bytes));
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, SignalError::ConnectionClosed));
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            interrupted: false,
            inner: Cursor::new(wire(&[SignalMessage::open(4)])),
        };
        let mut reader = MessageReader::new(reader);
        assert_eq!(reader.read_message().unwrap(), SignalMessage::open(4));
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }
}
