use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_message, MESSAGE_SIZE};
use crate::error::{Result, SignalError};
use crate::message::SignalMessage;

/// Writes complete signalling messages to any `Write` stream.
pub struct MessageWriter<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Write> MessageWriter<T> {
    /// Create a new message writer.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(MESSAGE_SIZE),
        }
    }

    /// Encode and send one message (blocking until fully written).
    pub fn send(&mut self, msg: &SignalMessage) -> Result<()> {
        self.buf.clear();
        encode_message(msg, &mut self.buf);

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(SignalError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(SignalError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(SignalError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::decode_message;
    use crate::message::{CMD_BLOCK_INIT, EVENT_BLOCK_SEND};

    #[test]
    fn write_multiple_messages() {
        let mut writer = MessageWriter::new(Cursor::new(Vec::<u8>::new()));
        writer
            .send(&SignalMessage::command(3, CMD_BLOCK_INIT, 0))
            .unwrap();
        writer
            .send(&SignalMessage::event(3, EVENT_BLOCK_SEND, 1))
            .unwrap();

        let mut wire = BytesMut::from(writer.into_inner().into_inner().as_slice());
        assert_eq!(wire.len(), 2 * MESSAGE_SIZE);

        let first = decode_message(&mut wire).unwrap();
        assert_eq!(first, SignalMessage::command(3, CMD_BLOCK_INIT, 0));
        let second = decode_message(&mut wire).unwrap();
        assert_eq!(second.value, 1);
    }

    #[test]
    fn zero_length_write_reports_closed() {
        let mut writer = MessageWriter::new(ZeroWriter);
        let err = writer.send(&SignalMessage::open(1)).unwrap_err();
        assert!(matches!(err, SignalError::ConnectionClosed));
    }

    #[test]
    fn interrupted_write_retries() {
        let mut writer = MessageWriter::new(InterruptOnce {
            fired: false,
            out: Vec::new(),
        });
        writer.send(&SignalMessage::open(2)).unwrap();
        assert_eq!(writer.get_ref().out.len(), MESSAGE_SIZE);
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct InterruptOnce {
        fired: bool,
        out: Vec<u8>,
    }

    impl Write for InterruptOnce {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.fired {
                self.fired = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.out.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
