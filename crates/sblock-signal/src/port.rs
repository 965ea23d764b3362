//! In-process signalling link over a Unix socketpair.
//!
//! A background reader thread demultiplexes inbound messages into
//! per-channel mailboxes. Messages that arrive before a channel is opened
//! are queued; messages for a closed channel are dropped.

use std::collections::{HashMap, VecDeque};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Result, SignalError};
use crate::link::SignalLink;
use crate::message::{MessageKind, SignalMessage};
use crate::reader::MessageReader;
use crate::writer::MessageWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MailboxState {
    Unopened,
    Open,
    Closed,
}

#[derive(Debug)]
struct Mailbox {
    state: MailboxState,
    queue: VecDeque<SignalMessage>,
    opening: bool,
    acked: bool,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            state: MailboxState::Unopened,
            queue: VecDeque::new(),
            opening: false,
            acked: false,
        }
    }

    fn take_queued_open(&mut self) -> bool {
        match self
            .queue
            .iter()
            .position(|msg| msg.kind == MessageKind::Open)
        {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct PortState {
    mailboxes: HashMap<u8, Mailbox>,
    link_down: bool,
}

impl PortState {
    fn mailbox(&mut self, channel: u8) -> &mut Mailbox {
        self.mailboxes.entry(channel).or_insert_with(Mailbox::new)
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<PortState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, msg: SignalMessage) {
        let mut state = self.lock();
        let mailbox = state.mailbox(msg.channel);
        if msg.kind == MessageKind::Open && mailbox.opening {
            mailbox.acked = true;
        } else if msg.kind == MessageKind::Close && mailbox.opening {
            // Acknowledgement of a close that predates this open.
            tracing::trace!(%msg, "dropping stale close");
            return;
        } else if mailbox.state == MailboxState::Closed {
            tracing::trace!(%msg, "dropping message for closed channel");
            return;
        } else {
            mailbox.queue.push_back(msg);
        }
        drop(state);
        self.cond.notify_all();
    }

    fn mark_down(&self) {
        self.lock().link_down = true;
        self.cond.notify_all();
    }

    /// Wait on the condvar until `deadline`. Returns `false` once it has passed.
    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, PortState>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, PortState>, bool) {
        match deadline {
            None => (
                self.cond
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
                true,
            ),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return (guard, false);
                }
                let (guard, _) = self
                    .cond
                    .wait_timeout(guard, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, true)
            }
        }
    }
}

/// One end of an in-process signalling link.
///
/// Cloneable handles are not provided; share it behind an `Arc`.
pub struct SignalPort {
    shared: Arc<Shared>,
    writer: Mutex<MessageWriter<UnixStream>>,
    stream: UnixStream,
    reader: Option<JoinHandle<()>>,
}

impl SignalPort {
    /// Create both ends of a connected link.
    pub fn pair() -> Result<(SignalPort, SignalPort)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a)?, Self::from_stream(b)?))
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: UnixStream) -> Result<SignalPort> {
        let shared = Arc::new(Shared::default());
        let read_half = stream.try_clone()?;
        let write_half = stream.try_clone()?;

        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name("sblock-signal-rx".to_string())
            .spawn(move || {
                let mut reader = MessageReader::new(read_half);
                loop {
                    match reader.read_message() {
                        Ok(msg) => {
                            tracing::trace!(%msg, "signal in");
                            reader_shared.route(msg);
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "signal link down");
                            reader_shared.mark_down();
                            break;
                        }
                    }
                }
            })?;

        Ok(SignalPort {
            shared,
            writer: Mutex::new(MessageWriter::new(write_half)),
            stream,
            reader: Some(reader),
        })
    }

    /// Whether the peer end has gone away.
    pub fn is_link_down(&self) -> bool {
        self.shared.lock().link_down
    }

    /// Number of messages queued for `channel` and not yet received.
    pub fn pending(&self, channel: u8) -> usize {
        self.shared
            .lock()
            .mailboxes
            .get(&channel)
            .map_or(0, |mailbox| mailbox.queue.len())
    }
}

impl SignalLink for SignalPort {
    fn open(&self, channel: u8, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);

        {
            let mut state = self.shared.lock();
            if state.link_down {
                return Err(SignalError::LinkDown);
            }
            let mailbox = state.mailbox(channel);
            mailbox.state = MailboxState::Open;
            mailbox.opening = true;
            mailbox.acked = false;
            mailbox.queue.retain(|msg| msg.kind != MessageKind::Close);
        }

        let sent = self.send(SignalMessage::open(channel));

        let mut state = self.shared.lock();
        let outcome = loop {
            if sent.is_err() {
                break Err(SignalError::LinkDown);
            }
            let mailbox = state.mailbox(channel);
            if mailbox.acked || mailbox.take_queued_open() {
                break Ok(());
            }
            if mailbox.state == MailboxState::Closed {
                break Err(SignalError::Closed(channel));
            }
            if state.link_down {
                break Err(SignalError::LinkDown);
            }
            let (guard, live) = self.shared.wait(state, deadline);
            state = guard;
            if !live {
                break Err(SignalError::Timeout(timeout.unwrap_or_default()));
            }
        };

        let mailbox = state.mailbox(channel);
        mailbox.opening = false;
        mailbox.acked = false;
        if outcome.is_ok() {
            tracing::debug!(channel, "signal channel open");
        }
        outcome
    }

    fn close(&self, channel: u8) -> Result<()> {
        {
            let mut state = self.shared.lock();
            let mailbox = state.mailbox(channel);
            mailbox.state = MailboxState::Closed;
            mailbox.queue.clear();
        }
        self.shared.cond.notify_all();

        if let Err(err) = self.send(SignalMessage::close(channel)) {
            tracing::debug!(channel, error = %err, "close notification not delivered");
        }
        Ok(())
    }

    fn send(&self, msg: SignalMessage) -> Result<()> {
        tracing::trace!(%msg, "signal out");
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.send(&msg)
    }

    fn recv(&self, channel: u8, timeout: Option<Duration>) -> Result<SignalMessage> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();
        loop {
            let link_down = state.link_down;
            let mailbox = state.mailbox(channel);
            if mailbox.state == MailboxState::Closed {
                return Err(SignalError::Closed(channel));
            }
            if let Some(msg) = mailbox.queue.pop_front() {
                return Ok(msg);
            }
            if link_down {
                return Err(SignalError::LinkDown);
            }
            let (guard, live) = self.shared.wait(state, deadline);
            state = guard;
            if !live {
                return Err(SignalError::Timeout(timeout.unwrap_or_default()));
            }
        }
    }
}

impl Drop for SignalPort {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EVENT_BLOCK_RELEASE, EVENT_BLOCK_SEND};

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    fn open_both(a: &SignalPort, b: &SignalPort, channel: u8) {
        thread::scope(|scope| {
            let other = scope.spawn(|| b.open(channel, WAIT));
            a.open(channel, WAIT).expect("open a");
            other.join().expect("join").expect("open b");
        });
    }

    #[test]
    fn open_handshake_completes_on_both_sides() {
        let (a, b) = SignalPort::pair().expect("pair");
        open_both(&a, &b, 1);
        assert_eq!(a.pending(1), 0);
        assert_eq!(b.pending(1), 0);
    }

    #[test]
    fn open_after_peer_already_opened() {
        let (a, b) = SignalPort::pair().expect("pair");
        thread::scope(|scope| {
            let early = scope.spawn(|| a.open(2, WAIT));
            thread::sleep(Duration::from_millis(20));
            b.open(2, WAIT).expect("open b");
            early.join().expect("join").expect("open a");
        });
    }

    #[test]
    fn events_are_routed_per_channel() {
        let (a, b) = SignalPort::pair().expect("pair");
        open_both(&a, &b, 1);
        open_both(&a, &b, 2);

        a.send(SignalMessage::event(2, EVENT_BLOCK_RELEASE, 0))
            .expect("send");
        a.send(SignalMessage::event(1, EVENT_BLOCK_SEND, 0))
            .expect("send");

        let first = b.recv(1, WAIT).expect("recv 1");
        assert!(first.is_event(EVENT_BLOCK_SEND));
        let second = b.recv(2, WAIT).expect("recv 2");
        assert!(second.is_event(EVENT_BLOCK_RELEASE));
    }

    #[test]
    fn reopen_reaches_peer_recv() {
        let (a, b) = SignalPort::pair().expect("pair");
        open_both(&a, &b, 3);

        thread::scope(|scope| {
            let reopen = scope.spawn(|| a.open(3, WAIT));
            let msg = b.recv(3, WAIT).expect("recv open");
            assert_eq!(msg.kind, MessageKind::Open);
            b.open_ack(3).expect("ack");
            reopen.join().expect("join").expect("reopen");
        });
    }

    #[test]
    fn close_fails_blocked_recv() {
        let (a, b) = SignalPort::pair().expect("pair");
        open_both(&a, &b, 4);

        thread::scope(|scope| {
            let waiter = scope.spawn(|| b.recv(4, None));
            thread::sleep(Duration::from_millis(20));
            b.close(4).expect("close");
            let err = waiter.join().expect("join").unwrap_err();
            assert!(matches!(err, SignalError::Closed(4)));
        });

        // The peer sees the close notification.
        let msg = a.recv(4, WAIT).expect("recv close");
        assert_eq!(msg.kind, MessageKind::Close);
    }

    #[test]
    fn recv_times_out() {
        let (a, _b) = SignalPort::pair().expect("pair");
        let err = a.recv(9, Some(Duration::from_millis(10))).unwrap_err();
        assert!(matches!(err, SignalError::Timeout(_)));
    }

    #[test]
    fn dropped_peer_marks_link_down() {
        let (a, b) = SignalPort::pair().expect("pair");
        drop(b);
        let err = a.recv(1, WAIT).unwrap_err();
        assert!(matches!(err, SignalError::LinkDown));
        assert!(a.is_link_down());
    }
}
