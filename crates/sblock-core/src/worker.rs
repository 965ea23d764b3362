//! Per-channel event thread.
//!
//! Each channel (and each shared pool) owns one thread that opens its
//! signalling channel, drives the init exchange and turns peer events into
//! local wakeups and notifier calls.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sblock_shmem::PhysAddr;
use sblock_signal::{
    MessageKind, SignalError, SignalLink, SignalMessage, CMD_BLOCK_INIT, DONE_BLOCK_INIT,
    EVENT_BLOCK_RELEASE, EVENT_BLOCK_SEND,
};
use tracing::{debug, error, info, warn};

use crate::config::Role;
use crate::error::{BlockError, Result};

/// Pause after a failed receive before trying again.
const RECV_RETRY_DELAY: Duration = Duration::from_millis(5);

/// What the event thread drives.
pub(crate) trait ControlTarget: Send + Sync + 'static {
    fn label(&self) -> &'static str;
    fn peer_id(&self) -> u8;
    fn channel_id(&self) -> u8;
    fn role(&self) -> Role;
    fn realtime_priority(&self) -> Option<i32>;
    fn link(&self) -> &dyn SignalLink;
    fn is_ready(&self) -> bool;

    /// True exactly once, for the first init exchange.
    fn first_init(&self) -> bool;

    /// Reconcile shared state after the peer restarted.
    fn recover(&self);

    /// Leave Ready because the peer closed or the link dropped.
    fn go_idle(&self);

    /// Idle -> Ready. False if the target cannot become Ready.
    fn mark_ready(&self) -> bool;

    fn announce_open(&self);

    /// Base of the region this side exports (host only).
    fn region_base(&self) -> Option<PhysAddr>;

    /// Bind to the region the host announced (companion only).
    fn attach(&self, base: PhysAddr) -> Result<()>;

    fn on_send_event(&self);
    fn on_release_event(&self);
}

pub(crate) fn spawn<T: ControlTarget>(target: Arc<T>) -> Result<JoinHandle<()>> {
    let name = format!("sblock-{}-{}", target.peer_id(), target.channel_id());
    thread::Builder::new()
        .name(name)
        .spawn(move || run(target.as_ref()))
        .map_err(BlockError::Spawn)
}

fn run<T: ControlTarget>(target: &T) {
    let peer = target.peer_id();
    let channel = target.channel_id();

    if let Some(priority) = target.realtime_priority() {
        crate::sched::apply_realtime_priority(priority);
    }

    debug!(peer, channel, kind = target.label(), "event thread started");
    if let Err(err) = target.link().open(channel, None) {
        debug!(peer, channel, error = %err, "open abandoned");
        return;
    }
    debug!(peer, channel, "signalling channel open");
    if target.role() == Role::Companion {
        request_init(target);
    }

    loop {
        let msg = match target.link().recv(channel, None) {
            Ok(msg) => msg,
            Err(SignalError::Closed(_)) => break,
            Err(SignalError::LinkDown) => {
                warn!(peer, channel, "signalling link down");
                target.go_idle();
                break;
            }
            Err(err) => {
                warn!(peer, channel, error = %err, "receive failed");
                thread::sleep(RECV_RETRY_DELAY);
                continue;
            }
        };
        dispatch(target, msg);
    }
    debug!(peer, channel, "event thread exiting");
}

fn dispatch<T: ControlTarget>(target: &T, msg: SignalMessage) {
    let peer = target.peer_id();
    let channel = target.channel_id();

    match (msg.kind, target.role()) {
        (MessageKind::Open, role) => {
            // The peer restarted its side of the channel.
            if target.is_ready() {
                info!(peer, channel, "peer re-opened, recovering");
                target.recover();
            }
            if let Err(err) = target.link().open_ack(channel) {
                warn!(peer, channel, error = %err, "open ack failed");
            }
            if role == Role::Companion {
                request_init(target);
            }
        }
        (MessageKind::Close, _) => {
            if let Err(err) = target.link().close_ack(channel) {
                debug!(peer, channel, error = %err, "close ack failed");
            }
            target.go_idle();
        }
        (MessageKind::Command, Role::Host) if msg.flag == CMD_BLOCK_INIT => host_init(target),
        (MessageKind::Done, Role::Companion) if msg.flag == DONE_BLOCK_INIT => {
            companion_init(target, PhysAddr(msg.value));
        }
        (MessageKind::Event, _) if msg.flag == EVENT_BLOCK_SEND => target.on_send_event(),
        (MessageKind::Event, _) if msg.flag == EVENT_BLOCK_RELEASE => target.on_release_event(),
        _ => warn!(
            peer,
            channel,
            kind = msg.kind.name(),
            flag = msg.flag,
            value = msg.value,
            "unexpected message dropped"
        ),
    }
}

fn request_init<T: ControlTarget>(target: &T) {
    let msg = SignalMessage::command(target.channel_id(), CMD_BLOCK_INIT, 0);
    if let Err(err) = target.link().send(msg) {
        warn!(
            peer = target.peer_id(),
            channel = target.channel_id(),
            error = %err,
            "init request failed"
        );
    }
}

fn host_init<T: ControlTarget>(target: &T) {
    let peer = target.peer_id();
    let channel = target.channel_id();

    if !target.first_init() {
        info!(peer, channel, "peer re-initialised, recovering");
        target.recover();
    }
    if !target.mark_ready() {
        debug!(peer, channel, "init ignored");
        return;
    }
    let Some(base) = target.region_base() else {
        error!(peer, channel, "host has no region to announce");
        return;
    };
    let done = SignalMessage::done(channel, DONE_BLOCK_INIT, base.get());
    if let Err(err) = target.link().send(done) {
        warn!(peer, channel, error = %err, "init completion failed");
    }
    info!(peer, channel, kind = target.label(), base = %base, "ready");
    target.announce_open();
}

fn companion_init<T: ControlTarget>(target: &T, base: PhysAddr) {
    let peer = target.peer_id();
    let channel = target.channel_id();

    if let Err(err) = target.attach(base) {
        error!(peer, channel, base = %base, error = %err, "cannot attach to peer region");
        return;
    }
    if target.mark_ready() {
        info!(peer, channel, kind = target.label(), base = %base, "ready");
        target.announce_open();
    }
}
