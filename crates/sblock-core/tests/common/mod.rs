#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sblock_core::{
    ChannelConfig, ChannelEvent, ChannelHandle, ChannelState, Registry, SharedPool,
    SharedPoolConfig, Wait,
};
use sblock_shmem::PhysicalMemory;
use sblock_signal::{
    MessageKind, SignalError, SignalLink, SignalMessage, SignalPort, CMD_BLOCK_INIT,
    DONE_BLOCK_INIT,
};

pub const PEER: u8 = 1;
pub const SETTLE: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(150);

/// Host and companion registries wired to each other in one process.
pub struct Domains {
    pub host: Registry,
    pub companion: Registry,
}

pub fn domains() -> Domains {
    let (host_link, companion_link) = SignalPort::pair().expect("socketpair");
    let memory = Arc::new(PhysicalMemory::new());

    let host = Registry::new();
    host.attach_peer(PEER, Arc::new(host_link), memory.clone())
        .expect("attach host peer");
    let companion = Registry::new();
    companion
        .attach_peer(PEER, Arc::new(companion_link), memory)
        .expect("attach companion peer");
    Domains { host, companion }
}

/// Create `config` on the host and its mirror on the companion, then wait
/// for both to become Ready.
pub fn open_channel(domains: &Domains, config: ChannelConfig) -> (ChannelHandle, ChannelHandle) {
    let host = domains.host.create(config.clone()).expect("host create");
    let companion = domains
        .companion
        .create(config.mirrored())
        .expect("companion create");
    host.wait_ready(Wait::Timeout(SETTLE)).expect("host ready");
    companion
        .wait_ready(Wait::Timeout(SETTLE))
        .expect("companion ready");
    (host, companion)
}

pub fn open_shared_pool(domains: &Domains, config: SharedPoolConfig) -> (SharedPool, SharedPool) {
    let host = domains
        .host
        .create_shared_pool(config.clone())
        .expect("host shared pool");
    let companion = domains
        .companion
        .create_shared_pool(config.mirrored())
        .expect("companion shared pool");
    host.wait_ready(Wait::Timeout(SETTLE)).expect("host pool ready");
    companion
        .wait_ready(Wait::Timeout(SETTLE))
        .expect("companion pool ready");
    (host, companion)
}

/// Poll until `cond` holds or the settle time runs out.
pub fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + SETTLE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

pub fn wait_for_state(handle: &ChannelHandle, state: ChannelState) {
    eventually(&format!("{state} state"), || handle.state() == state);
}

/// Register a notifier that forwards every event into a channel.
pub fn record_events(handle: &ChannelHandle) -> Receiver<ChannelEvent> {
    let (tx, rx) = mpsc::channel();
    handle
        .register_notifier(move |event| {
            let _ = tx.send(event);
        })
        .expect("register notifier");
    rx
}

/// Host registry whose peer is driven by hand through the returned port.
pub fn host_with_raw_peer() -> (Registry, SignalPort) {
    let (host_link, raw) = SignalPort::pair().expect("socketpair");
    let host = Registry::new();
    host.attach_peer(PEER, Arc::new(host_link), Arc::new(PhysicalMemory::new()))
        .expect("attach peer");
    (host, raw)
}

/// Play the companion side of the open handshake and init exchange.
/// Returns the announced region base.
pub fn raw_init(raw: &SignalPort, channel: u8) -> u32 {
    raw.open(channel, Some(SETTLE)).expect("raw open");
    raw.send(SignalMessage::command(channel, CMD_BLOCK_INIT, 0))
        .expect("raw init");
    loop {
        let msg = raw.recv(channel, Some(SETTLE)).expect("init done");
        if msg.kind == MessageKind::Done && msg.flag == DONE_BLOCK_INIT {
            return msg.value;
        }
    }
}

/// Collect every message arriving on `channel` until it stays quiet.
pub fn drain(raw: &SignalPort, channel: u8) -> Vec<SignalMessage> {
    let mut messages = Vec::new();
    loop {
        match raw.recv(channel, Some(QUIET)) {
            Ok(msg) => messages.push(msg),
            Err(SignalError::Timeout(_)) => return messages,
            Err(err) => panic!("raw receive failed: {err}"),
        }
    }
}
