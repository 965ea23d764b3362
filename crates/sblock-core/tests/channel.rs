mod common;

use std::thread;
use std::time::Duration;

use common::{
    domains, drain, eventually, host_with_raw_peer, open_channel, raw_init, record_events,
    wait_for_state, PEER, SETTLE,
};
use sblock_core::{
    BlockError, ChannelConfig, ChannelEvent, ChannelState, Direction, NotifierPolicy, Wait,
};
use sblock_signal::{MessageKind, EVENT_BLOCK_SEND};

fn config(channel: u8) -> ChannelConfig {
    ChannelConfig::new(PEER, channel)
        .with_tx(128, 4)
        .with_rx(128, 4)
}

#[test]
fn operations_before_ready_report_not_ready() {
    let (host, _raw) = host_with_raw_peer();
    let handle = host.create(config(1)).expect("create");
    assert_eq!(handle.state(), ChannelState::Idle);
    assert!(matches!(handle.get(Wait::NoWait), Err(BlockError::NotReady)));
    assert!(matches!(handle.receive(Wait::NoWait), Err(BlockError::NotReady)));
    assert!(matches!(handle.send_finish(), Err(BlockError::NotReady)));
    assert!(matches!(
        handle.wait_ready(Wait::Timeout(Duration::from_millis(20))),
        Err(BlockError::DeadlineExceeded(_))
    ));
}

#[test]
fn tx_pool_drains_then_reports_empty() {
    let domains = domains();
    let (host, _companion) = open_channel(&domains, config(1));

    let blocks: Vec<_> = (0..4)
        .map(|_| host.get(Wait::NoWait).expect("free block"))
        .collect();
    assert!(blocks.iter().all(|block| block.capacity() == 128));
    assert!(matches!(host.get(Wait::NoWait), Err(BlockError::Empty)));
    assert_eq!(host.free_count(), 0);
}

#[test]
fn send_delivers_content_with_one_notification() {
    let (host_registry, raw) = host_with_raw_peer();
    let host = host_registry.create(config(2)).expect("create");
    raw_init(&raw, 2);
    host.wait_ready(Wait::Timeout(SETTLE)).expect("ready");

    let mut block = host.get(Wait::NoWait).expect("get");
    block.write(&[0xA5; 128]).expect("fill");
    host.send(block).expect("send");

    let snapshot = host.snapshot();
    assert_eq!(snapshot.queue("ring-tx").expect("ring-tx").occupancy, 1);
    let events: Vec<_> = drain(&raw, 2)
        .into_iter()
        .filter(|msg| msg.kind == MessageKind::Event)
        .collect();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_event(EVENT_BLOCK_SEND));
}

#[test]
fn peer_receives_identical_block() {
    let domains = domains();
    let (host, companion) = open_channel(&domains, config(3));

    let payload: Vec<u8> = (0..128).map(|i| i as u8).collect();
    let mut block = host.get(Wait::NoWait).expect("get");
    block.write(&payload).expect("fill");
    host.send(block).expect("send");

    let received = companion
        .receive(Wait::Timeout(SETTLE))
        .expect("receive");
    assert_eq!(received.len(), 128);
    assert_eq!(received.as_slice(), payload.as_slice());
    assert_eq!(received.direction(), Direction::Rx);

    companion.release(received).expect("release");
    eventually("block back in host pool", || host.free_count() == 4);
}

#[test]
fn ring_is_fifo() {
    let domains = domains();
    let (host, companion) = open_channel(&domains, config(4));

    for tag in [b"b1", b"b2"] {
        let mut block = host.get(Wait::NoWait).expect("get");
        block.write(tag).expect("write");
        host.send(block).expect("send");
    }
    let first = companion.receive(Wait::Timeout(SETTLE)).expect("first");
    let second = companion.receive(Wait::Timeout(SETTLE)).expect("second");
    assert_eq!(first.as_slice(), b"b1");
    assert_eq!(second.as_slice(), b"b2");
}

#[test]
fn put_returns_block_without_notifying() {
    let (host_registry, raw) = host_with_raw_peer();
    let host = host_registry.create(config(5)).expect("create");
    raw_init(&raw, 5);
    host.wait_ready(Wait::Timeout(SETTLE)).expect("ready");

    let before = host.free_count();
    let _first = host.get(Wait::NoWait).expect("get");
    let second = host.get(Wait::NoWait).expect("get");
    let index = second.index();
    host.put(second).expect("put");
    assert_eq!(host.free_count(), before - 1);

    // Give-back is LIFO: the block just returned comes out next.
    let again = host.get(Wait::NoWait).expect("get");
    assert_eq!(again.index(), index);
    assert!(drain(&raw, 5).is_empty());
}

#[test]
fn batched_sends_notify_once() {
    let (host_registry, raw) = host_with_raw_peer();
    let host = host_registry.create(config(6)).expect("create");
    raw_init(&raw, 6);
    host.wait_ready(Wait::Timeout(SETTLE)).expect("ready");

    for _ in 0..3 {
        let block = host.get(Wait::NoWait).expect("get");
        host.send_prepare(block).expect("prepare");
    }
    assert!(drain(&raw, 6).is_empty());
    host.send_finish().expect("finish");

    let messages = drain(&raw, 6);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_event(EVENT_BLOCK_SEND));
    assert_eq!(host.snapshot().queue("ring-tx").expect("ring-tx").occupancy, 3);
}

#[test]
fn release_notifies_only_on_refill_edge() {
    let domains = domains();
    let (host, companion) = open_channel(&domains, config(7));
    let host_events = record_events(&host);
    assert_eq!(
        host_events.recv_timeout(SETTLE).expect("open"),
        ChannelEvent::Open
    );

    for _ in 0..4 {
        let block = host.get(Wait::NoWait).expect("get");
        host.send_prepare(block).expect("prepare");
    }
    host.send_finish().expect("finish");
    eventually("blocks arrived", || companion.arrived_count() == 4);

    for _ in 0..4 {
        let block = companion.receive(Wait::NoWait).expect("receive");
        companion.release(block).expect("release");
    }
    assert_eq!(
        host_events.recv_timeout(SETTLE).expect("get event"),
        ChannelEvent::Get
    );
    assert!(host_events.recv_timeout(common::QUIET).is_err());
    assert_eq!(host.free_count(), 4);
}

#[test]
fn blocked_getter_woken_by_release() {
    let domains = domains();
    let (host, companion) = open_channel(&domains, config(8).with_tx(128, 1));

    let held = host.get(Wait::NoWait).expect("only block");
    let waiter = {
        let host = host.clone();
        thread::spawn(move || host.get(Wait::Forever))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    host.send(held).expect("send");
    let block = companion.receive(Wait::Timeout(SETTLE)).expect("receive");
    companion.release(block).expect("release");

    let block = waiter.join().expect("join").expect("woken getter");
    assert_eq!(block.index(), 0);
}

#[test]
fn concurrent_getters_split_one_block() {
    let domains = domains();
    let (host, _companion) = open_channel(&domains, config(9).with_tx(128, 1));

    let getters: Vec<_> = (0..2)
        .map(|_| {
            let host = host.clone();
            thread::spawn(move || host.get(Wait::Forever))
        })
        .collect();
    eventually("one getter served", || {
        getters.iter().filter(|getter| getter.is_finished()).count() == 1
    });
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        getters.iter().filter(|getter| getter.is_finished()).count(),
        1
    );

    domains.host.destroy(&host).expect("destroy");
    let results: Vec<_> = getters
        .into_iter()
        .map(|getter| getter.join().expect("join"))
        .collect();
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|result| matches!(result, Err(BlockError::TornDown))));
}

#[test]
fn bounded_receive_expires() {
    let domains = domains();
    let (_host, companion) = open_channel(&domains, config(10));
    let err = companion
        .receive(Wait::from_millis(30))
        .expect_err("nothing sent");
    assert!(matches!(err, BlockError::DeadlineExceeded(_)));
    assert!(err.is_transient());
    assert!(matches!(
        companion.receive(Wait::from_millis(0)),
        Err(BlockError::Empty)
    ));
}

#[test]
fn interrupt_wakes_blocked_receiver() {
    let domains = domains();
    let (_host, companion) = open_channel(&domains, config(11));
    let receiver = {
        let companion = companion.clone();
        thread::spawn(move || companion.receive(Wait::Forever))
    };
    while !receiver.is_finished() {
        companion.interrupt();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(matches!(
        receiver.join().expect("join"),
        Err(BlockError::Interrupted)
    ));
}

#[test]
fn peer_close_tears_down_waiters() {
    let domains = domains();
    let (host, companion) = open_channel(&domains, config(12));
    let events = record_events(&host);
    assert_eq!(events.recv_timeout(SETTLE).expect("open"), ChannelEvent::Open);

    let receiver = {
        let host = host.clone();
        thread::spawn(move || host.receive(Wait::Forever))
    };
    thread::sleep(Duration::from_millis(20));
    domains.companion.destroy(&companion).expect("destroy companion");

    // TornDown if the receiver was already waiting, NotReady if it was not.
    assert!(matches!(
        receiver.join().expect("join"),
        Err(BlockError::TornDown | BlockError::NotReady)
    ));
    wait_for_state(&host, ChannelState::Idle);
    assert_eq!(events.recv_timeout(SETTLE).expect("close"), ChannelEvent::Close);
}

#[test]
fn strict_notifier_rejects_second_registration() {
    let domains = domains();
    let (host, _companion) = open_channel(&domains, config(13));
    host.register_notifier(|_| {}).expect("first");
    assert!(matches!(
        host.register_notifier(|_| {}),
        Err(BlockError::NotifierRegistered)
    ));
}

#[test]
fn replace_policy_swaps_notifier() {
    let domains = domains();
    let (host, _companion) = open_channel(
        &domains,
        config(14).with_notifier_policy(NotifierPolicy::Replace),
    );
    host.register_notifier(|_| {}).expect("first");
    let events = record_events(&host);
    assert_eq!(events.recv_timeout(SETTLE).expect("open"), ChannelEvent::Open);
}

#[test]
fn late_notifier_sees_open_and_pending_arrivals() {
    let domains = domains();
    let (host, companion) = open_channel(&domains, config(15));
    let block = host.get(Wait::NoWait).expect("get");
    host.send(block).expect("send");
    eventually("arrival", || companion.arrived_count() == 1);

    let events = record_events(&companion);
    let seen: Vec<_> = std::iter::from_fn(|| events.recv_timeout(common::QUIET).ok()).collect();
    assert!(seen.contains(&ChannelEvent::Open));
    assert!(seen.contains(&ChannelEvent::Receive));
}

#[test]
fn rejected_block_is_handed_back() {
    let domains = domains();
    let (host, companion) = open_channel(&domains, config(16));

    let block = host.get(Wait::NoWait).expect("get");
    host.send(block).expect("send");
    let received = companion.receive(Wait::Timeout(SETTLE)).expect("receive");

    // A received block cannot be sent back on the transmit path.
    let rejected = companion.send(received).expect_err("wrong direction");
    assert!(matches!(rejected.error, BlockError::InvalidBlock(_)));
    let received = rejected.into_block();
    companion.release(received).expect("release");

    let (other_host, _other_companion) = open_channel(&domains, config(17));
    let foreign = other_host.get(Wait::NoWait).expect("get");
    let rejected = host.put(foreign).expect_err("foreign block");
    other_host.put(rejected.into_block()).expect("home channel");
}
