mod common;

use common::{
    domains, host_with_raw_peer, open_channel, raw_init, record_events, wait_for_state, PEER,
    SETTLE,
};
use sblock_core::{BlockError, ChannelConfig, ChannelEvent, ChannelState, Wait};
use sblock_signal::SignalLink;

fn config(channel: u8) -> ChannelConfig {
    ChannelConfig::new(PEER, channel)
        .with_tx(128, 4)
        .with_rx(128, 4)
}

#[test]
fn peer_restart_reclaims_everything_not_on_loan() {
    let (host_registry, raw) = host_with_raw_peer();
    let host = host_registry.create(config(1)).expect("create");
    let base = raw_init(&raw, 1);
    host.wait_ready(Wait::Timeout(SETTLE)).expect("ready");
    let events = record_events(&host);
    assert_eq!(events.recv_timeout(SETTLE).expect("open"), ChannelEvent::Open);

    // Two blocks on loan, two handed to the peer and never returned.
    let held: Vec<_> = (0..2)
        .map(|_| host.get(Wait::NoWait).expect("get"))
        .collect();
    for _ in 0..2 {
        let block = host.get(Wait::NoWait).expect("get");
        host.send(block).expect("send");
    }
    assert_eq!(host.free_count(), 0);

    // The peer comes back: fresh open handshake, then init again.
    let again = raw_init(&raw, 1);
    assert_eq!(again, base);
    host.wait_ready(Wait::Timeout(SETTLE)).expect("ready again");
    assert_eq!(events.recv_timeout(SETTLE).expect("close"), ChannelEvent::Close);

    assert_eq!(host.free_count(), 2);
    let snapshot = host.snapshot();
    assert_eq!(snapshot.queue("ring-tx").expect("ring-tx").occupancy, 0);
    assert_eq!(snapshot.pending_tx, 2);
    // Re-Open and the second Init both signal the restart; the report must
    // still describe the rings as the reset found them.
    let report = snapshot.last_recovery.expect("recovery ran");
    assert_eq!(report.discarded_tx, 2);
    assert_eq!(report.discarded_rx, 0);
    assert_eq!(report.pool_tx, 2);
    assert_eq!(report.on_loan_tx, 2);

    let _a = host.get(Wait::NoWait).expect("first reclaimed");
    let _b = host.get(Wait::NoWait).expect("second reclaimed");
    assert!(matches!(host.get(Wait::NoWait), Err(BlockError::Empty)));

    // Blocks that stayed on loan through the reset can still come home.
    for block in held {
        host.put(block).expect("put after recovery");
    }
    assert_eq!(host.free_count(), 2);
}

#[test]
fn blocked_waiters_see_teardown_on_reset() {
    let (host_registry, raw) = host_with_raw_peer();
    let host = host_registry.create(config(2)).expect("create");
    raw_init(&raw, 2);
    host.wait_ready(Wait::Timeout(SETTLE)).expect("ready");

    let receiver = {
        let host = host.clone();
        std::thread::spawn(move || host.receive(Wait::Forever))
    };
    std::thread::sleep(std::time::Duration::from_millis(20));
    raw.open(2, Some(SETTLE)).expect("re-open");

    assert!(matches!(
        receiver.join().expect("join"),
        Err(BlockError::TornDown | BlockError::NotReady)
    ));
    wait_for_state(&host, ChannelState::Idle);
}

#[test]
fn companion_recreate_recovers_host() {
    let domains = domains();
    let (host, companion) = open_channel(&domains, config(3));

    let held = host.get(Wait::NoWait).expect("held");
    let sent = host.get(Wait::NoWait).expect("sent");
    host.send(sent).expect("send");
    common::eventually("arrival", || companion.arrived_count() == 1);

    // Companion side restarts the channel without draining it.
    domains.companion.destroy(&companion).expect("destroy companion");
    wait_for_state(&host, ChannelState::Idle);
    let companion = domains
        .companion
        .create(config(3).mirrored())
        .expect("re-create companion");
    host.wait_ready(Wait::Timeout(SETTLE)).expect("host ready");
    companion
        .wait_ready(Wait::Timeout(SETTLE))
        .expect("companion ready");

    let report = host.snapshot().last_recovery.expect("recovered");
    assert_eq!(report.discarded_tx, 1);
    assert_eq!(report.on_loan_tx, 1);
    assert_eq!(host.free_count(), 3);
    assert_eq!(companion.arrived_count(), 0);

    // The restarted channel carries traffic again.
    let mut block = host.get(Wait::NoWait).expect("get");
    block.write(b"after").expect("write");
    host.send(block).expect("send");
    let received = companion.receive(Wait::Timeout(SETTLE)).expect("receive");
    assert_eq!(received.as_slice(), b"after");
    host.put(held).expect("held block returns");
}

#[test]
fn companion_restart_discards_unread_arrivals() {
    let domains = domains();
    let (host, companion) = open_channel(&domains, config(5));

    for tag in [b"r1", b"r2", b"r3"] {
        let mut block = companion.get(Wait::NoWait).expect("companion get");
        block.write(tag).expect("write");
        companion.send(block).expect("companion send");
    }
    common::eventually("arrivals", || host.arrived_count() == 3);
    let kept = host.receive(Wait::NoWait).expect("receive one");
    assert_eq!(kept.as_slice(), b"r1");

    domains.companion.destroy(&companion).expect("destroy companion");
    wait_for_state(&host, ChannelState::Idle);
    let companion = domains
        .companion
        .create(config(5).mirrored())
        .expect("re-create companion");
    host.wait_ready(Wait::Timeout(SETTLE)).expect("host ready");
    companion
        .wait_ready(Wait::Timeout(SETTLE))
        .expect("companion ready");

    let report = host.snapshot().last_recovery.expect("recovered");
    assert_eq!(report.discarded_rx, 2);
    assert_eq!(report.discarded_tx, 0);
    assert_eq!(report.on_loan_rx, 1);
    assert_eq!(report.pool_rx, 3);
    assert_eq!(host.arrived_count(), 0);
    assert!(matches!(host.receive(Wait::NoWait), Err(BlockError::Empty)));

    host.release(kept).expect("kept block returns");
}

#[test]
fn received_block_returns_after_host_destroy() {
    let domains = domains();
    let (host, companion) = open_channel(&domains, config(4));

    // Companion holds one received block and has returned another.
    for _ in 0..2 {
        let block = host.get(Wait::NoWait).expect("get");
        host.send(block).expect("send");
    }
    let keep = companion.receive(Wait::Timeout(SETTLE)).expect("keep");
    let back = companion.receive(Wait::Timeout(SETTLE)).expect("back");
    companion.release(back).expect("release");
    common::eventually("release seen", || host.free_count() == 3);

    domains.host.destroy(&host).expect("destroy host");
    wait_for_state(&companion, ChannelState::Idle);
    companion.release(keep).expect("release while idle");
    assert!(matches!(
        companion.receive(Wait::NoWait),
        Err(BlockError::NotReady)
    ));
}
