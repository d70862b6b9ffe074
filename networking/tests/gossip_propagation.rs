//! Epidemic propagation: loop suppression and the hop cap.

mod common;

use std::time::Duration;

use common::{expect_kind, expect_silence, start_listening_node};
use protocol::{MessageBody, MessageKind};

#[tokio::test]
async fn ring_broadcast_is_delivered_once_per_node() {
    // Ring topology: a-b, b-c, c-a.
    let a = start_listening_node().await;
    let b = start_listening_node().await;
    let c = start_listening_node().await;

    assert!(a.connect(b.contact()).await.unwrap());
    assert!(b.connect(c.contact()).await.unwrap());
    assert!(c.connect(a.contact()).await.unwrap());

    let mut observer_b = b.subscribe();
    let mut observer_c = c.subscribe();

    let accepted = a.broadcast("hello", "greeting", None).await.unwrap();
    assert_eq!(accepted, 2, "a should reach both ring neighbours directly");

    let at_b = expect_kind(&mut observer_b, MessageKind::Broadcast, Duration::from_secs(2)).await;
    let at_c = expect_kind(&mut observer_c, MessageKind::Broadcast, Duration::from_secs(2)).await;
    assert_eq!(at_b.message.payload, "hello");
    assert_eq!(at_c.message.payload, "hello");
    assert_eq!(at_b.message.sender, *a.local_id());

    match &at_b.message.body {
        MessageBody::Broadcast { seen_by, .. } => {
            assert!(seen_by.contains(a.local_id()));
        }
        other => panic!("unexpected body: {other:?}"),
    }

    // Let several gossip ticks run; dedup and seen_by suppression must keep
    // every copy after the first from surfacing again.
    expect_silence(&mut observer_b, MessageKind::Broadcast, Duration::from_millis(600)).await;
    expect_silence(&mut observer_c, MessageKind::Broadcast, Duration::from_millis(600)).await;

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn hop_cap_stops_the_line() {
    // Line topology: a-b-c-d.
    let a = start_listening_node().await;
    let b = start_listening_node().await;
    let c = start_listening_node().await;
    let d = start_listening_node().await;

    assert!(a.connect(b.contact()).await.unwrap());
    assert!(b.connect(c.contact()).await.unwrap());
    assert!(c.connect(d.contact()).await.unwrap());

    let mut observer_c = c.subscribe();
    let mut observer_d = d.subscribe();

    // One hop allowed: b may forward, c must stop.
    let accepted = a.broadcast("short fuse", "test", Some(1)).await.unwrap();
    assert_eq!(accepted, 1);

    let at_c = expect_kind(&mut observer_c, MessageKind::Broadcast, Duration::from_secs(3)).await;
    match &at_c.message.body {
        MessageBody::Broadcast {
            current_hops,
            max_hops,
            seen_by,
        } => {
            assert_eq!(*max_hops, 1);
            assert_eq!(*current_hops, 1);
            assert!(seen_by.contains(b.local_id()));
        }
        other => panic!("unexpected body: {other:?}"),
    }

    // c received the record at the hop cap and must not forward to d.
    expect_silence(&mut observer_d, MessageKind::Broadcast, Duration::from_millis(800)).await;
    assert_eq!(d.stats().messages_received, 0);

    for node in [&a, &b, &c, &d] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn disabled_auto_propagation_still_reaches_neighbours() {
    let mut config_a = common::fast_config();
    config_a.gossip.enable_auto_propagation = false;
    let a = common::start_node(config_a).await;

    let mut config_b = common::fast_config();
    config_b.gossip.enable_auto_propagation = false;
    let b = common::start_node(config_b).await;

    let mut config_c = common::fast_config();
    config_c.gossip.enable_auto_propagation = false;
    let c = common::start_node(config_c).await;

    // Line a-b-c: the immediate send still reaches b, but b never forwards.
    assert!(a.connect(b.contact()).await.unwrap());
    assert!(b.connect(c.contact()).await.unwrap());

    let mut observer_b = b.subscribe();
    let mut observer_c = c.subscribe();

    assert_eq!(a.broadcast("no relay", "test", None).await.unwrap(), 1);
    expect_kind(&mut observer_b, MessageKind::Broadcast, Duration::from_secs(2)).await;
    expect_silence(&mut observer_c, MessageKind::Broadcast, Duration::from_millis(600)).await;

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
}
