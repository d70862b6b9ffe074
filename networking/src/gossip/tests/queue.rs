use pretty_assertions::assert_eq;
use protocol::{Message, MessageOptions, NodeId};

use crate::gossip::GossipQueue;

fn broadcast_at(timestamp: u64, ttl: u64) -> Message {
    let sender = NodeId::generate_at(timestamp).unwrap();
    let options = MessageOptions {
        ttl_ms: Some(ttl),
        ..Default::default()
    };
    Message::construct_at(
        protocol::MessageBody::Broadcast {
            max_hops: 10,
            current_hops: 0,
            seen_by: vec![sender.clone()],
        },
        sender,
        "",
        options,
        timestamp,
    )
    .unwrap()
}

#[test]
fn fifo_order() {
    let mut queue = GossipQueue::new(8);
    let first = broadcast_at(1, 1_000);
    let second = broadcast_at(2, 1_000);
    queue.push(first.clone());
    queue.push(second.clone());

    assert_eq!(queue.pop_unexpired(10), Some(first));
    assert_eq!(queue.pop_unexpired(10), Some(second));
    assert_eq!(queue.pop_unexpired(10), None);
}

#[test]
fn overflow_drops_oldest() {
    let mut queue = GossipQueue::new(2);
    let first = broadcast_at(1, 1_000);
    queue.push(first.clone());
    queue.push(broadcast_at(2, 1_000));

    let displaced = queue.push(broadcast_at(3, 1_000));
    assert_eq!(displaced, Some(first));
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.dropped_overflow(), 1);
}

#[test]
fn expired_entries_are_dropped_at_dequeue() {
    let mut queue = GossipQueue::new(8);
    queue.push(broadcast_at(0, 100));
    queue.push(broadcast_at(0, 100));
    let alive = broadcast_at(400, 1_000);
    queue.push(alive.clone());

    // Both stale entries in front are skipped in one call.
    assert_eq!(queue.pop_unexpired(500), Some(alive));
    assert_eq!(queue.dropped_expired(), 2);
    assert!(queue.is_empty());
}
