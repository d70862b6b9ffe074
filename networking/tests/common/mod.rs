//! Shared helpers for the end-to-end overlay tests.
#![allow(dead_code)]

use std::time::Duration;

use networking::{NetworkConfig, Node, ObservedMessage};
use protocol::MessageKind;
use tokio::sync::broadcast;

/// Config tuned for tests: local listener, fast ticks, quiet heartbeats.
pub fn fast_config() -> NetworkConfig {
    let mut config = NetworkConfig::default()
        .with_direct_listen("127.0.0.1:0".parse().unwrap())
        .with_heartbeat_interval_ms(60_000)
        .with_gossip_interval_ms(100);
    config.connection.timeout_ms = 2_000;
    config
}

/// Build and start a node with the given config.
pub async fn start_node(config: NetworkConfig) -> Node {
    let node = Node::new(config).expect("node assembly");
    node.start().await.expect("node start");
    node
}

/// Build and start a listening node with fast test timings.
pub async fn start_listening_node() -> Node {
    start_node(fast_config()).await
}

/// Wait for the next observed message of a kind, ignoring others.
pub async fn expect_kind(
    observer: &mut broadcast::Receiver<ObservedMessage>,
    kind: MessageKind,
    timeout: Duration,
) -> ObservedMessage {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("no {kind} observed within {timeout:?}"));
        match tokio::time::timeout(remaining, observer.recv()).await {
            Ok(Ok(observed)) if observed.message.kind() == kind => return observed,
            Ok(Ok(_)) => continue,
            Ok(Err(err)) => panic!("observer channel closed: {err}"),
            Err(_) => panic!("no {kind} observed within {timeout:?}"),
        }
    }
}

/// Assert that no message of a kind arrives within the window.
pub async fn expect_silence(
    observer: &mut broadcast::Receiver<ObservedMessage>,
    kind: MessageKind,
    window: Duration,
) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = match deadline.checked_duration_since(tokio::time::Instant::now()) {
            Some(remaining) => remaining,
            None => return,
        };
        match tokio::time::timeout(remaining, observer.recv()).await {
            Ok(Ok(observed)) if observed.message.kind() == kind => {
                panic!("unexpected {kind} message: {:?}", observed.message)
            }
            Ok(Ok(_)) => continue,
            Ok(Err(_)) | Err(_) => return,
        }
    }
}
