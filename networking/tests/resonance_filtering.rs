//! Resonance dispatch through the matcher and the extension registry.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{expect_kind, start_listening_node};
use networking::{Extension, NodeHandle};
use protocol::{Message, MessageKind, NodeId};

/// Test double recording which records reached `handle_message`.
struct Recorder {
    id: &'static str,
    kinds: Vec<MessageKind>,
    initialized: AtomicUsize,
    handled: AtomicUsize,
    cleaned: AtomicUsize,
    fail_handling: bool,
}

impl Recorder {
    fn new(id: &'static str, kinds: Vec<MessageKind>) -> Arc<Self> {
        Arc::new(Recorder {
            id,
            kinds,
            initialized: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
            cleaned: AtomicUsize::new(0),
            fail_handling: false,
        })
    }

    fn failing(id: &'static str, kinds: Vec<MessageKind>) -> Arc<Self> {
        Arc::new(Recorder {
            id,
            kinds,
            initialized: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
            cleaned: AtomicUsize::new(0),
            fail_handling: true,
        })
    }
}

#[async_trait]
impl Extension for Recorder {
    fn id(&self) -> &str {
        self.id
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn supported_kinds(&self) -> Vec<MessageKind> {
        self.kinds.clone()
    }

    async fn initialize(&self, node: NodeHandle) -> anyhow::Result<()> {
        node.local_id()?;
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_message(&self, _message: &Message, _from: &NodeId) -> anyhow::Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        if self.fail_handling {
            anyhow::bail!("synthetic handler failure");
        }
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn weak_resonance_is_filtered_strong_is_dispatched() {
    let a = start_listening_node().await;
    let b = start_listening_node().await;
    assert!(a.connect(b.contact()).await.unwrap());

    let recorder = Recorder::new("miner", vec![MessageKind::Resonance]);
    b.register_extension(recorder.clone()).await.unwrap();
    assert_eq!(recorder.initialized.load(Ordering::SeqCst), 1);

    let mut observer_b = b.subscribe();

    // Below the default 0.5 threshold: observed, but never dispatched.
    assert_eq!(a.resonate("mining:coord", 0.4).await.unwrap(), 1);
    expect_kind(&mut observer_b, MessageKind::Resonance, Duration::from_secs(2)).await;
    assert_eq!(recorder.handled.load(Ordering::SeqCst), 0);

    // Above the threshold: dispatched exactly once.
    assert_eq!(a.resonate("mining:coord", 0.9).await.unwrap(), 1);
    expect_kind(&mut observer_b, MessageKind::Resonance, Duration::from_secs(2)).await;
    assert_eq!(recorder.handled.load(Ordering::SeqCst), 1);

    a.shutdown().await;
    b.shutdown().await;
    assert_eq!(recorder.cleaned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn extension_failure_does_not_stall_the_pipeline() {
    let a = start_listening_node().await;
    let b = start_listening_node().await;
    assert!(a.connect(b.contact()).await.unwrap());

    let flaky = Recorder::failing("flaky", vec![MessageKind::Whisper]);
    let steady = Recorder::new("steady", vec![MessageKind::Whisper]);
    b.register_extension(flaky.clone()).await.unwrap();
    b.register_extension(steady.clone()).await.unwrap();

    let mut observer_b = b.subscribe();
    assert!(a.whisper(b.local_id(), "first", "test").await.unwrap());
    expect_kind(&mut observer_b, MessageKind::Whisper, Duration::from_secs(2)).await;

    // The failing handler ran, and the one after it still ran.
    assert_eq!(flaky.handled.load(Ordering::SeqCst), 1);
    assert_eq!(steady.handled.load(Ordering::SeqCst), 1);

    // A second message keeps flowing.
    assert!(a.whisper(b.local_id(), "second", "test").await.unwrap());
    expect_kind(&mut observer_b, MessageKind::Whisper, Duration::from_secs(2)).await;
    assert_eq!(steady.handled.load(Ordering::SeqCst), 2);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn duplicate_extension_id_is_rejected() {
    let node = start_listening_node().await;

    node.register_extension(Recorder::new("fs", vec![MessageKind::FileSync]))
        .await
        .unwrap();
    let result = node
        .register_extension(Recorder::new("fs", vec![MessageKind::Dreamspace]))
        .await;
    assert!(result.is_err());

    node.unregister_extension("fs").await.unwrap();
    assert!(node.unregister_extension("fs").await.is_err());

    node.shutdown().await;
}

#[tokio::test]
async fn unsupported_kind_is_not_dispatched() {
    let a = start_listening_node().await;
    let b = start_listening_node().await;
    assert!(a.connect(b.contact()).await.unwrap());

    let recorder = Recorder::new("files-only", vec![MessageKind::FileSync]);
    b.register_extension(recorder.clone()).await.unwrap();

    let mut observer_b = b.subscribe();
    assert!(a.whisper(b.local_id(), "not for you", "test").await.unwrap());
    expect_kind(&mut observer_b, MessageKind::Whisper, Duration::from_secs(2)).await;
    assert_eq!(recorder.handled.load(Ordering::SeqCst), 0);

    a.shutdown().await;
    b.shutdown().await;
}
