//! The gossip/resonance orchestrator: the public face of the overlay.
//!
//! A [`Node`] owns the dedup table, the gossip queue and the extension
//! registry, drives the incoming message pipeline off the connection
//! manager's event stream, and runs the periodic propagation tick.
//! Extensions get a [`NodeHandle`] holding only a weak back-reference, so
//! handler tasks never keep the orchestrator alive.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use protocol::{KeyPair, Message, MessageBody, MessageKind, MessageOptions, NodeId, PublicKey, now_ms};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use metrics::SharedMetrics;

use crate::config::NetworkConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::extensions::{Extension, ExtensionRegistry};
use crate::gossip::{DedupCache, GossipQueue};
use crate::matcher::{ResonanceMatcher, StrengthThreshold};
use crate::peers::PeerManager;
use crate::types::{PeerContact, PeerEvent, PeerInfo};

/// Peers receiving each gossip fan-out, chosen uniformly at random.
const GOSSIP_FANOUT: usize = 3;

/// Capacity of the observer broadcast channel; laggards miss events rather
/// than blocking the pipeline.
const OBSERVER_CAPACITY: usize = 256;

/// A record as seen by observers, after decryption and dedup.
#[derive(Debug, Clone)]
pub struct ObservedMessage {
    pub message: Message,
    pub from: NodeId,
}

/// Counters snapshot returned by [`Node::stats`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeStats {
    pub connected_peers: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub average_latency_ms: f64,
    pub uptime_ms: u64,
    pub active_extensions: usize,
    /// Forwarded ÷ enqueued; 1.0 until anything is enqueued.
    pub gossip_efficiency: f64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    enqueued: AtomicU64,
    forwarded: AtomicU64,
    dropped_expired: AtomicU64,
    dropped_invalid: AtomicU64,
    dropped_duplicate: AtomicU64,
}

struct NodeInner {
    local_id: NodeId,
    config: NetworkConfig,
    manager: PeerManager,
    dedup: Mutex<DedupCache>,
    queue: Mutex<GossipQueue>,
    registry: Mutex<ExtensionRegistry>,
    matcher: Box<dyn ResonanceMatcher>,
    observers: broadcast::Sender<ObservedMessage>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    counters: Counters,
    started_at: AtomicU64,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: Option<SharedMetrics>,
}

/// Builder for a [`Node`]; the matcher and metrics hooks are optional.
pub struct NodeBuilder {
    config: NetworkConfig,
    matcher: Box<dyn ResonanceMatcher>,
    metrics: Option<SharedMetrics>,
}

impl NodeBuilder {
    pub fn matcher(mut self, matcher: Box<dyn ResonanceMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Generate the session identity and assemble the orchestrator.
    ///
    /// Fails only on OS RNG failure, which aborts start-up.
    pub fn build(self) -> NetworkResult<Node> {
        let local_id = NodeId::generate()
            .map_err(|err| NetworkError::Fatal(err.to_string()))?;
        let keys = KeyPair::generate()
            .map_err(|err| NetworkError::Fatal(err.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = PeerManager::new(
            local_id.clone(),
            keys,
            self.config.clone(),
            events_tx,
        );
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);

        Ok(Node {
            inner: Arc::new(NodeInner {
                local_id,
                dedup: Mutex::new(DedupCache::new(self.config.gossip.message_ttl_ms)),
                queue: Mutex::new(GossipQueue::new(self.config.gossip.max_queue)),
                config: self.config,
                manager,
                registry: Mutex::new(ExtensionRegistry::new()),
                matcher: self.matcher,
                observers,
                events: Mutex::new(Some(events_rx)),
                counters: Counters::default(),
                started_at: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                metrics: self.metrics,
            }),
        })
    }
}

/// One overlay participant.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn builder(config: NetworkConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            matcher: Box::new(StrengthThreshold::default()),
            metrics: None,
        }
    }

    pub fn new(config: NetworkConfig) -> NetworkResult<Self> {
        Self::builder(config).build()
    }

    pub fn local_id(&self) -> &NodeId {
        &self.inner.local_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.manager.public_key()
    }

    /// This node's own introduction record, for handing to other nodes.
    pub fn contact(&self) -> PeerContact {
        PeerContact {
            node_id: self.inner.local_id.clone(),
            public_key: self.public_key(),
            address: self
                .inner
                .manager
                .direct_addr()
                .or(self.inner.config.connection.direct_listen),
        }
    }

    /// A weak back-reference for extensions and other long-lived callers.
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Start the manager and the orchestrator tasks, then initialize every
    /// extension registered so far.
    pub async fn start(&self) -> NetworkResult<()> {
        let inner = &self.inner;
        inner.manager.start().await?;
        inner.started_at.store(now_ms(), Ordering::SeqCst);

        let weak = Arc::downgrade(inner);
        if let Some(events) = inner.events.lock().take() {
            inner
                .tasks
                .lock()
                .push(tokio::spawn(event_loop(weak.clone(), events)));
        }
        inner
            .tasks
            .lock()
            .push(tokio::spawn(gossip_loop(weak.clone())));

        for extension in inner.registry.lock().all() {
            let handle = self.handle();
            if let Err(err) = extension.initialize(handle).await {
                warn!(extension = extension.id(), %err, "Extension initialization failed");
            }
        }

        info!(node = %inner.local_id, "Node started");
        Ok(())
    }

    pub async fn connect(&self, contact: PeerContact) -> NetworkResult<bool> {
        self.inner.manager.connect_to_peer(contact).await
    }

    pub fn disconnect(&self, peer_id: &NodeId) {
        self.inner.manager.disconnect(peer_id, "Disconnect requested");
    }

    /// Point-to-point encrypted delivery. Returns `true` iff the peer's
    /// transport accepted the bytes.
    pub async fn whisper(
        &self,
        peer_id: &NodeId,
        content: &str,
        intent: &str,
    ) -> NetworkResult<bool> {
        let inner = &self.inner;
        if !NodeId::is_valid(peer_id.as_str()) {
            return Err(NetworkError::InvalidId(peer_id.as_str().to_owned()));
        }

        let message = Message::whisper(
            inner.local_id.clone(),
            peer_id.clone(),
            content,
            MessageOptions::with_intent(intent),
        )?;
        let accepted = inner.manager.send(peer_id, &message).await?;
        if accepted {
            self.count_sent(message.kind());
        }
        Ok(accepted)
    }

    /// Start an epidemic broadcast: enqueue for gossip and send immediately
    /// to every connected peer. Returns how many peers accepted.
    pub async fn broadcast(
        &self,
        content: &str,
        intent: &str,
        max_hops: Option<u32>,
    ) -> NetworkResult<usize> {
        let inner = &self.inner;
        let options = MessageOptions {
            intent: Some(intent.to_owned()),
            ttl_ms: Some(inner.config.gossip.message_ttl_ms),
            whisper_tag: None,
        };
        let message = Message::broadcast(
            inner.local_id.clone(),
            content,
            max_hops.unwrap_or(inner.config.gossip.max_hops),
            options,
        )?;

        if inner.config.gossip.enable_auto_propagation {
            self.enqueue_for_gossip(message.clone());
        }

        let accepted = inner.manager.broadcast_to_peers(&message).await;
        for _ in 0..accepted {
            self.count_sent(MessageKind::Broadcast);
        }
        Ok(accepted)
    }

    /// Advertise an intent to every connected peer.
    pub async fn resonate(&self, intent: &str, strength: f64) -> NetworkResult<usize> {
        let inner = &self.inner;
        let message = Message::resonance(
            inner.local_id.clone(),
            intent,
            strength,
            MessageOptions::default(),
        )?;
        let accepted = inner.manager.broadcast_to_peers(&message).await;
        for _ in 0..accepted {
            self.count_sent(MessageKind::Resonance);
        }
        Ok(accepted)
    }

    /// Register an extension; initializes it right away when the node is
    /// already running. Re-registering an existing id is a caller error.
    pub async fn register_extension(
        &self,
        extension: Arc<dyn Extension>,
    ) -> NetworkResult<()> {
        self.inner.registry.lock().register(extension.clone())?;

        if self.inner.started_at.load(Ordering::SeqCst) != 0 {
            if let Err(err) = extension.initialize(self.handle()).await {
                self.inner.registry.lock().unregister(extension.id());
                return Err(NetworkError::Extension {
                    id: extension.id().to_owned(),
                    reason: err.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Remove an extension and run its cleanup.
    pub async fn unregister_extension(&self, id: &str) -> NetworkResult<()> {
        let removed = self.inner.registry.lock().unregister(id);
        match removed {
            Some(extension) => {
                if let Err(err) = extension.cleanup().await {
                    warn!(extension = id, %err, "Extension cleanup failed");
                }
                Ok(())
            }
            None => Err(NetworkError::Extension {
                id: id.to_owned(),
                reason: "not registered".to_owned(),
            }),
        }
    }

    /// Observe every record that clears the pipeline.
    pub fn subscribe(&self) -> broadcast::Receiver<ObservedMessage> {
        self.inner.observers.subscribe()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.manager.peers_info()
    }

    pub fn stats(&self) -> NodeStats {
        let inner = &self.inner;
        let enqueued = inner.counters.enqueued.load(Ordering::Relaxed);
        let forwarded = inner.counters.forwarded.load(Ordering::Relaxed);
        let started_at = inner.started_at.load(Ordering::SeqCst);

        NodeStats {
            connected_peers: inner.manager.connected_count(),
            messages_sent: inner.counters.sent.load(Ordering::Relaxed),
            messages_received: inner.counters.received.load(Ordering::Relaxed),
            average_latency_ms: inner.manager.average_latency_ms(),
            uptime_ms: if started_at == 0 {
                0
            } else {
                now_ms().saturating_sub(started_at)
            },
            active_extensions: inner.registry.lock().len(),
            gossip_efficiency: if enqueued == 0 {
                1.0
            } else {
                forwarded as f64 / enqueued as f64
            },
        }
    }

    /// Stop everything: orchestrator tasks, extension cleanups (failures
    /// logged, never propagated), then the connection manager.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutting_down.store(true, Ordering::SeqCst);

        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }

        for extension in inner.registry.lock().all() {
            if let Err(err) = extension.cleanup().await {
                warn!(extension = extension.id(), %err, "Extension cleanup failed");
            }
        }

        inner.manager.shutdown().await;
        info!(node = %inner.local_id, "Node shut down");
    }

    fn enqueue_for_gossip(&self, message: Message) {
        let inner = &self.inner;
        let displaced = inner.queue.lock().push(message);
        inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if displaced.is_some() {
            debug!("Gossip queue full; oldest entry dropped");
            if let Some(metrics) = &inner.metrics {
                metrics.inc_dropped("queue_overflow");
            }
        }
        if let Some(metrics) = &inner.metrics {
            metrics.set_gossip_queue_depth(inner.queue.lock().len() as i64);
        }
    }

    fn count_sent(&self, kind: MessageKind) {
        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.inner.metrics {
            metrics.inc_message("sent", kind.as_str());
        }
    }
}

/// Weak back-reference to a [`Node`], safe for extensions to hold.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Weak<NodeInner>,
}

impl NodeHandle {
    fn upgrade(&self) -> NetworkResult<Node> {
        self.inner
            .upgrade()
            .map(|inner| Node { inner })
            .ok_or(NetworkError::ShutDown)
    }

    pub fn local_id(&self) -> NetworkResult<NodeId> {
        Ok(self.upgrade()?.local_id().clone())
    }

    pub async fn whisper(
        &self,
        peer_id: &NodeId,
        content: &str,
        intent: &str,
    ) -> NetworkResult<bool> {
        self.upgrade()?.whisper(peer_id, content, intent).await
    }

    pub async fn broadcast(
        &self,
        content: &str,
        intent: &str,
        max_hops: Option<u32>,
    ) -> NetworkResult<usize> {
        self.upgrade()?.broadcast(content, intent, max_hops).await
    }

    pub async fn resonate(&self, intent: &str, strength: f64) -> NetworkResult<usize> {
        self.upgrade()?.resonate(intent, strength).await
    }

    pub fn stats(&self) -> NetworkResult<NodeStats> {
        Ok(self.upgrade()?.stats())
    }
}

/// Consume the manager's event stream and run the incoming pipeline.
async fn event_loop(weak: Weak<NodeInner>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else { break };

        match event {
            PeerEvent::Connected(info) => {
                debug!(peer = %info.node_id, transport = ?info.transport, "Peer available");
                if let Some(metrics) = &inner.metrics {
                    metrics.set_peers(inner.manager.connected_count() as i64);
                }
            }
            PeerEvent::Disconnected { peer_id, reason } => {
                debug!(peer = %peer_id, reason, "Peer gone");
                if let Some(metrics) = &inner.metrics {
                    metrics.set_peers(inner.manager.connected_count() as i64);
                }
            }
            PeerEvent::Message { message, from } => {
                handle_message(&inner, message, from).await;
            }
            PeerEvent::Error { error, peer_id } => {
                debug!(?peer_id, %error, "Manager error");
                match &error {
                    NetworkError::Validation(_) => {
                        inner
                            .counters
                            .dropped_invalid
                            .fetch_add(1, Ordering::Relaxed);
                        if let Some(metrics) = &inner.metrics {
                            metrics.inc_dropped("invalid");
                        }
                    }
                    NetworkError::Decryption(_) => {
                        if let Some(metrics) = &inner.metrics {
                            metrics.inc_dropped("decryption");
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// The incoming message pipeline: expiry and validation, dedup, kind
/// dispatch, then the observer event.
async fn handle_message(inner: &Arc<NodeInner>, message: Message, from: NodeId) {
    let now = now_ms();

    if message.is_expired_at(now) {
        inner
            .counters
            .dropped_expired
            .fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &inner.metrics {
            metrics.inc_dropped("expired");
        }
        return;
    }
    let report = message.validate_at(now);
    if !report.valid {
        inner
            .counters
            .dropped_invalid
            .fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &inner.metrics {
            metrics.inc_dropped("invalid");
        }
        return;
    }

    let fresh = {
        let (sender, nonce) = message.dedup_key();
        inner.dedup.lock().insert(sender, nonce, now)
    };
    if !fresh {
        inner
            .counters
            .dropped_duplicate
            .fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &inner.metrics {
            metrics.inc_dropped("duplicate");
        }
        return;
    }

    inner.counters.received.fetch_add(1, Ordering::Relaxed);
    if let Some(metrics) = &inner.metrics {
        metrics.inc_message("received", message.kind().as_str());
    }
    if inner.config.debug {
        debug!(from = %from, kind = %message.kind(), "Pipeline accepted message");
    }

    match &message.body {
        MessageBody::Broadcast { .. } => {
            let mut forward = message.clone();
            if forward.mark_forwarded_by(&inner.local_id)
                && inner.config.gossip.enable_auto_propagation
            {
                let displaced = inner.queue.lock().push(forward);
                inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                if displaced.is_some() {
                    if let Some(metrics) = &inner.metrics {
                        metrics.inc_dropped("queue_overflow");
                    }
                }
            }
        }
        MessageBody::Resonance { intent, strength } => {
            if inner.matcher.resonates(intent, *strength) {
                dispatch_to_extensions(inner, MessageKind::Resonance, &message, &from).await;
            }
        }
        // The manager already echoed the pong / recorded the latency.
        MessageBody::Ping | MessageBody::Pong => {}
        MessageBody::Hello | MessageBody::Goodbye { .. } => {}
        _ => {
            dispatch_to_extensions(inner, message.kind(), &message, &from).await;
        }
    }

    let _ = inner.observers.send(ObservedMessage { message, from });
}

/// Invoke every handler registered for a kind; a handler error is logged
/// and contained.
async fn dispatch_to_extensions(
    inner: &Arc<NodeInner>,
    kind: MessageKind,
    message: &Message,
    from: &NodeId,
) {
    let handlers = inner.registry.lock().handlers_for(kind);
    for handler in handlers {
        if let Err(err) = handler.handle_message(message, from).await {
            warn!(extension = handler.id(), %kind, %err, "Extension handler failed");
            if let Some(metrics) = &inner.metrics {
                metrics.inc_dropped("extension_error");
            }
        }
    }
}

/// Periodic propagation: drain a bounded batch and fan each record out to a
/// few randomly chosen peers. Expired entries die at dequeue.
async fn gossip_loop(weak: Weak<NodeInner>) {
    let interval = match weak.upgrade() {
        Some(inner) => inner.config.gossip.interval(),
        None => return,
    };

    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = weak.upgrade() else { break };
        if !inner.config.gossip.enable_auto_propagation {
            continue;
        }

        let now = now_ms();
        let batch: Vec<Message> = {
            let mut queue = inner.queue.lock();
            let mut drained = Vec::new();
            while drained.len() < inner.config.gossip.max_concurrent_gossip {
                match queue.pop_unexpired(now) {
                    Some(message) => drained.push(message),
                    None => break,
                }
            }
            drained
        };

        for message in batch {
            let targets = inner.manager.sample_sending_peers(GOSSIP_FANOUT);
            let mut accepted = 0;
            for peer_id in &targets {
                if let Ok(true) = inner.manager.send(peer_id, &message).await {
                    accepted += 1;
                }
            }
            if accepted > 0 {
                inner.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                inner
                    .counters
                    .sent
                    .fetch_add(accepted as u64, Ordering::Relaxed);
                if let Some(metrics) = &inner.metrics {
                    metrics.inc_forwarded();
                }
            }
        }

        if let Some(metrics) = &inner.metrics {
            metrics.set_gossip_queue_depth(inner.queue.lock().len() as i64);
        }
    }
}
