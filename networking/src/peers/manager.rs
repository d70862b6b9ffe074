//! The connection manager.
//!
//! Owns the peer table and every transport handle. Connects peers (direct
//! first, relay fallback), runs the encryption envelope on every payload,
//! services heartbeats and optional cover traffic, and feeds the
//! orchestrator a typed event stream. Background tasks hold only weak
//! references back to the manager so they never keep it alive.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use parking_lot::Mutex;
use protocol::{KeyPair, Message, MessageKind, NodeId, PublicKey, now_ms};
use rand::Rng;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::peer::Peer;
use crate::config::NetworkConfig;
use crate::envelope::Envelope;
use crate::error::{NetworkError, NetworkResult};
use crate::transport::direct::{self, DirectListener, DirectReceiver, DirectSender};
use crate::transport::relay::{InboundRelayPeer, RelayClient};
use crate::transport::{TransportReceiver, TransportSender};
use crate::types::{HelloPayload, PeerContact, PeerEvent, PeerInfo, PeerState};

pub struct ManagerInner {
    local_id: NodeId,
    keys: KeyPair,
    config: NetworkConfig,
    peers: Mutex<HashMap<NodeId, Peer>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    relay: RelayClient,
    relay_inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundRelayPeer>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Actual bound listen address, once the listener is up.
    direct_addr: Mutex<Option<SocketAddr>>,
    shutting_down: AtomicBool,
}

/// Handle to the connection manager; clones share one peer table.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<ManagerInner>,
}

impl PeerManager {
    pub fn new(
        local_id: NodeId,
        keys: KeyPair,
        config: NetworkConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let relay = RelayClient::new(local_id.clone(), keys.public(), inbound_tx);
        PeerManager {
            inner: Arc::new(ManagerInner {
                local_id,
                keys,
                config,
                peers: Mutex::new(HashMap::new()),
                events,
                relay,
                relay_inbound: Mutex::new(Some(inbound_rx)),
                tasks: Mutex::new(Vec::new()),
                direct_addr: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.inner.local_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.keys.public()
    }

    /// Where the direct listener actually bound, once started.
    pub fn direct_addr(&self) -> Option<SocketAddr> {
        *self.inner.direct_addr.lock()
    }

    /// Bind the direct listener (when configured), register at a relay
    /// (when configured), and spawn the periodic tasks.
    pub async fn start(&self) -> NetworkResult<()> {
        let inner = &self.inner;
        let weak = Arc::downgrade(inner);

        if let Some(addr) = inner.config.connection.direct_listen {
            let listener = DirectListener::bind(addr).await?;
            let bound = listener.local_addr()?;
            info!(addr = %bound, "Direct listener bound");
            *inner.direct_addr.lock() = Some(bound);
            inner
                .tasks
                .lock()
                .push(tokio::spawn(accept_loop(weak.clone(), listener)));
        }

        if let Some(inbound) = inner.relay_inbound.lock().take() {
            inner
                .tasks
                .lock()
                .push(tokio::spawn(relay_inbound_loop(weak.clone(), inbound)));
        }

        inner
            .tasks
            .lock()
            .push(tokio::spawn(heartbeat_loop(weak.clone())));

        if inner.config.connection.enable_obfuscation {
            inner
                .tasks
                .lock()
                .push(tokio::spawn(obfuscation_loop(weak.clone())));
        }

        // Registering makes this node reachable over the fallback; failure
        // here only matters once someone actually needs the relay.
        let relay_servers = inner.config.connection.relay_servers.clone();
        if !relay_servers.is_empty() {
            if let Err(err) = inner
                .relay
                .connect(
                    &relay_servers,
                    inner.config.connection.timeout(),
                    inner.config.connection.max_retries,
                )
                .await
            {
                warn!(%err, "Relay registration failed");
            }
        }

        Ok(())
    }

    /// Connect to an introduced peer: direct transport when the contact has
    /// an address, relay fallback otherwise. Returns `true` once the peer is
    /// in a sending state, `false` when every transport failed.
    pub async fn connect_to_peer(&self, contact: PeerContact) -> NetworkResult<bool> {
        let inner = &self.inner;

        if !NodeId::is_valid(contact.node_id.as_str()) {
            return Err(NetworkError::InvalidId(contact.node_id.as_str().to_owned()));
        }
        if contact.node_id == inner.local_id {
            return Err(NetworkError::InvalidId("cannot connect to self".to_owned()));
        }

        let already_sending = inner
            .peers
            .lock()
            .get(&contact.node_id)
            .map(|peer| peer.state.is_sending())
            .unwrap_or(false);
        if already_sending {
            return Ok(true);
        }

        let mut failure = String::new();

        if let Some(addr) = contact.address {
            match tokio::time::timeout(
                inner.config.connection.timeout(),
                dial_direct(inner, &contact, addr),
            )
            .await
            {
                Ok(Ok((sender, receiver, kinds))) => {
                    install_peer(
                        inner,
                        contact.node_id.clone(),
                        contact.public_key,
                        kinds,
                        TransportSender::Direct(sender),
                        TransportReceiver::Direct(receiver),
                        PeerState::Connected,
                    );
                    return Ok(true);
                }
                Ok(Err(err)) => {
                    debug!(peer = %contact.node_id, %err, "Direct connect failed");
                    failure = err.to_string();
                }
                Err(_) => {
                    debug!(peer = %contact.node_id, "Direct connect timed out");
                    failure = "direct connect timed out".to_owned();
                }
            }
        }

        let relay_servers = &inner.config.connection.relay_servers;
        if !relay_servers.is_empty() {
            let attempt = async {
                inner
                    .relay
                    .connect(
                        relay_servers,
                        inner.config.connection.timeout(),
                        inner.config.connection.max_retries,
                    )
                    .await?;
                inner
                    .relay
                    .open_peer(&contact.node_id, inner.config.connection.timeout())
                    .await
            };
            match attempt.await {
                Ok((sender, receiver)) => {
                    install_peer(
                        inner,
                        contact.node_id.clone(),
                        contact.public_key,
                        Vec::new(),
                        TransportSender::Relay(sender),
                        TransportReceiver::Relay(receiver),
                        PeerState::Relaying,
                    );
                    return Ok(true);
                }
                Err(err) => {
                    debug!(peer = %contact.node_id, %err, "Relay connect failed");
                    failure = if failure.is_empty() {
                        err.to_string()
                    } else {
                        format!("{failure}; {err}")
                    };
                }
            }
        }

        if failure.is_empty() {
            failure = "no transport available".to_owned();
        }
        emit(
            inner,
            PeerEvent::Disconnected {
                peer_id: contact.node_id,
                reason: failure,
            },
        );
        Ok(false)
    }

    /// Encrypt, serialize and deliver one message to one peer. Returns
    /// `true` iff the transport accepted the bytes.
    pub async fn send(&self, peer_id: &NodeId, message: &Message) -> NetworkResult<bool> {
        send_inner(&self.inner, peer_id, message, "Transport error").await
    }

    /// Send to every peer in a sending state; returns how many accepted.
    pub async fn broadcast_to_peers(&self, message: &Message) -> usize {
        let targets = self.sending_peer_ids();
        let mut accepted = 0;
        for peer_id in targets {
            match send_inner(&self.inner, &peer_id, message, "Transport error").await {
                Ok(true) => accepted += 1,
                _ => {}
            }
        }
        accepted
    }

    /// Graceful teardown of one peer.
    pub fn disconnect(&self, peer_id: &NodeId, reason: &str) {
        remove_peer(&self.inner, peer_id, reason, true);
    }

    /// Cancel all tasks, close all transports, clear all state.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutting_down.store(true, Ordering::SeqCst);

        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }

        let peer_ids: Vec<NodeId> = inner.peers.lock().keys().cloned().collect();
        for peer_id in peer_ids {
            remove_peer(inner, &peer_id, "Shutdown", true);
        }

        inner.relay.shutdown().await;
    }

    pub fn peer_info(&self, peer_id: &NodeId) -> Option<PeerInfo> {
        self.inner.peers.lock().get(peer_id).map(Peer::info)
    }

    pub fn peers_info(&self) -> Vec<PeerInfo> {
        self.inner.peers.lock().values().map(Peer::info).collect()
    }

    /// Peers currently able to carry messages.
    pub fn sending_peer_ids(&self) -> Vec<NodeId> {
        self.inner
            .peers
            .lock()
            .values()
            .filter(|peer| peer.state.is_sending())
            .map(|peer| peer.node_id.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.inner
            .peers
            .lock()
            .values()
            .filter(|peer| peer.state.is_sending())
            .count()
    }

    /// Uniform random fan-out sample from the sending set.
    pub fn sample_sending_peers(&self, count: usize) -> Vec<NodeId> {
        let ids = self.sending_peer_ids();
        let mut rng = rand::thread_rng();
        ids.choose_multiple(&mut rng, count).cloned().collect()
    }

    /// Mean measured round trip over peers with a measurement.
    pub fn average_latency_ms(&self) -> f64 {
        let peers = self.inner.peers.lock();
        let samples: Vec<u64> = peers.values().filter_map(|peer| peer.latency_ms).collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<u64>() as f64 / samples.len() as f64
    }
}

fn emit(inner: &ManagerInner, event: PeerEvent) {
    let _ = inner.events.send(event);
}

fn hello_frame(inner: &ManagerInner) -> NetworkResult<String> {
    let payload = HelloPayload {
        public_key: inner.keys.public(),
        supported_kinds: MessageKind::ALL.to_vec(),
    };
    let encoded = B64.encode(
        serde_json::to_vec(&payload)
            .map_err(|err| NetworkError::Fatal(err.to_string()))?,
    );
    let message = Message::hello(inner.local_id.clone(), encoded)?;
    message
        .serialize()
        .map_err(|err| NetworkError::Fatal(err.to_string()))
}

fn decode_hello(message: &Message) -> NetworkResult<HelloPayload> {
    let bytes = B64
        .decode(&message.payload)
        .map_err(|err| NetworkError::Validation(format!("hello payload: {err}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| NetworkError::Validation(format!("hello payload: {err}")))
}

/// Dialer half of the direct handshake: send our hello, require the peer's
/// hello in reply, and check it speaks as the node we were introduced to.
async fn dial_direct(
    inner: &ManagerInner,
    contact: &PeerContact,
    addr: SocketAddr,
) -> NetworkResult<(DirectSender, DirectReceiver, Vec<MessageKind>)> {
    let (sender, mut receiver) = direct::connect(addr).await?;
    sender.send(&hello_frame(inner)?).await?;

    let frame = receiver
        .next_frame()
        .await
        .ok_or_else(|| NetworkError::Transport("closed during handshake".to_owned()))?;
    let message = Message::deserialize(&frame)
        .map_err(|err| NetworkError::Validation(format!("handshake: {err}")))?;
    if message.kind() != MessageKind::Hello {
        return Err(NetworkError::Validation(format!(
            "expected hello, got {}",
            message.kind()
        )));
    }
    if message.sender != contact.node_id {
        return Err(NetworkError::Validation(format!(
            "peer identified as {}, expected {}",
            message.sender, contact.node_id
        )));
    }

    let hello = decode_hello(&message)?;
    Ok((sender, receiver, hello.supported_kinds))
}

/// Acceptor half of the handshake, run per inbound connection.
async fn accept_direct(
    inner: &ManagerInner,
    sender: &DirectSender,
    receiver: &mut DirectReceiver,
) -> NetworkResult<(NodeId, PublicKey, Vec<MessageKind>)> {
    let frame = receiver
        .next_frame()
        .await
        .ok_or_else(|| NetworkError::Transport("closed during handshake".to_owned()))?;
    let message = Message::deserialize(&frame)
        .map_err(|err| NetworkError::Validation(format!("handshake: {err}")))?;
    if message.kind() != MessageKind::Hello {
        return Err(NetworkError::Validation(format!(
            "expected hello, got {}",
            message.kind()
        )));
    }
    if !NodeId::is_valid(message.sender.as_str()) {
        return Err(NetworkError::InvalidId(message.sender.as_str().to_owned()));
    }

    let hello = decode_hello(&message)?;
    sender.send(&hello_frame(inner)?).await?;
    Ok((message.sender, hello.public_key, hello.supported_kinds))
}

/// Put a freshly opened channel into the table and start its reader.
/// Evicts the least recently seen peer when the table is at capacity.
fn install_peer(
    inner: &Arc<ManagerInner>,
    node_id: NodeId,
    public_key: PublicKey,
    supported_kinds: Vec<MessageKind>,
    sender: TransportSender,
    receiver: TransportReceiver,
    state: PeerState,
) {
    if inner.shutting_down.load(Ordering::SeqCst) {
        let closing = sender;
        tokio::spawn(async move { closing.close().await });
        return;
    }

    let envelope = Arc::new(Envelope::new(&inner.keys, &public_key));
    let new_is_relay = matches!(sender, TransportSender::Relay(_));

    let mut peer = Peer::new(
        node_id.clone(),
        public_key,
        sender,
        envelope,
        supported_kinds,
        now_ms(),
    );
    if !peer.transition(state) {
        discard(inner, peer, "Invalid state transition", false);
        return;
    }
    let info = peer.info();

    // A same-id relay replacement overwrote the demux route already; its
    // teardown must not close the route the new channel now owns.
    let replaced: Option<Peer>;
    let mut displaced: Vec<Peer> = Vec::new();
    {
        let mut peers = inner.peers.lock();

        replaced = peers.remove(&node_id);

        while peers.len() >= inner.config.max_connections.max(1) {
            let oldest = peers
                .values()
                .min_by_key(|peer| peer.last_seen)
                .map(|peer| peer.node_id.clone());
            match oldest {
                Some(evicted_id) => {
                    if let Some(evicted) = peers.remove(&evicted_id) {
                        displaced.push(evicted);
                    }
                }
                None => break,
            }
        }

        peers.insert(node_id.clone(), peer);
    }

    if let Some(previous) = replaced {
        let route_reused =
            new_is_relay && matches!(previous.sender, TransportSender::Relay(_));
        discard_with_route(
            inner,
            previous,
            "Replaced by a new connection",
            false,
            !route_reused,
        );
    }
    for evicted in displaced {
        emit(
            inner,
            PeerEvent::Disconnected {
                peer_id: evicted.node_id.clone(),
                reason: "Evicted for capacity".to_owned(),
            },
        );
        discard(inner, evicted, "Evicted for capacity", true);
    }

    let reader = tokio::spawn(reader_loop(
        Arc::downgrade(inner),
        node_id.clone(),
        receiver,
    ));
    if let Some(peer) = inner.peers.lock().get_mut(&node_id) {
        peer.reader = Some(reader);
    } else {
        // Raced with a removal; don't leak the task.
        reader.abort();
        return;
    }

    info!(peer = %node_id, state = ?state, "Peer connected");
    emit(inner, PeerEvent::Connected(info));
}

async fn send_inner(
    inner: &Arc<ManagerInner>,
    peer_id: &NodeId,
    message: &Message,
    fail_reason: &str,
) -> NetworkResult<bool> {
    let (sender, envelope) = {
        let peers = inner.peers.lock();
        match peers.get(peer_id) {
            Some(peer) if peer.state.is_sending() => {
                (peer.sender.clone(), peer.envelope.clone())
            }
            _ => return Ok(false),
        }
    };

    let mut outbound = message.clone();
    outbound.payload = envelope.seal(&message.payload)?;
    let frame = outbound
        .serialize()
        .map_err(|err| NetworkError::Fatal(err.to_string()))?;

    match sender.send(&frame).await {
        Ok(()) => {
            if let Some(peer) = inner.peers.lock().get_mut(peer_id) {
                peer.record_send_success();
            }
            Ok(true)
        }
        Err(err) => {
            if let Some(peer) = inner.peers.lock().get_mut(peer_id) {
                peer.record_send_failure();
            }
            warn!(peer = %peer_id, %err, "Send failed");
            remove_peer(inner, peer_id, fail_reason, false);
            Ok(false)
        }
    }
}

/// Drop a peer record, optionally saying goodbye first. Emits the
/// `disconnected` event synchronously; transport teardown runs detached so
/// this is safe to call from the peer's own reader task.
fn remove_peer(inner: &Arc<ManagerInner>, peer_id: &NodeId, reason: &str, graceful: bool) {
    let removed = inner.peers.lock().remove(peer_id);
    let Some(mut peer) = removed else { return };

    // Mid-session failures land in the terminal state before teardown;
    // graceful removals never pass through `Error`.
    if !graceful {
        peer.transition(PeerState::Error);
    }

    info!(peer = %peer_id, reason, "Peer disconnected");
    emit(
        inner,
        PeerEvent::Disconnected {
            peer_id: peer_id.clone(),
            reason: reason.to_owned(),
        },
    );
    discard(inner, peer, reason, graceful);
}

/// Detached transport teardown for a peer already out of the table.
fn discard(inner: &Arc<ManagerInner>, peer: Peer, reason: &str, graceful: bool) {
    discard_with_route(inner, peer, reason, graceful, true);
}

/// Teardown with control over the relay demux route: a same-id relay
/// replacement overwrites the route in place, so tearing the old channel
/// down must leave the route to its new owner.
fn discard_with_route(
    inner: &Arc<ManagerInner>,
    mut peer: Peer,
    reason: &str,
    graceful: bool,
    close_route: bool,
) {
    let local_id = inner.local_id.clone();
    let reason = reason.to_owned();
    tokio::spawn(async move {
        if graceful && peer.state.is_sending() {
            if let Ok(mut goodbye) = Message::goodbye(local_id, Some(reason)) {
                if let Ok(sealed) = peer.envelope.seal(&goodbye.payload) {
                    goodbye.payload = sealed;
                    if let Ok(frame) = goodbye.serialize() {
                        let _ = peer.sender.send(&frame).await;
                    }
                }
            }
        }
        let keep_relay_route =
            matches!(peer.sender, TransportSender::Relay(_)) && !close_route;
        if !keep_relay_route {
            peer.sender.close().await;
        }
        // No-op when the reader already returned on its own.
        peer.abort_reader();
    });
}

/// Drain one peer's read half. Frames from one peer are handled strictly in
/// order, and a ping is answered before the next frame is read.
async fn reader_loop(weak: Weak<ManagerInner>, peer_id: NodeId, mut receiver: TransportReceiver) {
    loop {
        match receiver.next_frame().await {
            Some(frame) => {
                let Some(inner) = weak.upgrade() else { break };
                if handle_frame(&inner, &peer_id, frame).await.is_break() {
                    break;
                }
                // A send failure inside handle_frame may have dropped the
                // record already.
                if !inner.peers.lock().contains_key(&peer_id) {
                    break;
                }
            }
            None => {
                let Some(inner) = weak.upgrade() else { break };
                if !inner.shutting_down.load(Ordering::SeqCst) {
                    remove_peer(&inner, &peer_id, "Transport closed", false);
                }
                break;
            }
        }
    }
}

async fn handle_frame(
    inner: &Arc<ManagerInner>,
    peer_id: &NodeId,
    frame: String,
) -> ControlFlow<()> {
    let mut message = match Message::deserialize(&frame) {
        Ok(message) => message,
        Err(err) => {
            debug!(peer = %peer_id, %err, "Undecodable frame");
            emit(
                inner,
                PeerEvent::Error {
                    error: NetworkError::Validation(err.to_string()),
                    peer_id: Some(peer_id.clone()),
                },
            );
            return ControlFlow::Continue(());
        }
    };

    let report = message.validate();
    for warning in &report.warnings {
        debug!(peer = %peer_id, warning, "Message warning");
    }
    if !report.valid {
        debug!(peer = %peer_id, errors = ?report.errors, "Invalid message dropped");
        emit(
            inner,
            PeerEvent::Error {
                error: NetworkError::Validation(report.errors.join("; ")),
                peer_id: Some(peer_id.clone()),
            },
        );
        return ControlFlow::Continue(());
    }

    let now = now_ms();
    let envelope = {
        let mut peers = inner.peers.lock();
        match peers.get_mut(peer_id) {
            Some(peer) => {
                peer.last_seen = now;
                peer.envelope.clone()
            }
            None => return ControlFlow::Break(()),
        }
    };

    // Hello is the one kind whose payload predates the shared secret.
    if message.kind() == MessageKind::Hello {
        if let Ok(hello) = decode_hello(&message) {
            if let Some(peer) = inner.peers.lock().get_mut(peer_id) {
                peer.supported_kinds = hello.supported_kinds;
            }
        }
        return ControlFlow::Continue(());
    }

    if inner.config.debug {
        debug!(
            peer = %peer_id,
            kind = %message.kind(),
            nonce = %message.nonce,
            "Frame received"
        );
    }

    match envelope.open(&message.payload) {
        Ok(plaintext) => message.payload = plaintext,
        Err(err) => {
            debug!(peer = %peer_id, %err, "Undecryptable payload dropped");
            emit(
                inner,
                PeerEvent::Error {
                    error: err,
                    peer_id: Some(peer_id.clone()),
                },
            );
            return ControlFlow::Continue(());
        }
    }

    match message.kind() {
        MessageKind::Ping => {
            // Answer before any later frame from this peer is processed.
            match Message::pong(inner.local_id.clone(), message.timestamp) {
                Ok(pong) => {
                    let _ = send_inner(inner, peer_id, &pong, "Transport error").await;
                }
                Err(err) => warn!(%err, "Pong construction failed"),
            }
        }
        MessageKind::Pong => {
            if let Ok(echoed) = message.payload.parse::<u64>() {
                let round_trip = now.saturating_sub(echoed);
                if let Some(peer) = inner.peers.lock().get_mut(peer_id) {
                    peer.record_latency(round_trip);
                }
            }
        }
        MessageKind::Goodbye => {
            emit(
                inner,
                PeerEvent::Message {
                    message,
                    from: peer_id.clone(),
                },
            );
            remove_peer(inner, peer_id, "Goodbye received", false);
            return ControlFlow::Break(());
        }
        _ => {}
    }

    emit(
        inner,
        PeerEvent::Message {
            message,
            from: peer_id.clone(),
        },
    );
    ControlFlow::Continue(())
}

async fn accept_loop(weak: Weak<ManagerInner>, listener: DirectListener) {
    loop {
        let accepted = listener.accept().await;
        let Some(inner) = weak.upgrade() else { break };

        match accepted {
            Ok((addr, sender, mut receiver)) => {
                let timeout = inner.config.connection.timeout();
                tokio::spawn(async move {
                    let handshake = tokio::time::timeout(
                        timeout,
                        accept_direct(&inner, &sender, &mut receiver),
                    )
                    .await;
                    match handshake {
                        Ok(Ok((node_id, public_key, kinds))) => {
                            install_peer(
                                &inner,
                                node_id,
                                public_key,
                                kinds,
                                TransportSender::Direct(sender),
                                TransportReceiver::Direct(receiver),
                                PeerState::Connected,
                            );
                        }
                        Ok(Err(err)) => {
                            debug!(%addr, %err, "Inbound handshake rejected");
                            sender.close().await;
                        }
                        Err(_) => {
                            debug!(%addr, "Inbound handshake timed out");
                            sender.close().await;
                        }
                    }
                });
            }
            Err(err) => {
                warn!(%err, "Accept failed");
            }
        }
    }
}

/// Inbound relay introductions become `Relaying` peers.
async fn relay_inbound_loop(
    weak: Weak<ManagerInner>,
    mut inbound: mpsc::UnboundedReceiver<InboundRelayPeer>,
) {
    while let Some(introduced) = inbound.recv().await {
        let Some(inner) = weak.upgrade() else { break };

        let Some(public_key) = introduced.public_key else {
            warn!(peer = %introduced.from, "Relay introduction without a public key");
            inner.relay.close_peer(&introduced.from);
            continue;
        };
        if !NodeId::is_valid(introduced.from.as_str()) {
            warn!(peer = %introduced.from, "Relay introduction with malformed id");
            inner.relay.close_peer(&introduced.from);
            continue;
        }

        let sender = inner.relay.sender_for(&introduced.from);
        install_peer(
            &inner,
            introduced.from,
            public_key,
            Vec::new(),
            TransportSender::Relay(sender),
            TransportReceiver::Relay(introduced.receiver),
            PeerState::Relaying,
        );
    }
}

/// Ping every sending peer each interval; fail the ones that produced no
/// traffic since the previous tick.
async fn heartbeat_loop(weak: Weak<ManagerInner>) {
    let interval = match weak.upgrade() {
        Some(inner) => inner.config.connection.heartbeat_interval(),
        None => return,
    };

    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = weak.upgrade() else { break };

        let now = now_ms();
        let interval_ms = inner.config.connection.heartbeat_interval_ms;
        let mut silent = Vec::new();
        let mut targets = Vec::new();
        {
            let peers = inner.peers.lock();
            for peer in peers.values().filter(|peer| peer.state.is_sending()) {
                let quiet_for = now.saturating_sub(peer.last_seen);
                let pinged_since_seen = peer.last_ping > peer.last_seen;
                if quiet_for > interval_ms && pinged_since_seen {
                    silent.push(peer.node_id.clone());
                } else {
                    targets.push(peer.node_id.clone());
                }
            }
        }

        for peer_id in silent {
            warn!(peer = %peer_id, "No traffic since last heartbeat");
            remove_peer(&inner, &peer_id, "Heartbeat failed", false);
        }

        for peer_id in targets {
            match Message::ping(inner.local_id.clone()) {
                Ok(ping) => {
                    let _ = send_inner(&inner, &peer_id, &ping, "Heartbeat failed").await;
                    if let Some(peer) = inner.peers.lock().get_mut(&peer_id) {
                        peer.last_ping = now;
                    }
                }
                Err(err) => warn!(%err, "Ping construction failed"),
            }
        }
    }
}

/// Cover traffic: pings with random padding to random peers at a jittered
/// interval, indistinguishable on the wire from real heartbeats.
async fn obfuscation_loop(weak: Weak<ManagerInner>) {
    let base_interval = match weak.upgrade() {
        Some(inner) => inner.config.connection.obfuscation_interval(),
        None => return,
    };

    loop {
        let delay = {
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            base_interval.mul_f64(jitter)
        };
        tokio::time::sleep(delay).await;
        let Some(inner) = weak.upgrade() else { break };

        let target = {
            let ids = inner
                .peers
                .lock()
                .values()
                .filter(|peer| peer.state.is_sending())
                .map(|peer| peer.node_id.clone())
                .collect::<Vec<_>>();
            let mut rng = rand::thread_rng();
            ids.choose(&mut rng).cloned()
        };
        let Some(peer_id) = target else { continue };

        let padding = {
            let mut rng = rand::thread_rng();
            let len = rng.gen_range(8..=96);
            let mut bytes = vec![0u8; len];
            rng.fill(bytes.as_mut_slice());
            hex::encode(bytes)
        };

        match Message::ping(inner.local_id.clone()) {
            Ok(mut cover) => {
                cover.payload = padding;
                let _ = send_inner(&inner, &peer_id, &cover, "Transport error").await;
            }
            Err(err) => warn!(%err, "Cover ping construction failed"),
        }
    }
}
