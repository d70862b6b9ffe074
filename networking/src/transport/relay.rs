//! Relay fallback transport.
//!
//! A node keeps at most one connection to a relay endpoint and multiplexes
//! every relayed peer over it, demultiplexing inbound envelopes by their
//! `from` field. Opening a peer sends a `connect` envelope and waits for the
//! relay's explicit `connected` acknowledgment before the peer counts as
//! reachable.
//!
//! The forwarding endpoint itself ([`RelayServer`]) lives here too: it
//! accepts registrations, answers `connect` envelopes, and forwards
//! `message` envelopes between registered nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use protocol::{NodeId, PublicKey};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::direct::{DirectReceiver, DirectSender, split};
use crate::error::{NetworkError, NetworkResult};

/// Envelope spoken between nodes and relay endpoints.
///
/// `connect` with no `to` registers the sending node at the relay; with a
/// `to` it asks the relay to introduce the sender to the target. The relay
/// answers both with `connected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEnvelope {
    Connect {
        from: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<NodeId>,
        #[serde(
            rename = "publicKey",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        public_key: Option<PublicKey>,
    },
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<NodeId>,
        #[serde(
            rename = "publicKey",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        public_key: Option<PublicKey>,
    },
    Message {
        from: NodeId,
        to: NodeId,
        payload: String,
    },
}

/// An inbound `connect` envelope surfaced to the connection manager.
///
/// Carries the already-installed read half so no frame can race the
/// introduction through the demux table.
pub struct InboundRelayPeer {
    pub from: NodeId,
    pub public_key: Option<PublicKey>,
    pub receiver: RelayReceiver,
}

struct RelayShared {
    local_id: NodeId,
    local_key: PublicKey,
    /// `None` until registered, and again after the relay connection drops.
    writer: tokio::sync::Mutex<Option<DirectSender>>,
    /// Demux: inbound `message` payloads by sending peer.
    routes: parking_lot::Mutex<HashMap<NodeId, mpsc::UnboundedSender<String>>>,
    /// Waiters for `connected` acks; `None` keys the registration ack.
    acks: parking_lot::Mutex<HashMap<Option<NodeId>, oneshot::Sender<RelayEnvelope>>>,
    inbound: mpsc::UnboundedSender<InboundRelayPeer>,
    reader_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Client half of the relay fallback; one per connection manager.
#[derive(Clone)]
pub struct RelayClient {
    shared: Arc<RelayShared>,
}

impl RelayClient {
    pub fn new(
        local_id: NodeId,
        local_key: PublicKey,
        inbound: mpsc::UnboundedSender<InboundRelayPeer>,
    ) -> Self {
        RelayClient {
            shared: Arc::new(RelayShared {
                local_id,
                local_key,
                writer: tokio::sync::Mutex::new(None),
                routes: parking_lot::Mutex::new(HashMap::new()),
                acks: parking_lot::Mutex::new(HashMap::new()),
                inbound,
                reader_task: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.writer.lock().await.is_some()
    }

    /// Dial the configured endpoints in order and register at the first one
    /// that acknowledges. No-op when already registered.
    pub async fn connect(
        &self,
        endpoints: &[String],
        attempt_timeout: Duration,
        max_retries: usize,
    ) -> NetworkResult<()> {
        if self.is_connected().await {
            return Ok(());
        }

        let mut last_error = "no relay endpoints configured".to_owned();
        for endpoint in endpoints.iter().take(max_retries.max(1)) {
            match self.try_endpoint(endpoint, attempt_timeout).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(endpoint = %endpoint, %err, "Relay endpoint failed");
                    last_error = format!("{endpoint}: {err}");
                }
            }
        }
        Err(NetworkError::TransportUnavailable(last_error))
    }

    async fn try_endpoint(
        &self,
        endpoint: &str,
        attempt_timeout: Duration,
    ) -> NetworkResult<()> {
        let stream = tokio::time::timeout(attempt_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| NetworkError::Transport("connect timed out".to_owned()))?
            .map_err(|err| NetworkError::Transport(err.to_string()))?;
        let (sender, receiver) = split(stream);

        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.acks.lock().insert(None, ack_tx);

        let register = RelayEnvelope::Connect {
            from: self.shared.local_id.clone(),
            to: None,
            public_key: Some(self.shared.local_key),
        };
        sender.send(&encode(&register)?).await?;

        // The reader must be running before the ack can arrive.
        *self.shared.writer.lock().await = Some(sender);
        let task = tokio::spawn(read_loop(self.shared.clone(), receiver));
        if let Some(previous) = self.shared.reader_task.lock().replace(task) {
            previous.abort();
        }

        match tokio::time::timeout(attempt_timeout, ack_rx).await {
            Ok(Ok(_)) => Ok(()),
            _ => {
                self.shared.acks.lock().remove(&None);
                self.disconnect().await;
                Err(NetworkError::Transport(
                    "relay registration not acknowledged".to_owned(),
                ))
            }
        }
    }

    /// Ask the relay to introduce us to `to`, waiting for the explicit
    /// acknowledgment before handing back channel halves.
    pub async fn open_peer(
        &self,
        to: &NodeId,
        attempt_timeout: Duration,
    ) -> NetworkResult<(RelaySender, RelayReceiver)> {
        // Install the route first so frames racing the ack are not lost.
        let receiver = self.accept_peer(to);

        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.acks.lock().insert(Some(to.clone()), ack_tx);

        let connect = RelayEnvelope::Connect {
            from: self.shared.local_id.clone(),
            to: Some(to.clone()),
            public_key: Some(self.shared.local_key),
        };
        if let Err(err) = self.send_raw(&encode(&connect)?).await {
            self.shared.acks.lock().remove(&Some(to.clone()));
            self.close_peer(to);
            return Err(err);
        }

        match tokio::time::timeout(attempt_timeout, ack_rx).await {
            Ok(Ok(_)) => Ok((self.sender_for(to), receiver)),
            _ => {
                self.shared.acks.lock().remove(&Some(to.clone()));
                self.close_peer(to);
                Err(NetworkError::TransportUnavailable(format!(
                    "relay did not acknowledge connect to {to}"
                )))
            }
        }
    }

    /// Install a demux route for a peer we are opening ourselves.
    fn accept_peer(&self, from: &NodeId) -> RelayReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.routes.lock().insert(from.clone(), tx);
        RelayReceiver { rx }
    }

    pub fn sender_for(&self, to: &NodeId) -> RelaySender {
        RelaySender {
            shared: self.shared.clone(),
            to: to.clone(),
        }
    }

    pub fn close_peer(&self, peer: &NodeId) {
        self.shared.routes.lock().remove(peer);
    }

    async fn send_raw(&self, frame: &str) -> NetworkResult<()> {
        match self.shared.writer.lock().await.as_ref() {
            Some(writer) => writer.send(frame).await,
            None => Err(NetworkError::Transport(
                "relay connection closed".to_owned(),
            )),
        }
    }

    async fn disconnect(&self) {
        if let Some(writer) = self.shared.writer.lock().await.take() {
            writer.close().await;
        }
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.shared.reader_task.lock().take() {
            task.abort();
        }
        self.disconnect().await;
        self.shared.routes.lock().clear();
        self.shared.acks.lock().clear();
    }
}

async fn read_loop(shared: Arc<RelayShared>, mut receiver: DirectReceiver) {
    while let Some(frame) = receiver.next_frame().await {
        let envelope: RelayEnvelope = match serde_json::from_str(&frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, "Malformed relay envelope");
                continue;
            }
        };

        match envelope {
            RelayEnvelope::Connected { from, .. } => {
                if let Some(waiter) = shared.acks.lock().remove(&from) {
                    let _ = waiter.send(RelayEnvelope::Connected {
                        from,
                        to: None,
                        public_key: None,
                    });
                }
            }
            RelayEnvelope::Connect {
                from, public_key, ..
            } => {
                // Route first: frames forwarded right behind the connect
                // envelope must land in the new peer's queue, not the floor.
                let (tx, rx) = mpsc::unbounded_channel();
                shared.routes.lock().insert(from.clone(), tx);
                let _ = shared.inbound.send(InboundRelayPeer {
                    from,
                    public_key,
                    receiver: RelayReceiver { rx },
                });
            }
            RelayEnvelope::Message { from, payload, .. } => {
                let delivered = shared
                    .routes
                    .lock()
                    .get(&from)
                    .map(|route| route.send(payload).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    debug!(peer = %from, "Dropped relayed frame for unknown peer");
                }
            }
        }
    }

    // Relay connection gone: closing every route ends the per-peer reader
    // tasks, which the manager observes as transport failures.
    *shared.writer.lock().await = None;
    shared.routes.lock().clear();
    shared.acks.lock().clear();
}

fn encode(envelope: &RelayEnvelope) -> NetworkResult<String> {
    serde_json::to_string(envelope).map_err(|err| NetworkError::Transport(err.to_string()))
}

/// Write half of a relayed peer channel.
#[derive(Clone)]
pub struct RelaySender {
    shared: Arc<RelayShared>,
    to: NodeId,
}

impl RelaySender {
    pub async fn send(&self, frame: &str) -> NetworkResult<()> {
        let envelope = RelayEnvelope::Message {
            from: self.shared.local_id.clone(),
            to: self.to.clone(),
            payload: frame.to_owned(),
        };
        let encoded = encode(&envelope)?;
        match self.shared.writer.lock().await.as_ref() {
            Some(writer) => writer.send(&encoded).await,
            None => Err(NetworkError::Transport(
                "relay connection closed".to_owned(),
            )),
        }
    }

    pub fn close(&self) {
        self.shared.routes.lock().remove(&self.to);
    }
}

/// Read half of a relayed peer channel.
pub struct RelayReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

impl RelayReceiver {
    pub async fn next_frame(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

struct Registration {
    outbound: mpsc::UnboundedSender<RelayEnvelope>,
    public_key: Option<PublicKey>,
}

/// The forwarding endpoint relayed traffic flows through.
pub struct RelayServer {
    listener: TcpListener,
    registrations: Arc<parking_lot::Mutex<HashMap<NodeId, Registration>>>,
}

impl RelayServer {
    pub async fn bind(addr: &str) -> NetworkResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| NetworkError::Fatal(format!("bind {addr}: {err}")))?;
        Ok(RelayServer {
            listener,
            registrations: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> NetworkResult<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|err| NetworkError::Fatal(err.to_string()))
    }

    /// Accept and serve connections until the task is dropped or aborted.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "Relay connection accepted");
                    tokio::spawn(serve_connection(stream, self.registrations.clone()));
                }
                Err(err) => {
                    warn!(%err, "Relay accept failed");
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    registrations: Arc<parking_lot::Mutex<HashMap<NodeId, Registration>>>,
) {
    let (sender, mut receiver) = split(stream);

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<RelayEnvelope>();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(frame) => {
                    if sender.send(&frame).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(%err, "Relay envelope encode failed"),
            }
        }
    });

    let mut owned: Option<NodeId> = None;
    while let Some(frame) = receiver.next_frame().await {
        let envelope: RelayEnvelope = match serde_json::from_str(&frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, "Relay received malformed envelope");
                continue;
            }
        };

        match envelope {
            // Registration: remember the node and acknowledge.
            RelayEnvelope::Connect {
                from,
                to: None,
                public_key,
            } => {
                registrations.lock().insert(
                    from.clone(),
                    Registration {
                        outbound: outbound_tx.clone(),
                        public_key,
                    },
                );
                owned = Some(from.clone());
                let _ = outbound_tx.send(RelayEnvelope::Connected {
                    from: None,
                    to: Some(from),
                    public_key: None,
                });
            }
            // Introduction: forward to the target, acknowledge to the caller.
            RelayEnvelope::Connect {
                from,
                to: Some(target),
                public_key,
            } => {
                let reply = {
                    let table = registrations.lock();
                    table.get(&target).map(|registration| {
                        let _ = registration.outbound.send(RelayEnvelope::Connect {
                            from: from.clone(),
                            to: Some(target.clone()),
                            public_key,
                        });
                        RelayEnvelope::Connected {
                            from: Some(target.clone()),
                            to: Some(from.clone()),
                            public_key: registration.public_key,
                        }
                    })
                };
                match reply {
                    Some(ack) => {
                        let _ = outbound_tx.send(ack);
                    }
                    // Unknown target: no ack; the caller times out and
                    // moves on to its next endpoint.
                    None => debug!(peer = %target, "Connect to unregistered node"),
                }
            }
            RelayEnvelope::Message { ref to, .. } => {
                let delivered = registrations
                    .lock()
                    .get(to)
                    .map(|registration| registration.outbound.send(envelope.clone()).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    debug!(peer = %to, "Dropped envelope for unregistered node");
                }
            }
            RelayEnvelope::Connected { .. } => {}
        }
    }

    if let Some(id) = owned {
        registrations.lock().remove(&id);
    }
    writer.abort();
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let from = NodeId::generate_at(1).unwrap();
        let to = NodeId::generate_at(2).unwrap();

        let envelope = RelayEnvelope::Message {
            from: from.clone(),
            to: to.clone(),
            payload: "{}".to_owned(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["from"], from.as_str());
        assert_eq!(value["to"], to.as_str());
        assert_eq!(value["payload"], "{}");

        let register = RelayEnvelope::Connect {
            from,
            to: None,
            public_key: Some(PublicKey([7u8; 32])),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&register).unwrap()).unwrap();
        assert_eq!(value["type"], "connect");
        assert!(value.get("to").is_none());
        assert_eq!(value["publicKey"][0], 7);
    }

    #[tokio::test]
    async fn register_open_and_exchange() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = server.local_addr().unwrap().to_string();
        let server_task = tokio::spawn(server.run());

        let id_a = NodeId::generate_at(1).unwrap();
        let id_b = NodeId::generate_at(2).unwrap();
        let (inbound_a_tx, _inbound_a) = mpsc::unbounded_channel();
        let (inbound_b_tx, mut inbound_b) = mpsc::unbounded_channel();

        let client_a = RelayClient::new(id_a.clone(), PublicKey([1; 32]), inbound_a_tx);
        let client_b = RelayClient::new(id_b.clone(), PublicKey([2; 32]), inbound_b_tx);

        let timeout = Duration::from_secs(2);
        client_a
            .connect(std::slice::from_ref(&relay_addr), timeout, 3)
            .await
            .unwrap();
        client_b
            .connect(std::slice::from_ref(&relay_addr), timeout, 3)
            .await
            .unwrap();

        let (sender_ab, mut receiver_ab) = client_a.open_peer(&id_b, timeout).await.unwrap();

        // B sees the introduction, with A's public key attached.
        let introduced = inbound_b.recv().await.unwrap();
        assert_eq!(introduced.from, id_a);
        assert_eq!(introduced.public_key, Some(PublicKey([1; 32])));

        let mut receiver_ba = introduced.receiver;
        let sender_ba = client_b.sender_for(&id_a);

        sender_ab.send("over the wall").await.unwrap();
        assert_eq!(receiver_ba.next_frame().await.unwrap(), "over the wall");

        sender_ba.send("and back").await.unwrap();
        assert_eq!(receiver_ab.next_frame().await.unwrap(), "and back");

        client_a.shutdown().await;
        client_b.shutdown().await;
        server_task.abort();
    }

    #[tokio::test]
    async fn open_unregistered_peer_times_out() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = server.local_addr().unwrap().to_string();
        let server_task = tokio::spawn(server.run());

        let (inbound_tx, _inbound) = mpsc::unbounded_channel();
        let client = RelayClient::new(
            NodeId::generate_at(1).unwrap(),
            PublicKey([1; 32]),
            inbound_tx,
        );
        client
            .connect(
                std::slice::from_ref(&relay_addr),
                Duration::from_secs(2),
                3,
            )
            .await
            .unwrap();

        let ghost = NodeId::generate_at(9).unwrap();
        let result = client
            .open_peer(&ghost, Duration::from_millis(200))
            .await;
        assert!(matches!(
            result,
            Err(NetworkError::TransportUnavailable(_))
        ));

        client.shutdown().await;
        server_task.abort();
    }
}
