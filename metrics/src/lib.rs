use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::State, routing::get};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    peers: IntGauge,
    messages: IntCounterVec,
    dropped: IntCounterVec,
    gossip_queue_depth: IntGauge,
    gossip_forwarded: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let peers = IntGauge::with_opts(Opts::new(
            "murmur_peers_connected",
            "Number of peers in a sending state",
        ))
        .unwrap();
        registry.register(Box::new(peers.clone())).unwrap();

        let messages = IntCounterVec::new(
            Opts::new("murmur_messages_total", "Messages by direction and kind"),
            &["direction", "kind"],
        )
        .unwrap();
        registry.register(Box::new(messages.clone())).unwrap();

        let dropped = IntCounterVec::new(
            Opts::new("murmur_messages_dropped_total", "Dropped messages by reason"),
            &["reason"],
        )
        .unwrap();
        registry.register(Box::new(dropped.clone())).unwrap();

        let gossip_queue_depth = IntGauge::with_opts(Opts::new(
            "murmur_gossip_queue_depth",
            "Broadcasts awaiting propagation",
        ))
        .unwrap();
        registry
            .register(Box::new(gossip_queue_depth.clone()))
            .unwrap();

        let gossip_forwarded = IntCounter::with_opts(Opts::new(
            "murmur_gossip_forwarded_total",
            "Broadcasts forwarded by the propagation tick",
        ))
        .unwrap();
        registry
            .register(Box::new(gossip_forwarded.clone()))
            .unwrap();

        Self {
            registry,
            peers,
            messages,
            dropped,
            gossip_queue_depth,
            gossip_forwarded,
        }
    }

    pub fn gather(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .expect("failed to encode metrics");
        String::from_utf8(buffer).expect("metrics not utf8")
    }

    pub fn set_peers(&self, v: i64) {
        self.peers.set(v);
    }

    pub fn inc_message(&self, direction: &str, kind: &str) {
        self.messages.with_label_values(&[direction, kind]).inc();
    }

    pub fn inc_dropped(&self, reason: &str) {
        self.dropped.with_label_values(&[reason]).inc();
    }

    pub fn set_gossip_queue_depth(&self, v: i64) {
        self.gossip_queue_depth.set(v);
    }

    pub fn inc_forwarded(&self) {
        self.gossip_forwarded.inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;

/// Prometheus text endpoint. Bound separately from `run` so callers can
/// bind port 0 and read the address back, the same way the overlay's
/// listeners work.
pub struct MetricsServer {
    listener: TcpListener,
    metrics: SharedMetrics,
}

impl MetricsServer {
    pub async fn bind(addr: SocketAddr, metrics: SharedMetrics) -> std::io::Result<Self> {
        Ok(MetricsServer {
            listener: TcpListener::bind(addr).await?,
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve `/metrics` until the task is dropped or aborted.
    pub async fn run(self) -> std::io::Result<()> {
        async fn render(State(metrics): State<SharedMetrics>) -> String {
            metrics.gather()
        }

        let router = Router::new()
            .route("/metrics", get(render))
            .with_state(self.metrics);
        axum::serve(self.listener, router).await
    }
}
