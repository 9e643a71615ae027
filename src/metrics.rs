// Numan Thabit 2026
// metrics.rs - Prometheus registry for the IPC substrate
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub bytes_in: IntCounter,
    pub bytes_out: IntCounter,
    pub sockets_accepted: IntCounter,
    pub sockets_connected: IntCounter,
    pub sockets_closed: IntCounter,
    pub connect_refused: IntCounter,
    pub connect_timeouts: IntCounter,
    pub tls_handshakes: IntCounter,
    pub tls_failures: IntCounter,
    pub throttle_stalls: IntCounter,
    pub bridges_opened: IntCounter,
    pub bridges_retired: IntCounter,
    pub bridge_errors: IntCounter,
    pub peers_created: IntCounter,
    pub peers_expired: IntCounter,
    pub peer_backlog_depth: IntGauge,
    pub jsonrpc_calls: IntCounter,
    pub jsonrpc_violations: IntCounter,
    pub bridge_cmd_errors: IntCounter,
    pub read_chunk_bytes: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("numibus".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        macro_rules! register_histogram {
            ($name:expr, $help:expr, $buckets:expr) => {{
                let opts = HistogramOpts::new($name, $help).buckets($buckets.to_vec());
                let hist = Histogram::with_opts(opts)?;
                registry.register(Box::new(hist.clone()))?;
                hist
            }};
        }

        let bytes_in = register_counter!("bytes_in_total", "Plaintext bytes read by applications");
        let bytes_out =
            register_counter!("bytes_out_total", "Plaintext bytes written by applications");
        let sockets_accepted =
            register_counter!("sockets_accepted_total", "Connections accepted by listeners");
        let sockets_connected = register_counter!(
            "sockets_connected_total",
            "Outbound connections established"
        );
        let sockets_closed = register_counter!("sockets_closed_total", "Sockets fully closed");
        let connect_refused =
            register_counter!("connect_refused_total", "Outbound connections refused");
        let connect_timeouts =
            register_counter!("connect_timeouts_total", "Outbound connections timed out");
        let tls_handshakes = register_counter!("tls_handshakes_total", "TLS handshakes completed");
        let tls_failures = register_counter!("tls_failures_total", "Fatal TLS failures");
        let throttle_stalls = register_counter!(
            "throttle_stalls_total",
            "Reads or writes deferred by a throttle"
        );
        let bridges_opened =
            register_counter!("bridges_opened_total", "Reverse-proxy bridges opened");
        let bridges_retired =
            register_counter!("bridges_retired_total", "Reverse-proxy bridges destroyed");
        let bridge_errors = register_counter!("bridge_errors_total", "Reverse-proxy bridge errors");
        let peers_created = register_counter!("peers_created_total", "Peers registered");
        let peers_expired =
            register_counter!("peers_expired_total", "Peers removed by the cleanup sweep");
        let peer_backlog_depth =
            register_gauge!("peer_backlog_depth", "Frames parked in peer backlogs");
        let jsonrpc_calls = register_counter!("jsonrpc_calls_total", "JSON-RPC calls issued");
        let jsonrpc_violations = register_counter!(
            "jsonrpc_violations_total",
            "JSON-RPC messages rejected as protocol violations"
        );
        let bridge_cmd_errors = register_counter!(
            "bridge_cmd_errors_total",
            "D-Bus bridge commands answered with an error"
        );
        let read_chunk_bytes = register_histogram!(
            "read_chunk_bytes",
            "Sizes of chunks handed to application reads",
            &[64.0, 512.0, 1024.0, 4096.0, 16384.0, 65536.0]
        );

        Ok(Self {
            registry,
            bytes_in,
            bytes_out,
            sockets_accepted,
            sockets_connected,
            sockets_closed,
            connect_refused,
            connect_timeouts,
            tls_handshakes,
            tls_failures,
            throttle_stalls,
            bridges_opened,
            bridges_retired,
            bridge_errors,
            peers_created,
            peers_expired,
            peer_backlog_depth,
            jsonrpc_calls,
            jsonrpc_violations,
            bridge_cmd_errors,
            read_chunk_bytes,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}
