//! Metrics collection and HTTP exposure for the broker (ambient, §4.11).
//!
//! Deliberately lighter than the per-topic throughput ring buffer this
//! codebase's other broker keeps, since dispatch decisions here never
//! depend on rate — just running counters and a per-service snapshot,
//! exposed the same way: an optional `axum` `GET /metrics` JSON endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;

/// JSON-serializable per-service snapshot for the HTTP response.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub queue_depth: usize,
    pub idle_workers: usize,
}

/// Complete JSON response from `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub requests_dispatched: u64,
    pub heartbeats_sent: u64,
    pub workers_purged: u64,
    pub protocol_violations: u64,
    pub services: HashMap<String, ServiceMetrics>,
    pub uptime_secs: f64,
}

#[derive(Debug, Default)]
struct Counters {
    requests_dispatched: AtomicU64,
    heartbeats_sent: AtomicU64,
    workers_purged: AtomicU64,
    protocol_violations: AtomicU64,
}

/// Thread-safe counters tracking the broker's ambient stats.
///
/// Purely observational: nothing here feeds back into the dispatcher.
#[derive(Debug, Clone)]
pub struct BrokerMetrics {
    counters: Arc<Counters>,
    services: Arc<Mutex<HashMap<String, ServiceMetrics>>>,
    start: Instant,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            services: Arc::new(Mutex::new(HashMap::new())),
            start: Instant::now(),
        }
    }

    pub fn record_dispatch(&self) {
        self.counters.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_sent(&self) {
        self.counters.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_workers_purged(&self, n: u64) {
        self.counters.workers_purged.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_protocol_violation(&self) {
        self.counters.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_dispatched(&self) -> u64 {
        self.counters.requests_dispatched.load(Ordering::Relaxed)
    }

    /// Replace the per-service queue-depth/idle-worker snapshot. Called once
    /// per broker tick from the registry's current state.
    pub async fn update_services(&self, snapshot: HashMap<String, ServiceMetrics>) {
        *self.services.lock().await = snapshot;
    }

    pub async fn snapshot(&self) -> MetricsResponse {
        MetricsResponse {
            requests_dispatched: self.counters.requests_dispatched.load(Ordering::Relaxed),
            heartbeats_sent: self.counters.heartbeats_sent.load(Ordering::Relaxed),
            workers_purged: self.counters.workers_purged.load(Ordering::Relaxed),
            protocol_violations: self.counters.protocol_violations.load(Ordering::Relaxed),
            services: self.services.lock().await.clone(),
            uptime_secs: self.start.elapsed().as_secs_f64(),
        }
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the metrics HTTP server on the given port.
pub fn spawn_metrics_server(
    port: u16,
    metrics: BrokerMetrics,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route("/metrics", axum::routing::get(metrics_handler))
            .with_state(metrics);

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(port, error = %e, "failed to bind metrics HTTP server");
                return;
            }
        };

        tracing::info!(port, "metrics HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown;
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .ok();

        tracing::info!("metrics HTTP server stopped");
    })
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<BrokerMetrics>,
) -> axum::Json<MetricsResponse> {
    axum::Json(metrics.snapshot().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_start_at_zero() {
        let m = BrokerMetrics::new();
        let snap = m.snapshot().await;
        assert_eq!(snap.requests_dispatched, 0);
        assert_eq!(snap.heartbeats_sent, 0);
        assert_eq!(snap.workers_purged, 0);
        assert_eq!(snap.protocol_violations, 0);
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let m = BrokerMetrics::new();
        m.record_dispatch();
        m.record_dispatch();
        m.record_heartbeat_sent();
        m.record_workers_purged(3);
        m.record_protocol_violation();

        let snap = m.snapshot().await;
        assert_eq!(snap.requests_dispatched, 2);
        assert_eq!(snap.heartbeats_sent, 1);
        assert_eq!(snap.workers_purged, 3);
        assert_eq!(snap.protocol_violations, 1);
    }

    #[tokio::test]
    async fn service_snapshot_roundtrips() {
        let m = BrokerMetrics::new();
        let mut snapshot = HashMap::new();
        snapshot.insert(
            "echo".to_string(),
            ServiceMetrics {
                queue_depth: 2,
                idle_workers: 1,
            },
        );
        m.update_services(snapshot).await;

        let snap = m.snapshot().await;
        assert_eq!(snap.services["echo"].queue_depth, 2);
        assert_eq!(snap.services["echo"].idle_workers, 1);
    }
}
