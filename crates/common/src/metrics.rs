//! Metrics collection for ModelPlay
//!
//! Prometheus metrics for worker lifecycle, inference and chain execution.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for ModelPlay
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub worker: WorkerMetrics,
    pub inference: InferenceMetrics,
    pub chain: ChainMetrics,
}

/// Worker lifecycle metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Worker processes spawned
    pub spawned_total: IntCounter,

    /// Spawn attempts or handshakes that failed
    pub spawn_failures_total: IntCounter,

    /// Workers found dead or torn down after a transport failure
    pub crashes_total: IntCounter,

    /// Workers currently Ready or Busy
    pub live_workers: IntGauge,

    /// Handshake duration
    pub handshake_duration: Histogram,
}

/// Single-model inference metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Total number of inference requests
    pub requests_total: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// Round-trip duration, including time spent queued on the worker lock
    pub request_duration: Histogram,
}

/// Playground chain metrics
#[derive(Debug, Clone)]
pub struct ChainMetrics {
    /// Chains loaded
    pub loads_total: IntCounter,

    /// Chain loads rolled back after a failure
    pub load_rollbacks_total: IntCounter,

    /// Chains stopped
    pub stops_total: IntCounter,

    /// Playgrounds with an active chain
    pub active_chains: IntGauge,

    /// End-to-end chain inference duration
    pub inference_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let metric =
        Histogram::with_opts(prometheus::HistogramOpts::new(name, help).buckets(buckets)).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let worker = WorkerMetrics {
            spawned_total: counter(&registry, "worker_spawned_total", "Worker processes spawned"),
            spawn_failures_total: counter(
                &registry,
                "worker_spawn_failures_total",
                "Worker spawns or load handshakes that failed",
            ),
            crashes_total: counter(
                &registry,
                "worker_crashes_total",
                "Workers that died or were reaped after a transport failure",
            ),
            live_workers: gauge(&registry, "worker_live", "Workers currently serving requests"),
            handshake_duration: histogram(
                &registry,
                "worker_handshake_duration_seconds",
                "Time from spawn to load handshake",
                vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0],
            ),
        };

        let inference = InferenceMetrics {
            requests_total: counter(
                &registry,
                "inference_requests_total",
                "Total number of inference requests",
            ),
            requests_failed: counter(
                &registry,
                "inference_requests_failed_total",
                "Total number of failed inference requests",
            ),
            request_duration: histogram(
                &registry,
                "inference_request_duration_seconds",
                "Inference round-trip duration in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            ),
        };

        let chain = ChainMetrics {
            loads_total: counter(&registry, "chain_loads_total", "Playground chains loaded"),
            load_rollbacks_total: counter(
                &registry,
                "chain_load_rollbacks_total",
                "Playground chain loads rolled back after a failure",
            ),
            stops_total: counter(&registry, "chain_stops_total", "Playground chains stopped"),
            active_chains: gauge(&registry, "chain_active", "Playgrounds with an active chain"),
            inference_duration: histogram(
                &registry,
                "chain_inference_duration_seconds",
                "End-to-end chain inference duration in seconds",
                vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            ),
        };

        MetricsRegistry {
            registry,
            worker,
            inference,
            chain,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a future
    fn observe_async<F, R>(&self, f: F) -> impl std::future::Future<Output = R> + Send
    where
        F: std::future::Future<Output = R> + Send,
        R: Send;
}

impl LatencyTimer for Histogram {
    fn observe_async<F, R>(&self, f: F) -> impl std::future::Future<Output = R> + Send
    where
        F: std::future::Future<Output = R> + Send,
        R: Send,
    {
        let timer = self.start_timer();
        async move {
            let result = f.await;
            timer.observe_duration();
            result
        }
    }
}
