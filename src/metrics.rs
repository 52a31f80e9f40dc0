//! Per-service request metrics and Prometheus export.

use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::AtomicU64;
use std::time::Duration;
use tracing::debug;

/// Aggregated metrics for one service.
///
/// `latency_avg` follows `new = (old + sample) / 2`, a decaying average that
/// existing dashboards read as-is. `latency_p95` and `latency_p99` are
/// nearest-rank percentiles over the last [`LATENCY_WINDOW`] samples.
/// `cache_hit_rate` covers every response cache lookup made for the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshMetrics {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_error: u64,
    /// Milliseconds.
    pub latency_avg: f64,
    /// Milliseconds.
    pub latency_p95: f64,
    /// Milliseconds.
    pub latency_p99: f64,
    pub circuit_breaker_trips: u64,
    pub cache_hit_rate: f64,
}

/// Latency samples kept per service for percentile estimates.
pub const LATENCY_WINDOW: usize = 512;

/// Labels for per-service metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub service: String,
}

/// Labels for request outcome counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub service: String,
    /// "success" or "error".
    pub outcome: String,
}

struct Exporter {
    registry: Registry,
    requests_total: Family<OutcomeLabels, Counter>,
    request_duration_seconds: Family<ServiceLabels, Histogram>,
    circuit_breaker_trips: Family<ServiceLabels, Counter>,
    latency_avg_ms: Family<ServiceLabels, Gauge<f64, AtomicU64>>,
    cache_hit_ratio: Family<ServiceLabels, Gauge<f64, AtomicU64>>,
}

impl Exporter {
    fn new() -> Self {
        let mut registry = Registry::with_prefix("mesh");

        let requests_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "requests",
            "Total number of routed requests",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<ServiceLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 12))
            });
        registry.register(
            "request_duration_seconds",
            "Routed request latency in seconds",
            request_duration_seconds.clone(),
        );

        let circuit_breaker_trips = Family::<ServiceLabels, Counter>::default();
        registry.register(
            "circuit_breaker_trips",
            "Number of times a service circuit breaker opened",
            circuit_breaker_trips.clone(),
        );

        let latency_avg_ms = Family::<ServiceLabels, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "latency_avg_ms",
            "Decaying average request latency in milliseconds",
            latency_avg_ms.clone(),
        );

        let cache_hit_ratio = Family::<ServiceLabels, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "cache_hit_ratio",
            "Fraction of response cache lookups that hit",
            cache_hit_ratio.clone(),
        );

        Self {
            registry,
            cache_hit_ratio,
            requests_total,
            request_duration_seconds,
            circuit_breaker_trips,
            latency_avg_ms,
        }
    }
}

/// Holds exactly one [`MeshMetrics`] per registered service.
pub struct MetricsAggregator {
    services: DashMap<String, MeshMetrics>,
    latencies: DashMap<String, VecDeque<f64>>,
    /// Cache (hits, misses) per service.
    cache_lookups: DashMap<String, (u64, u64)>,
    exporter: Mutex<Exporter>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            latencies: DashMap::new(),
            cache_lookups: DashMap::new(),
            exporter: Mutex::new(Exporter::new()),
        }
    }

    /// Creates the record for `service` if it does not exist yet.
    pub fn register_service(&self, service: &str) {
        self.services.entry(service.to_string()).or_default();
    }

    /// Returns true if `service` has a record.
    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// Records the outcome of one routed request and returns the updated
    /// snapshot.
    pub fn record_request(&self, service: &str, success: bool, latency: Duration) -> MeshMetrics {
        let sample_ms = latency.as_secs_f64() * 1000.0;
        let (p95, p99) = {
            let mut window = self.latencies.entry(service.to_string()).or_default();
            if window.len() == LATENCY_WINDOW {
                window.pop_front();
            }
            window.push_back(sample_ms);
            let mut sorted: Vec<f64> = window.iter().copied().collect();
            sorted.sort_by(f64::total_cmp);
            (percentile(&sorted, 0.95), percentile(&sorted, 0.99))
        };

        let snapshot = {
            let mut metrics = self.services.entry(service.to_string()).or_default();
            metrics.requests_total += 1;
            if success {
                metrics.requests_success += 1;
            } else {
                metrics.requests_error += 1;
            }
            metrics.latency_avg = (metrics.latency_avg + sample_ms) / 2.0;
            metrics.latency_p95 = p95;
            metrics.latency_p99 = p99;
            metrics.clone()
        };

        let exporter = self.exporter.lock();
        let outcome = if success { "success" } else { "error" };
        exporter
            .requests_total
            .get_or_create(&OutcomeLabels {
                service: service.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        let labels = ServiceLabels {
            service: service.to_string(),
        };
        exporter
            .request_duration_seconds
            .get_or_create(&labels)
            .observe(latency.as_secs_f64());
        exporter
            .latency_avg_ms
            .get_or_create(&labels)
            .set(snapshot.latency_avg);

        debug!(
            service = %service,
            success,
            latency_ms = sample_ms,
            total = snapshot.requests_total,
            "metrics updated"
        );
        snapshot
    }

    /// Counts one circuit breaker activation.
    pub fn record_circuit_breaker_trip(&self, service: &str) {
        self.services
            .entry(service.to_string())
            .or_default()
            .circuit_breaker_trips += 1;
        self.exporter
            .lock()
            .circuit_breaker_trips
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .inc();
    }

    /// Counts one response cache lookup and returns the service's updated
    /// hit rate.
    pub fn record_cache_lookup(&self, service: &str, hit: bool) -> f64 {
        let hit_rate = {
            let mut lookups = self.cache_lookups.entry(service.to_string()).or_default();
            if hit {
                lookups.0 += 1;
            } else {
                lookups.1 += 1;
            }
            lookups.0 as f64 / (lookups.0 + lookups.1) as f64
        };

        if let Some(mut metrics) = self.services.get_mut(service) {
            metrics.cache_hit_rate = hit_rate;
        }
        self.exporter
            .lock()
            .cache_hit_ratio
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .set(hit_rate);
        hit_rate
    }

    /// Returns a copy of the metrics for `service`.
    pub fn get(&self, service: &str) -> Option<MeshMetrics> {
        self.services.get(service).map(|m| m.clone())
    }

    /// Returns a copy of every record, sorted by service name.
    pub fn snapshot(&self) -> Vec<(String, MeshMetrics)> {
        let mut all: Vec<_> = self
            .services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Encodes the exporter registry in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, io::Error> {
        let exporter = self.exporter.lock();
        let mut buffer = String::new();
        encode(&mut buffer, &exporter.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;
        Ok(buffer)
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
