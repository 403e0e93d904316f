//! Proxy request metrics
//!
//! Every completed request is recorded on OpenTelemetry instruments from the
//! global `clustergate` meter, so whichever meter provider the process
//! installs receives them. [`ProxyMetrics`] also keeps per-status totals for
//! the manager's own status reporting and for tests.
//!
//! Upgrade requests (exec, attach, port-forward) only bump
//! [`PROXY_UPGRADES`]. They are long-lived streams and are never timed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use serde::Serialize;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("clustergate"));

/// Counter of proxied requests
///
/// Labels:
/// - `backend`: k8s, mesos
/// - `cluster`: target cluster id
/// - `method`: HTTP method
/// - `status`: 2xx, 4xx, 5xx
pub static PROXY_REQUESTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("clustergate_proxy_requests_total")
        .with_description("Total number of proxied cluster API requests")
        .with_unit("{requests}")
        .build()
});

/// Histogram of proxied request duration
///
/// Labels:
/// - `backend`, `cluster`, `method`
pub static PROXY_REQUEST_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("clustergate_proxy_request_duration_seconds")
        .with_description("Duration of proxied cluster API requests in seconds")
        .with_unit("s")
        .build()
});

/// Counter of upgraded streams opened through the proxy
///
/// Labels:
/// - `backend`, `cluster`
pub static PROXY_UPGRADES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("clustergate_proxy_upgrades_total")
        .with_description("Total number of upgraded streams opened through the proxy")
        .with_unit("{streams}")
        .build()
});

/// Status class of a proxied response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// 2xx/3xx
    Success,
    /// 4xx
    ClientError,
    /// 5xx, or no response at all
    ServerError,
}

impl ProxyStatus {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "2xx",
            Self::ClientError => "4xx",
            Self::ServerError => "5xx",
        }
    }

    /// Classify an HTTP status code
    pub fn from_status_code(code: u16) -> Self {
        match code {
            100..=399 => Self::Success,
            400..=499 => Self::ClientError,
            _ => Self::ServerError,
        }
    }
}

/// Which dispatcher handled a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    K8s,
    Mesos,
}

impl Backend {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::K8s => "k8s",
            Self::Mesos => "mesos",
        }
    }
}

/// Point-in-time copy of the totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub success: u64,
    pub client_error: u64,
    pub server_error: u64,
    pub upgrades: u64,
    pub latency_ms_total: u64,
}

/// Recorder for proxied traffic, shared by both dispatchers
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    success: AtomicU64,
    client_error: AtomicU64,
    server_error: AtomicU64,
    upgrades: AtomicU64,
    latency_ms_total: AtomicU64,
}

impl ProxyMetrics {
    /// Recorder with zeroed totals. Instruments are process-wide.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, status: ProxyStatus, elapsed_ms: u64) {
        let total = match status {
            ProxyStatus::Success => &self.success,
            ProxyStatus::ClientError => &self.client_error,
            ProxyStatus::ServerError => &self.server_error,
        };
        total.fetch_add(1, Ordering::Relaxed);
        self.latency_ms_total.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    /// Count a long-lived upgraded stream. Streams are never timed.
    pub fn record_upgrade(&self, backend: Backend, cluster: &str) {
        PROXY_UPGRADES.add(
            1,
            &[
                KeyValue::new("backend", backend.as_str()),
                KeyValue::new("cluster", cluster.to_string()),
            ],
        );
        self.upgrades.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(backend = backend.as_str(), cluster = %cluster, "Upgrade stream opened");
    }

    /// Totals recorded through this instance so far
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            success: self.success.load(Ordering::Relaxed),
            client_error: self.client_error.load(Ordering::Relaxed),
            server_error: self.server_error.load(Ordering::Relaxed),
            upgrades: self.upgrades.load(Ordering::Relaxed),
            latency_ms_total: self.latency_ms_total.load(Ordering::Relaxed),
        }
    }
}

/// Times one ordinary proxied call
pub struct ProxyTimer {
    metrics: Arc<ProxyMetrics>,
    backend: Backend,
    cluster: String,
    method: String,
    start: Instant,
}

impl ProxyTimer {
    /// Start timing a request
    pub fn start(
        metrics: Arc<ProxyMetrics>,
        backend: Backend,
        cluster: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            metrics,
            backend,
            cluster: cluster.into(),
            method: method.into(),
            start: Instant::now(),
        }
    }

    /// Complete with the response status
    pub fn complete(self, status: ProxyStatus) {
        let elapsed = self.start.elapsed();

        PROXY_REQUESTS.add(
            1,
            &[
                KeyValue::new("backend", self.backend.as_str()),
                KeyValue::new("cluster", self.cluster.clone()),
                KeyValue::new("method", self.method.clone()),
                KeyValue::new("status", status.as_str()),
            ],
        );
        PROXY_REQUEST_DURATION.record(
            elapsed.as_secs_f64(),
            &[
                KeyValue::new("backend", self.backend.as_str()),
                KeyValue::new("cluster", self.cluster.clone()),
                KeyValue::new("method", self.method.clone()),
            ],
        );

        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.metrics.record(status, elapsed_ms);
        tracing::debug!(
            backend = self.backend.as_str(),
            cluster = %self.cluster,
            method = %self.method,
            status = status.as_str(),
            elapsed_ms,
            "Proxied request completed"
        );
    }
}
