use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::guardrail::EngineStats;

/// Prometheus metrics for engine health.
///
/// All metrics use the "metricoor" namespace. Values are refreshed from the
/// engine-stats counters on every scrape.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    stats: Arc<EngineStats>,

    /// Total events processed by the engine.
    events_processed: Gauge,
    /// Events dropped at the ingest queue, by atom.
    events_dropped: GaugeVec,
    /// Installed configs (1=valid, 0=invalid).
    config_valid: GaugeVec,
    /// Hard dimension limit hits by metric.
    dimension_limit_hits: GaugeVec,
    /// Closed buckets by metric.
    buckets_closed: GaugeVec,
    /// Pull failures by atom.
    pull_failures: GaugeVec,
    /// Declared anomalies by alert.
    anomalies_declared: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str, stats: Arc<EngineStats>) -> Result<Self> {
        let registry = Registry::new();

        let events_processed = Gauge::with_opts(
            Opts::new("events_processed_total", "Total events processed.")
                .namespace("metricoor"),
        )?;
        let events_dropped = GaugeVec::new(
            Opts::new(
                "events_dropped_total",
                "Events dropped at the ingest queue.",
            )
            .namespace("metricoor"),
            &["atom_id"],
        )?;
        let config_valid = GaugeVec::new(
            Opts::new("config_valid", "Installed configs (1=valid, 0=invalid).")
                .namespace("metricoor"),
            &["config"],
        )?;
        let dimension_limit_hits = GaugeVec::new(
            Opts::new(
                "dimension_limit_hits_total",
                "Hard dimension limit hits by metric.",
            )
            .namespace("metricoor"),
            &["metric_id"],
        )?;
        let buckets_closed = GaugeVec::new(
            Opts::new("buckets_closed_total", "Closed buckets by metric.")
                .namespace("metricoor"),
            &["metric_id"],
        )?;
        let pull_failures = GaugeVec::new(
            Opts::new("pull_failures_total", "Pull failures by atom.").namespace("metricoor"),
            &["atom_id"],
        )?;
        let anomalies_declared = GaugeVec::new(
            Opts::new("anomalies_declared_total", "Declared anomalies by alert.")
                .namespace("metricoor"),
            &["alert_id"],
        )?;

        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(config_valid.clone()))?;
        registry.register(Box::new(dimension_limit_hits.clone()))?;
        registry.register(Box::new(buckets_closed.clone()))?;
        registry.register(Box::new(pull_failures.clone()))?;
        registry.register(Box::new(anomalies_declared.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            stats,
            events_processed,
            events_dropped,
            config_valid,
            dimension_limit_hits,
            buckets_closed,
            pull_failures,
            anomalies_declared,
        })
    }

    /// Copies the engine counters into the prometheus gauges.
    fn refresh(&self) {
        let snap = self.stats.snapshot();
        self.events_processed.set(snap.events_processed as f64);
        for (atom, count) in &snap.dropped_events {
            self.events_dropped
                .with_label_values(&[&atom.to_string()])
                .set(*count as f64);
        }
        for config in &snap.configs {
            self.config_valid
                .with_label_values(&[&config.key.to_string()])
                .set(if config.valid { 1.0 } else { 0.0 });
        }
        for (metric_id, count) in &snap.hard_dimension_limit_reached {
            self.dimension_limit_hits
                .with_label_values(&[&metric_id.to_string()])
                .set(*count as f64);
        }
        for (metric_id, count) in &snap.bucket_count {
            self.buckets_closed
                .with_label_values(&[&metric_id.to_string()])
                .set(*count as f64);
        }
        for (atom, count) in &snap.pull_failures {
            self.pull_failures
                .with_label_values(&[&atom.to_string()])
                .set(*count as f64);
        }
        for (alert_id, count) in &snap.anomaly_declared {
            self.anomalies_declared
                .with_label_values(&[&alert_id.to_string()])
                .set(*count as f64);
        }
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::clone(&self));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<HealthMetrics>>) -> impl IntoResponse {
    state.refresh();

    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buf) {
        tracing::error!(error = %e, "encoding metrics failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
    }
    (StatusCode::OK, buf)
}

/// GET /healthz - liveness probe.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
