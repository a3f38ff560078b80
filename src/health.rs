use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "recordoor" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total sample batches accepted on the ingest listener.
    pub batches_received: Counter,
    /// Total samples accepted across all batches.
    pub samples_received: Counter,
    /// Total samples dropped as service activity.
    pub samples_filtered: Counter,
    /// Total measures written to the metrics store.
    pub measures_written: Counter,
    /// Total resources created in the metrics store.
    pub resources_created: Counter,
    /// Total metrics created on existing resources.
    pub metrics_created: Counter,
    /// Total resource attribute updates pushed to the store.
    pub resources_updated: Counter,
    /// Mutations skipped on a digest match, by operation and stage.
    pub cache_hits: CounterVec,
    /// Metric groups skipped because no definition matched.
    pub unmatched_metrics: Counter,
    /// Resource groups abandoned after a failed store call.
    pub resource_group_errors: Counter,
    /// Whether the metrics store answered the startup probe (1=yes, 0=no).
    pub store_reachable: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let batches_received = Counter::with_opts(
            Opts::new(
                "batches_received_total",
                "Total sample batches accepted on the ingest listener.",
            )
            .namespace("recordoor"),
        )?;
        let samples_received = Counter::with_opts(
            Opts::new(
                "samples_received_total",
                "Total samples accepted across all batches.",
            )
            .namespace("recordoor"),
        )?;
        let samples_filtered = Counter::with_opts(
            Opts::new(
                "samples_filtered_total",
                "Total samples dropped as service activity.",
            )
            .namespace("recordoor"),
        )?;
        let measures_written = Counter::with_opts(
            Opts::new(
                "measures_written_total",
                "Total measures written to the metrics store.",
            )
            .namespace("recordoor"),
        )?;
        let resources_created = Counter::with_opts(
            Opts::new(
                "resources_created_total",
                "Total resources created in the metrics store.",
            )
            .namespace("recordoor"),
        )?;
        let metrics_created = Counter::with_opts(
            Opts::new(
                "metrics_created_total",
                "Total metrics created on existing resources.",
            )
            .namespace("recordoor"),
        )?;
        let resources_updated = Counter::with_opts(
            Opts::new(
                "resources_updated_total",
                "Total resource attribute updates pushed to the store.",
            )
            .namespace("recordoor"),
        )?;
        let cache_hits = CounterVec::new(
            Opts::new(
                "cache_hits_total",
                "Mutations skipped on a digest match, by operation and stage.",
            )
            .namespace("recordoor"),
            &["operation", "stage"],
        )?;
        let unmatched_metrics = Counter::with_opts(
            Opts::new(
                "unmatched_metrics_total",
                "Metric groups skipped because no definition matched.",
            )
            .namespace("recordoor"),
        )?;
        let resource_group_errors = Counter::with_opts(
            Opts::new(
                "resource_group_errors_total",
                "Resource groups abandoned after a failed store call.",
            )
            .namespace("recordoor"),
        )?;
        let store_reachable = Gauge::with_opts(
            Opts::new(
                "store_reachable",
                "Whether the metrics store answered the startup probe (1=yes, 0=no).",
            )
            .namespace("recordoor"),
        )?;

        registry.register(Box::new(batches_received.clone()))?;
        registry.register(Box::new(samples_received.clone()))?;
        registry.register(Box::new(samples_filtered.clone()))?;
        registry.register(Box::new(measures_written.clone()))?;
        registry.register(Box::new(resources_created.clone()))?;
        registry.register(Box::new(metrics_created.clone()))?;
        registry.register(Box::new(resources_updated.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(unmatched_metrics.clone()))?;
        registry.register(Box::new(resource_group_errors.clone()))?;
        registry.register(Box::new(store_reachable.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            batches_received,
            samples_received,
            samples_filtered,
            measures_written,
            resources_created,
            metrics_created,
            resources_updated,
            cache_hits,
            unmatched_metrics,
            resource_group_errors,
            store_reachable,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

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
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
