use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::cache::AttributeCache;
use crate::config::IngestConfig;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::identity::ProjectResolver;
use crate::sample::Sample;
use crate::store::MetricStore;

/// Request body for POST /v1/samples.
///
/// A bare sample object is accepted as a batch of one.
#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
pub enum SampleBatch {
    Many(Vec<Sample>),
    One(Box<Sample>),
}

impl SampleBatch {
    pub fn into_vec(self) -> Vec<Sample> {
        match self {
            Self::Many(samples) => samples,
            Self::One(sample) => vec![*sample],
        }
    }
}

struct IngestState<S, C, R> {
    dispatcher: Arc<Dispatcher<S, C, R>>,
    permits: Semaphore,
    max_batch: usize,
}

/// HTTP listener accepting sample batches for reconciliation.
///
/// Batches run under a semaphore sized to the configured worker count,
/// so at most that many reconciliations are in flight at once.
pub struct IngestServer<S, C, R> {
    state: Arc<IngestState<S, C, R>>,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl<S, C, R> IngestServer<S, C, R>
where
    S: MetricStore + Send + Sync + 'static,
    C: AttributeCache + Send + Sync + 'static,
    R: ProjectResolver + Send + Sync + 'static,
{
    pub fn new(cfg: &IngestConfig, dispatcher: Arc<Dispatcher<S, C, R>>) -> Self {
        Self {
            state: Arc::new(IngestState {
                dispatcher,
                permits: Semaphore::new(cfg.workers),
                max_batch: cfg.max_batch,
            }),
            addr: cfg.addr.clone(),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Starts the HTTP server serving /v1/samples.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":8042"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app = Router::new()
            .route("/v1/samples", post(samples_handler::<S, C, R>))
            .with_state(self.state.clone());

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "sample ingest server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "sample ingest server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the ingest server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// POST /v1/samples - reconcile a batch of samples.
async fn samples_handler<S, C, R>(
    State(state): State<Arc<IngestState<S, C, R>>>,
    Json(batch): Json<SampleBatch>,
) -> Response
where
    S: MetricStore + Send + Sync + 'static,
    C: AttributeCache + Send + Sync + 'static,
    R: ProjectResolver + Send + Sync + 'static,
{
    let samples: Vec<Sample> = batch.into_vec();

    if let Some(health) = state.dispatcher.health() {
        health.batches_received.inc();
    }

    if samples.len() > state.max_batch {
        warn!(
            size = samples.len(),
            limit = state.max_batch,
            "rejecting oversized batch",
        );
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            "batch exceeds configured maximum",
        )
            .into_response();
    }

    let _permit = match state.permits.acquire().await {
        Ok(permit) => permit,
        Err(_) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
        }
    };

    match state.dispatcher.record_batch(samples).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e @ DispatchError::Identity(_)) => {
            error!(error = %e, "deferring batch, service project unresolved");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "service project unresolved",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_decodes_array() {
        let body = r#"[
            {
                "resource_id": "vm-1",
                "counter_name": "cpu_util",
                "project_id": "p1",
                "user_id": "u1",
                "timestamp": "2024-05-01T12:00:00Z",
                "counter_volume": 0.5
            }
        ]"#;

        let batch: SampleBatch = serde_json::from_str(body).unwrap();
        let samples = batch.into_vec();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].resource_id, "vm-1");
    }

    #[test]
    fn test_bare_object_decodes_as_batch_of_one() {
        let body = r#"{
            "resource_id": "vm-2",
            "counter_name": "memory",
            "project_id": "p1",
            "user_id": "u1",
            "timestamp": "2024-05-01T12:00:00Z",
            "counter_volume": 512.0
        }"#;

        let batch: SampleBatch = serde_json::from_str(body).unwrap();
        let samples = batch.into_vec();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].counter_name, "memory");
    }

    #[test]
    fn test_empty_array_decodes_empty() {
        let batch: SampleBatch = serde_json::from_str("[]").unwrap();
        assert!(batch.into_vec().is_empty());
    }
}
