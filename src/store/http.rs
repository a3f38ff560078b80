use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use super::{Capabilities, MetricCreate, MetricStore, ResourceDescriptor, StoreError};
use crate::config::StoreConfig;
use crate::sample::Measure;

/// HTTP client for the metrics store REST API.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
}

impl Client {
    /// Create a new store client.
    pub fn new(cfg: &StoreConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
        })
    }
}

// --- Error envelope ---

#[derive(Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorBody,
}

#[derive(Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    kind: String,
}

/// Extract the machine-readable error kind from a response body.
fn error_kind(body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.kind)
        .unwrap_or_default()
}

/// Decide what a 404 on the measures path means.
///
/// The store names the missing object in its error envelope. A bare
/// 404 without one is treated as a missing resource, which older store
/// releases report that way.
fn classify_not_found(kind: &str, resource_id: &str, metric_name: &str) -> StoreError {
    if kind == "metric_not_found" {
        StoreError::MetricNotFound(metric_name.to_string(), resource_id.to_string())
    } else {
        StoreError::ResourceNotFound(resource_id.to_string())
    }
}

async fn unexpected(status: reqwest::StatusCode, response: reqwest::Response) -> StoreError {
    let body = response.text().await.unwrap_or_default();
    StoreError::Unexpected(format!("status {status}: {body}"))
}

impl MetricStore for Client {
    async fn add_measures(
        &self,
        resource_id: &str,
        metric_name: &str,
        measures: &[Measure],
    ) -> Result<(), StoreError> {
        debug!(
            resource = resource_id,
            metric = metric_name,
            count = measures.len(),
            "posting measures",
        );

        let url = format!(
            "{}/v1/resource/{}/metric/{}/measures",
            self.endpoint, resource_id, metric_name,
        );

        let response = self
            .http
            .post(&url)
            .json(&measures)
            .send()
            .await
            .map_err(StoreError::Connectivity)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_not_found(
                &error_kind(&body),
                resource_id,
                metric_name,
            ));
        }

        Err(unexpected(status, response).await)
    }

    async fn create_resource(
        &self,
        resource_type: &str,
        resource: &ResourceDescriptor,
    ) -> Result<(), StoreError> {
        debug!(resource = %resource.id, resource_type, "creating resource");

        let url = format!("{}/v1/resource/{}", self.endpoint, resource_type);

        let response = self
            .http
            .post(&url)
            .json(resource)
            .send()
            .await
            .map_err(StoreError::Connectivity)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        if status == reqwest::StatusCode::CONFLICT {
            return Err(StoreError::Conflict(format!("resource {}", resource.id)));
        }

        Err(unexpected(status, response).await)
    }

    async fn create_metric(&self, metric: &MetricCreate) -> Result<(), StoreError> {
        debug!(
            resource = %metric.resource_id,
            metric = %metric.name,
            "creating metric",
        );

        let url = format!("{}/v1/metric", self.endpoint);

        let response = self
            .http
            .post(&url)
            .json(metric)
            .send()
            .await
            .map_err(StoreError::Connectivity)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        if status == reqwest::StatusCode::CONFLICT {
            return Err(StoreError::Conflict(format!("metric {}", metric.name)));
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::ResourceNotFound(metric.resource_id.clone()));
        }

        Err(unexpected(status, response).await)
    }

    async fn update_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        attributes: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        debug!(
            resource = resource_id,
            resource_type,
            count = attributes.len(),
            "updating resource attributes",
        );

        let url = format!("{}/v1/resource/{}/{}", self.endpoint, resource_type, resource_id);

        let response = self
            .http
            .patch(&url)
            .json(attributes)
            .send()
            .await
            .map_err(StoreError::Connectivity)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::ResourceNotFound(resource_id.to_string()));
        }

        Err(unexpected(status, response).await)
    }

    async fn capabilities(&self) -> Result<Capabilities, StoreError> {
        debug!("probing store capabilities");

        let url = format!("{}/v1/capabilities", self.endpoint);

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(StoreError::Connectivity)?;

        let status = response.status();
        if !status.is_success() {
            return Err(unexpected(status, response).await);
        }

        response
            .json()
            .await
            .map_err(|e| StoreError::Unexpected(format!("decoding capabilities: {e}")))
    }
}
