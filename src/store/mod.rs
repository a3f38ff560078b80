pub mod http;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sample::Measure;

/// Errors surfaced by metrics store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The target resource does not exist yet.
    #[error("resource {0:?} not found")]
    ResourceNotFound(String),

    /// The resource exists but the named metric does not.
    #[error("metric {0:?} not found on resource {1:?}")]
    MetricNotFound(String, String),

    /// A create hit an existing resource or metric.
    #[error("{0} already exists")]
    Conflict(String),

    /// Transport-level failure (connect, timeout, TLS).
    #[error("store unreachable: {0}")]
    Connectivity(#[source] reqwest::Error),

    /// Any other store response.
    #[error("unexpected store response: {0}")]
    Unexpected(String),
}

/// Everything the store needs to create a resource.
///
/// `attributes` flattens into the wire form next to the identity
/// fields; `metrics` declares the streams the resource starts with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub metrics: BTreeMap<String, MetricSpec>,
}

/// Archive policy selection for a declared metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_policy_name: Option<String>,
}

/// Standalone metric creation request.
#[derive(Debug, Clone, Serialize)]
pub struct MetricCreate {
    pub resource_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_policy_name: Option<String>,
}

/// Store feature probe result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub aggregation_methods: Vec<String>,
}

/// Metrics store API client trait.
pub trait MetricStore: Send + Sync {
    /// Append measures to one metric stream of a resource.
    fn add_measures(
        &self,
        resource_id: &str,
        metric_name: &str,
        measures: &[Measure],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Create a resource along with its declared metrics.
    fn create_resource(
        &self,
        resource_type: &str,
        resource: &ResourceDescriptor,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Create one metric on an existing resource.
    fn create_metric(
        &self,
        metric: &MetricCreate,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Replace the mutable attributes of a resource.
    fn update_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        attributes: &BTreeMap<String, serde_json::Value>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Probe the store for supported capabilities.
    fn capabilities(&self) -> impl Future<Output = Result<Capabilities, StoreError>> + Send;
}

impl<T: MetricStore> MetricStore for Arc<T> {
    fn add_measures(
        &self,
        resource_id: &str,
        metric_name: &str,
        measures: &[Measure],
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).add_measures(resource_id, metric_name, measures)
    }

    fn create_resource(
        &self,
        resource_type: &str,
        resource: &ResourceDescriptor,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).create_resource(resource_type, resource)
    }

    fn create_metric(
        &self,
        metric: &MetricCreate,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).create_metric(metric)
    }

    fn update_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        attributes: &BTreeMap<String, serde_json::Value>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).update_resource(resource_type, resource_id, attributes)
    }

    fn capabilities(&self) -> impl Future<Output = Result<Capabilities, StoreError>> + Send {
        (**self).capabilities()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_wire_form_flattens_attributes() {
        let mut attributes = BTreeMap::new();
        attributes.insert("host".to_string(), serde_json::json!("node-7"));

        let mut metrics = BTreeMap::new();
        metrics.insert(
            "cpu_util".to_string(),
            MetricSpec {
                archive_policy_name: Some("low".to_string()),
            },
        );

        let descriptor = ResourceDescriptor {
            id: "i-1".to_string(),
            user_id: "u1".to_string(),
            project_id: "p1".to_string(),
            attributes,
            metrics,
        };

        let encoded = serde_json::to_value(&descriptor).expect("descriptor should encode");
        assert_eq!(encoded["id"], "i-1");
        assert_eq!(encoded["host"], "node-7");
        assert_eq!(encoded["metrics"]["cpu_util"]["archive_policy_name"], "low");
    }

    #[test]
    fn test_metric_create_omits_missing_policy() {
        let create = MetricCreate {
            resource_id: "i-1".to_string(),
            name: "cpu_util".to_string(),
            archive_policy_name: None,
        };

        let encoded = serde_json::to_value(&create).expect("should encode");
        assert!(encoded.get("archive_policy_name").is_none());
    }

    #[test]
    fn test_error_display() {
        let e = StoreError::ResourceNotFound("i-1".to_string());
        assert!(e.to_string().contains("i-1"));

        let e = StoreError::MetricNotFound("cpu_util".to_string(), "i-1".to_string());
        assert!(e.to_string().contains("cpu_util"));
        assert!(e.to_string().contains("i-1"));

        let e = StoreError::Conflict("resource i-1".to_string());
        assert!(e.to_string().contains("already exists"));
    }
}
