use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::IdentityConfig;

/// Errors surfaced by identity lookups.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("project {0:?} not found")]
    ProjectNotFound(String),

    #[error("identity service unreachable: {0}")]
    Connectivity(#[source] reqwest::Error),

    #[error("unexpected identity response: {0}")]
    Unexpected(String),
}

/// Identity service client trait.
pub trait ProjectResolver: Send + Sync {
    /// Resolve a project name to its id.
    fn find_project_id(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<String, IdentityError>> + Send;
}

impl<T: ProjectResolver> ProjectResolver for Arc<T> {
    fn find_project_id(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<String, IdentityError>> + Send {
        (**self).find_project_id(name)
    }
}

/// HTTP-based identity service client.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
}

impl Client {
    /// Create a new identity client.
    pub fn new(cfg: &IdentityConfig) -> Result<Self> {
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

// --- JSON response structures ---

#[derive(Deserialize)]
struct ProjectsResponse {
    #[serde(default)]
    projects: Vec<ProjectEntry>,
}

#[derive(Deserialize)]
struct ProjectEntry {
    id: String,
}

impl ProjectResolver for Client {
    async fn find_project_id(&self, name: &str) -> Result<String, IdentityError> {
        debug!(project = name, "resolving project id");

        let url = format!("{}/v1/projects", self.endpoint);

        let response = self
            .http
            .get(&url)
            .query(&[("name", name)])
            .send()
            .await
            .map_err(IdentityError::Connectivity)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Unexpected(format!(
                "status {status}: {body}"
            )));
        }

        let decoded: ProjectsResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::Unexpected(format!("decoding projects: {e}")))?;

        decoded
            .projects
            .into_iter()
            .next()
            .map(|p| p.id)
            .ok_or_else(|| IdentityError::ProjectNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projects_response_first_entry_wins() {
        let decoded: ProjectsResponse = serde_json::from_str(
            r#"{"projects": [{"id": "p-metrics"}, {"id": "p-other"}]}"#,
        )
        .expect("should parse");

        assert_eq!(decoded.projects[0].id, "p-metrics");
    }

    #[test]
    fn test_projects_response_empty_list() {
        let decoded: ProjectsResponse =
            serde_json::from_str(r#"{"projects": []}"#).expect("should parse");
        assert!(decoded.projects.is_empty());

        let decoded: ProjectsResponse = serde_json::from_str("{}").expect("should parse");
        assert!(decoded.projects.is_empty());
    }
}
