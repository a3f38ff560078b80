use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::definitions::DefinitionSet;
use crate::identity::{IdentityError, ProjectResolver};
use crate::sample::Sample;

/// Resource type the store uses for its own measure storage accounts.
const STORAGE_ACCOUNT_TYPE: &str = "storage_account";

/// Drops samples generated by the metrics store's own activity, so
/// recording the store's traffic cannot feed more traffic back into it.
pub struct ActivityFilter<R> {
    resolver: R,
    enabled: bool,
    service_project: String,
    service_project_id: OnceCell<String>,
}

impl<R: ProjectResolver> ActivityFilter<R> {
    pub fn new(resolver: R, enabled: bool, service_project: String) -> Self {
        Self {
            resolver,
            enabled,
            service_project,
            service_project_id: OnceCell::new(),
        }
    }

    /// Remove service-generated samples from the batch.
    ///
    /// The service project id is resolved on the first non-empty batch
    /// with filtering enabled, once across all callers. A failed
    /// resolution is returned to the caller and retried on the next
    /// batch.
    pub async fn apply(
        &self,
        batch: Vec<Sample>,
        definitions: &DefinitionSet,
    ) -> Result<Vec<Sample>, IdentityError> {
        if !self.enabled || batch.is_empty() {
            return Ok(batch);
        }

        let service_id = self.service_project_id().await?.to_string();

        let mut kept = Vec::with_capacity(batch.len());
        for sample in batch {
            if is_service_activity(&sample, &service_id, definitions) {
                debug!(
                    resource = %sample.resource_id,
                    metric = %sample.counter_name,
                    "dropping service activity sample",
                );
                continue;
            }
            kept.push(sample);
        }

        Ok(kept)
    }

    /// Resolve (once) the id of the project the store runs under.
    async fn service_project_id(&self) -> Result<&str, IdentityError> {
        let id = self
            .service_project_id
            .get_or_try_init(|| async {
                let id = self.resolver.find_project_id(&self.service_project).await?;
                info!(project = %self.service_project, id = %id, "resolved service project");
                Ok::<_, IdentityError>(id)
            })
            .await?;

        Ok(id.as_str())
    }
}

/// True when the sample was produced by the store's own operation:
/// either submitted under the service project, or measuring the
/// service project's storage account.
fn is_service_activity(sample: &Sample, service_id: &str, definitions: &DefinitionSet) -> bool {
    if sample.project_id == service_id {
        return true;
    }

    sample.resource_id == service_id
        && definitions.matches_type(&sample.counter_name, STORAGE_ACCOUNT_TYPE)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct StubResolver {
        id: String,
        calls: AtomicUsize,
        fail: bool,
    }

    impl StubResolver {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                id: String::new(),
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    impl ProjectResolver for StubResolver {
        async fn find_project_id(&self, _name: &str) -> Result<String, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(IdentityError::Unexpected("identity down".to_string()));
            }
            Ok(self.id.clone())
        }
    }

    fn definitions() -> DefinitionSet {
        DefinitionSet::from_yaml(
            r#"
resources:
  - resource_type: instance
    metrics: ["cpu_util"]
  - resource_type: storage_account
    metrics: ["storage.objects*"]
"#,
        )
        .expect("definitions should parse")
    }

    fn sample(resource: &str, metric: &str, project: &str) -> Sample {
        serde_json::from_value(serde_json::json!({
            "resource_id": resource,
            "counter_name": metric,
            "project_id": project,
            "user_id": "u1",
            "timestamp": "2024-01-01T00:00:00Z",
            "counter_volume": 1.0,
        }))
        .expect("sample should parse")
    }

    #[tokio::test]
    async fn test_drops_service_project_samples() {
        let resolver = StubResolver::new("svc-proj");
        let filter = ActivityFilter::new(Arc::clone(&resolver), true, "metrics".to_string());

        let kept = filter
            .apply(
                vec![
                    sample("i-1", "cpu_util", "p1"),
                    sample("i-2", "cpu_util", "svc-proj"),
                ],
                &definitions(),
            )
            .await
            .expect("apply should succeed");

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].resource_id, "i-1");
    }

    #[tokio::test]
    async fn test_drops_service_storage_account_samples() {
        let resolver = StubResolver::new("svc-proj");
        let filter = ActivityFilter::new(Arc::clone(&resolver), true, "metrics".to_string());

        let kept = filter
            .apply(
                vec![
                    sample("svc-proj", "storage.objects.count", "p1"),
                    sample("svc-proj", "cpu_util", "p1"),
                ],
                &definitions(),
            )
            .await
            .expect("apply should succeed");

        // Only the storage account metric marks store activity; other
        // metrics on the same resource id pass through.
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].counter_name, "cpu_util");
    }

    #[tokio::test]
    async fn test_disabled_filter_never_resolves() {
        let resolver = StubResolver::new("svc-proj");
        let filter = ActivityFilter::new(Arc::clone(&resolver), false, "metrics".to_string());

        let kept = filter
            .apply(vec![sample("i-1", "cpu_util", "svc-proj")], &definitions())
            .await
            .expect("apply should succeed");

        assert_eq!(kept.len(), 1);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_never_resolves() {
        let resolver = StubResolver::new("svc-proj");
        let filter = ActivityFilter::new(Arc::clone(&resolver), true, "metrics".to_string());

        let kept = filter
            .apply(Vec::new(), &definitions())
            .await
            .expect("apply should succeed");

        assert!(kept.is_empty());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolution_happens_once() {
        let resolver = StubResolver::new("svc-proj");
        let filter = ActivityFilter::new(Arc::clone(&resolver), true, "metrics".to_string());
        let defs = definitions();

        for _ in 0..3 {
            filter
                .apply(vec![sample("i-1", "cpu_util", "p1")], &defs)
                .await
                .expect("apply should succeed");
        }

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_resolution_is_retried_next_batch() {
        let resolver = StubResolver::failing();
        let filter = ActivityFilter::new(Arc::clone(&resolver), true, "metrics".to_string());
        let defs = definitions();

        for _ in 0..2 {
            let result = filter.apply(vec![sample("i-1", "cpu_util", "p1")], &defs).await;
            assert!(result.is_err());
        }

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }
}
