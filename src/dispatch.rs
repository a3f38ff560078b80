use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::cache::{attribute_digest, cache_key, AttributeCache};
use crate::definitions::{DefinitionSet, ResourceDefinition};
use crate::filter::ActivityFilter;
use crate::health::HealthMetrics;
use crate::identity::{IdentityError, ProjectResolver};
use crate::lock::ResourceLockTable;
use crate::route::group_by_resource;
use crate::sample::{Measure, Sample};
use crate::store::{MetricCreate, MetricSpec, MetricStore, ResourceDescriptor, StoreError};

/// Errors the batch entry point itself can return.
///
/// Store failures never appear here; they are contained per resource.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("resolving service project: {0}")]
    Identity(#[from] IdentityError),
}

/// Summary of one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchOutcome {
    /// Samples accepted into the batch.
    pub received: usize,
    /// Samples dropped as service activity.
    pub filtered: usize,
    /// Samples whose measures were written.
    pub written: usize,
    /// Samples skipped because no definition matched their metric.
    pub unmatched: usize,
    /// Samples skipped by an ignoring definition.
    pub ignored: usize,
    /// Samples abandoned after their resource group failed.
    pub failed: usize,
}

/// A guarded resource mutation.
enum Mutation {
    Create,
    Update,
}

impl Mutation {
    fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

/// Reconciles sample batches against the metrics store.
///
/// Samples are grouped per resource and metric, measures are written
/// with a single repair-and-retry on a missing resource or metric, and
/// resource create/update goes through the digest cache and the
/// per-resource lock so concurrent batches cannot duplicate work.
pub struct Dispatcher<S, C, R> {
    store: S,
    cache: Option<C>,
    filter: ActivityFilter<R>,
    definitions: DefinitionSet,
    locks: ResourceLockTable,
    archive_policy: Option<String>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S, C, R> Dispatcher<S, C, R>
where
    S: MetricStore,
    C: AttributeCache,
    R: ProjectResolver,
{
    pub fn new(
        store: S,
        cache: Option<C>,
        filter: ActivityFilter<R>,
        definitions: DefinitionSet,
        archive_policy: Option<String>,
    ) -> Self {
        Self {
            store,
            cache,
            filter,
            definitions,
            locks: ResourceLockTable::new(),
            archive_policy,
            health: None,
        }
    }

    /// Attach health counters.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn health(&self) -> Option<&Arc<HealthMetrics>> {
        self.health.as_ref()
    }

    /// Record a batch of samples.
    ///
    /// A failing resource abandons only its own remaining metrics;
    /// every other resource in the batch still gets processed. The one
    /// error this returns is a failed service project resolution, which
    /// fails the batch before any store call.
    pub async fn record_batch(&self, batch: Vec<Sample>) -> Result<BatchOutcome, DispatchError> {
        let mut outcome = BatchOutcome {
            received: batch.len(),
            ..BatchOutcome::default()
        };

        if batch.is_empty() {
            return Ok(outcome);
        }

        if let Some(health) = &self.health {
            health.samples_received.inc_by(batch.len() as f64);
        }

        let kept = self.filter.apply(batch, &self.definitions).await?;
        outcome.filtered = outcome.received - kept.len();
        if let Some(health) = &self.health {
            health.samples_filtered.inc_by(outcome.filtered as f64);
        }

        for (resource_id, metric_groups) in group_by_resource(kept) {
            self.record_resource(&resource_id, metric_groups, &mut outcome)
                .await;
        }

        Ok(outcome)
    }

    /// Process every metric group of one resource.
    ///
    /// The first write failure left after repair abandons the rest of
    /// this resource's groups. When any group contributed attributes,
    /// one guarded update carries the merged set at the end.
    async fn record_resource(
        &self,
        resource_id: &str,
        metric_groups: BTreeMap<String, Vec<Sample>>,
        outcome: &mut BatchOutcome,
    ) {
        let groups: Vec<(String, Vec<Sample>)> = metric_groups.into_iter().collect();

        let mut extra: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let mut resource_type: Option<&str> = None;
        let mut identity: Option<(String, String)> = None;

        for (position, (metric_name, samples)) in groups.iter().enumerate() {
            let Some(definition) = self.definitions.find(metric_name) else {
                warn!(metric = %metric_name, "no definition matches metric, skipping");
                outcome.unmatched += samples.len();
                if let Some(health) = &self.health {
                    health.unmatched_metrics.inc();
                }
                continue;
            };

            if definition.ignore {
                debug!(metric = %metric_name, "definition ignores metric");
                outcome.ignored += samples.len();
                continue;
            }

            for sample in samples {
                extra.extend(definition.attributes(sample));
            }
            resource_type = Some(definition.resource_type.as_str());
            if let Some(first) = samples.first() {
                identity = Some((first.user_id.clone(), first.project_id.clone()));
            }

            let measures: Vec<Measure> = samples
                .iter()
                .map(|s| Measure {
                    timestamp: s.timestamp,
                    value: s.counter_volume,
                })
                .collect();

            match self
                .write_measures(resource_id, metric_name, samples, &measures, definition, &extra)
                .await
            {
                Ok(()) => {
                    outcome.written += samples.len();
                    if let Some(health) = &self.health {
                        health.measures_written.inc_by(measures.len() as f64);
                    }
                }
                Err(e) => {
                    error!(
                        resource = resource_id,
                        metric = %metric_name,
                        error = %e,
                        "abandoning resource after failed write",
                    );
                    if let Some(health) = &self.health {
                        health.resource_group_errors.inc();
                    }

                    outcome.failed += samples.len();
                    outcome.failed += groups[position + 1..]
                        .iter()
                        .map(|(_, rest)| rest.len())
                        .sum::<usize>();
                    return;
                }
            }
        }

        if extra.is_empty() {
            return;
        }
        let (Some(resource_type), Some((user_id, project_id))) = (resource_type, identity) else {
            return;
        };

        let descriptor = ResourceDescriptor {
            id: resource_id.to_string(),
            user_id,
            project_id,
            attributes: extra,
            metrics: BTreeMap::new(),
        };

        if let Err(e) = self
            .apply_guarded(resource_type, &descriptor, Mutation::Update)
            .await
        {
            error!(
                resource = resource_id,
                error = %e,
                "abandoning resource attribute update",
            );
            if let Some(health) = &self.health {
                health.resource_group_errors.inc();
            }
        }
    }

    /// Write one metric group, repairing a missing resource or metric
    /// once. The retried write is final; its failure aborts the
    /// caller's resource group.
    async fn write_measures(
        &self,
        resource_id: &str,
        metric_name: &str,
        samples: &[Sample],
        measures: &[Measure],
        definition: &ResourceDefinition,
        extra: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        match self
            .store
            .add_measures(resource_id, metric_name, measures)
            .await
        {
            Ok(()) => return Ok(()),
            Err(StoreError::ResourceNotFound(_)) => {
                debug!(resource = resource_id, metric = metric_name, "resource missing, creating");
                self.ensure_resource(resource_id, definition, extra, samples)
                    .await?;
            }
            Err(StoreError::MetricNotFound(..)) => {
                debug!(resource = resource_id, metric = metric_name, "metric missing, creating");
                self.ensure_metric(resource_id, metric_name, definition)
                    .await?;
            }
            Err(e) => return Err(e),
        }

        self.store
            .add_measures(resource_id, metric_name, measures)
            .await
    }

    /// Create the resource through the guarded mutation path.
    async fn ensure_resource(
        &self,
        resource_id: &str,
        definition: &ResourceDefinition,
        extra: &BTreeMap<String, serde_json::Value>,
        samples: &[Sample],
    ) -> Result<(), StoreError> {
        let descriptor = self.build_descriptor(resource_id, definition, extra, samples);
        self.apply_guarded(&definition.resource_type, &descriptor, Mutation::Create)
            .await
    }

    /// Create one metric; losing a create race is fine.
    async fn ensure_metric(
        &self,
        resource_id: &str,
        metric_name: &str,
        definition: &ResourceDefinition,
    ) -> Result<(), StoreError> {
        let create = MetricCreate {
            resource_id: resource_id.to_string(),
            name: metric_name.to_string(),
            archive_policy_name: self.effective_policy(definition),
        };

        match self.store.create_metric(&create).await {
            Ok(()) => {
                if let Some(health) = &self.health {
                    health.metrics_created.inc();
                }
                Ok(())
            }
            Err(StoreError::Conflict(_)) => {
                debug!(resource = resource_id, metric = metric_name, "metric already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn build_descriptor(
        &self,
        resource_id: &str,
        definition: &ResourceDefinition,
        extra: &BTreeMap<String, serde_json::Value>,
        samples: &[Sample],
    ) -> ResourceDescriptor {
        let mut metrics = BTreeMap::new();
        for pattern in definition.metric_patterns() {
            metrics.insert(
                pattern.clone(),
                MetricSpec {
                    archive_policy_name: self.effective_policy(definition),
                },
            );
        }

        let first = samples.first();

        ResourceDescriptor {
            id: resource_id.to_string(),
            user_id: first.map(|s| s.user_id.clone()).unwrap_or_default(),
            project_id: first.map(|s| s.project_id.clone()).unwrap_or_default(),
            attributes: extra.clone(),
            metrics,
        }
    }

    fn effective_policy(&self, definition: &ResourceDefinition) -> Option<String> {
        definition
            .archive_policy
            .clone()
            .or_else(|| self.archive_policy.clone())
    }

    /// Run a resource mutation behind the digest cache and the
    /// per-resource lock.
    ///
    /// Without a cache the mutation runs unconditionally and without
    /// locking; the store's own conflict handling is the only guard.
    /// With one, a matching digest skips the mutation, and the
    /// double-check under the lock keeps racing batches from repeating
    /// work the winner just finished.
    async fn apply_guarded(
        &self,
        resource_type: &str,
        descriptor: &ResourceDescriptor,
        mutation: Mutation,
    ) -> Result<(), StoreError> {
        let Some(cache) = &self.cache else {
            return self.mutate(resource_type, descriptor, &mutation).await;
        };

        let key = cache_key(&descriptor.id);
        let digest = attribute_digest(descriptor);

        if cache.get(&key).await.as_deref() == Some(digest.as_str()) {
            debug!(resource = %descriptor.id, "attributes unchanged, skipping mutation");
            if let Some(health) = &self.health {
                health
                    .cache_hits
                    .with_label_values(&[mutation.name(), "check"])
                    .inc();
            }
            return Ok(());
        }

        let _guard = self.locks.lock(&descriptor.id).await;

        if cache.get(&key).await.as_deref() == Some(digest.as_str()) {
            if let Some(health) = &self.health {
                health
                    .cache_hits
                    .with_label_values(&[mutation.name(), "recheck"])
                    .inc();
            }
            return Ok(());
        }

        self.mutate(resource_type, descriptor, &mutation).await?;
        cache.set(&key, digest).await;

        Ok(())
    }

    async fn mutate(
        &self,
        resource_type: &str,
        descriptor: &ResourceDescriptor,
        mutation: &Mutation,
    ) -> Result<(), StoreError> {
        match mutation {
            Mutation::Create => match self.store.create_resource(resource_type, descriptor).await {
                Ok(()) => {
                    if let Some(health) = &self.health {
                        health.resources_created.inc();
                    }
                    Ok(())
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(resource = %descriptor.id, "resource already exists");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Mutation::Update => {
                self.store
                    .update_resource(resource_type, &descriptor.id, &descriptor.attributes)
                    .await?;
                if let Some(health) = &self.health {
                    health.resources_updated.inc();
                }
                Ok(())
            }
        }
    }
}
