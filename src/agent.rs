use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cache::MemoryCache;
use crate::config::Config;
use crate::definitions::DefinitionSet;
use crate::dispatch::Dispatcher;
use crate::filter::ActivityFilter;
use crate::health::HealthMetrics;
use crate::identity;
use crate::ingest::IngestServer;
use crate::store::{self, MetricStore, StoreError};

/// Agent orchestrates all components: definitions, store and identity
/// clients, dispatcher, ingest and health servers.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    ingest: Option<IngestServer<store::http::Client, MemoryCache, identity::Client>>,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            ingest: None,
        })
    }

    /// Start all components and begin accepting samples.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Start health metrics server.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;
        info!("health metrics server started");

        // 2. Load resource definitions.
        let definitions = DefinitionSet::load(&self.cfg.resources_file).with_context(|| {
            format!(
                "loading resource definitions from {}",
                self.cfg.resources_file.display()
            )
        })?;

        if definitions.is_empty() {
            warn!("no resource definitions loaded, every sample will be unmatched");
        } else {
            info!(
                definitions = definitions.len(),
                path = %self.cfg.resources_file.display(),
                "loaded resource definitions",
            );
        }

        // 3. Connect to the metrics store and wait for it to answer.
        let store_client =
            store::http::Client::new(&self.cfg.store).context("creating metrics store client")?;
        self.probe_store(&store_client).await?;
        self.health.store_reachable.set(1.0);

        // 4. Identity client and service activity filter.
        let resolver =
            identity::Client::new(&self.cfg.identity).context("creating identity client")?;
        let filter = ActivityFilter::new(
            resolver,
            self.cfg.filter.service_activity,
            self.cfg.filter.service_project.clone(),
        );

        // 5. Build the dispatcher.
        let cache = self
            .cfg
            .cache
            .enabled
            .then(|| MemoryCache::new(self.cfg.cache.capacity, self.cfg.cache.ttl));
        if cache.is_none() {
            warn!("attribute cache disabled, every batch will hit the store");
        }

        let archive_policy = (!self.cfg.store.archive_policy.is_empty())
            .then(|| self.cfg.store.archive_policy.clone());

        let dispatcher = Arc::new(
            Dispatcher::new(store_client, cache, filter, definitions, archive_policy)
                .with_health(self.health.clone()),
        );

        // 6. Start the sample ingest server.
        let ingest = IngestServer::new(&self.cfg.ingest, dispatcher);
        ingest.start().await.context("starting ingest server")?;
        self.ingest = Some(ingest);

        info!("agent started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        info!("stopping agent");

        if let Some(ingest) = self.ingest.take() {
            ingest.stop().await.context("stopping ingest server")?;
        }

        self.health
            .stop()
            .await
            .context("stopping health metrics server")?;

        info!("agent stopped");

        Ok(())
    }

    /// Probe the metrics store until it answers or attempts run out.
    ///
    /// Only transport failures are retried. An HTTP error from a store
    /// that is listening fails startup immediately.
    async fn probe_store(&self, store: &store::http::Client) -> Result<()> {
        let attempts = self.cfg.store.connect_retries.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match store.capabilities().await {
                Ok(caps) => {
                    info!(
                        aggregation_methods = caps.aggregation_methods.len(),
                        "metrics store reachable",
                    );
                    return Ok(());
                }
                Err(StoreError::Connectivity(e)) if attempt < attempts => {
                    warn!(
                        attempt,
                        attempts,
                        error = %e,
                        "metrics store unreachable, retrying",
                    );
                    tokio::time::sleep(self.cfg.store.retry_interval).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("metrics store unreachable after {attempt} attempt(s)")
                    });
                }
            }
        }
    }
}
