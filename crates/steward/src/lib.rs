//! # gpu-steward
//!
//! Starts the pieces of the lifecycle orchestrator in the right order and
//! hands out the registry that callers drive.
//!
//! ```no_run
//! use gpu_steward::{Steward, StewardConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let steward = Steward::start(StewardConfig::from_env()?).await?;
//! steward.registry().load("llm", Some(vec![0])).await?;
//! println!("{:?}", steward.registry().status("llm")?.state);
//! steward.shutdown().await;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use async_std::sync::Mutex;
use async_std::task;
use log::{info, warn};
use std::fs;
use std::sync::Arc;
use steward_depot::{ArtifactCache, CredentialStore, HubClient, ResourceCatalog};
use steward_engines::{process_factory, stub_factory};
use steward_telemetry::{CollectorConfig, DependencyInspector, TelemetryCollector};

pub mod config;

pub use config::{EngineKind, StewardConfig};
pub use steward_core::{
    DashboardSnapshot, DependencyStatus, ResourceSpec, RuntimeState, RuntimeStatus, StewardError,
};
pub use steward_engines::{Engine, EngineContext, EngineFactory};
pub use steward_registry::{ResourceHandle, ResourceRegistry};
pub use steward_telemetry::{Sampler, SystemSampler};

pub struct Steward {
    config: StewardConfig,
    catalog: ResourceCatalog,
    registry: Arc<ResourceRegistry>,
    collector: Mutex<TelemetryCollector>,
}

impl Steward {
    pub async fn start(config: StewardConfig) -> Result<Self> {
        Self::start_with(config, Arc::new(SystemSampler::new()), None).await
    }

    /// Start with a custom telemetry sampler and, optionally, one engine
    /// factory for every resource instead of the configured engine kind.
    pub async fn start_with(
        config: StewardConfig,
        sampler: Arc<dyn Sampler>,
        factory: Option<EngineFactory>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.config_dir)
            .with_context(|| format!("creating {}", config.config_dir.display()))?;
        let cache = ArtifactCache::new(&config.cache_dir)
            .with_context(|| format!("creating {}", config.cache_dir.display()))?;

        let credentials = Arc::new(
            CredentialStore::in_dir(cache.root()).context("opening the credential store")?,
        );
        if let Some(token) = &config.initial_token {
            if !credentials.is_set() {
                info!("Seeding the credential store from HUGGINGFACE_TOKEN");
                credentials.set(Some(token.clone()))?;
            }
        }

        let catalog = ResourceCatalog::load(&config.config_dir)?;
        let factory = factory.unwrap_or_else(|| match config.engine {
            EngineKind::Process => process_factory(Arc::new(HubClient::new())),
            EngineKind::Stub => stub_factory(),
        });

        let mut registry = ResourceRegistry::new(cache, credentials);
        for spec in catalog.resources() {
            registry.register(spec.clone(), factory.clone())?;
        }

        // Started last: nothing below can fail.
        let collector = TelemetryCollector::start(
            sampler,
            Some(DependencyInspector::new(config.expected_cuda.clone())),
            CollectorConfig {
                interval: config.telemetry_interval,
                dependency_interval: config.dependency_interval,
                ..CollectorConfig::default()
            },
        );
        let registry = registry.with_telemetry(collector.reader());
        let registry = Arc::new(registry);

        if !config.lazy_load {
            let preload = registry.clone();
            task::spawn(async move { load_all(&preload).await });
        }

        info!(
            "gpu-steward ready with {} resource(s), cache at {}",
            catalog.resources().len(),
            config.cache_dir.display()
        );
        Ok(Self {
            config,
            catalog,
            registry,
            collector: Mutex::new(collector),
        })
    }

    pub fn config(&self) -> &StewardConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ResourceCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        self.registry.snapshot()
    }

    /// Run the dependency inspector now instead of waiting for the next
    /// scheduled pass.
    pub async fn inspect_dependencies(&self) -> Vec<DependencyStatus> {
        DependencyInspector::new(self.config.expected_cuda.clone())
            .inspect()
            .await
    }

    /// Release every resource and stop telemetry.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        self.collector.lock().await.stop().await;
        info!("gpu-steward stopped");
    }
}

/// Load every registered resource in order, logging failures.
pub async fn load_all(registry: &ResourceRegistry) {
    for name in registry.names() {
        info!("Preloading {}", name);
        if let Err(e) = registry.load(&name, None).await {
            warn!("preloading {} failed: {}", name, e);
        }
    }
}
