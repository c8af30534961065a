use chrono::Utc;
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use steward_core::{
    DashboardSnapshot, ResourceSnapshot, ResourceSpec, Result, RuntimeStatus, StewardError,
    TelemetrySnapshot,
};
use steward_depot::{ArtifactCache, CredentialStore};
use steward_engines::EngineFactory;
use steward_telemetry::TelemetryReader;

use crate::handle::{overlapping, ResourceHandle};

/// The fixed set of managed resources, addressed by name.
pub struct ResourceRegistry {
    cache: ArtifactCache,
    credentials: Arc<CredentialStore>,
    telemetry: Option<TelemetryReader>,
    handles: Vec<ResourceHandle>,
    index: HashMap<String, usize>,
}

impl ResourceRegistry {
    pub fn new(cache: ArtifactCache, credentials: Arc<CredentialStore>) -> Self {
        Self {
            cache,
            credentials,
            telemetry: None,
            handles: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn with_telemetry(mut self, reader: TelemetryReader) -> Self {
        self.telemetry = Some(reader);
        self
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn register(&mut self, spec: ResourceSpec, factory: EngineFactory) -> Result<()> {
        if self.index.contains_key(&spec.name) {
            return Err(StewardError::DuplicateResource(spec.name));
        }
        let artifact_dir = self.cache.artifact_dir(&spec);
        let handle = ResourceHandle::new(spec, artifact_dir, factory, self.credentials.clone());
        info!(
            "Registered {} ({}) as {}",
            handle.name(),
            handle.spec().repo,
            handle.status().state
        );
        self.index.insert(handle.name().to_string(), self.handles.len());
        self.handles.push(handle);
        Ok(())
    }

    pub fn handle(&self, name: &str) -> Result<&ResourceHandle> {
        self.index
            .get(name)
            .map(|&i| &self.handles[i])
            .ok_or_else(|| StewardError::UnknownResource(name.to_string()))
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.handles.iter().map(|h| h.name().to_string()).collect()
    }

    /// The resource serving a task kind such as `chat-completion`.
    pub fn resolve_task(&self, task: &str) -> Option<&ResourceHandle> {
        self.handles.iter().find(|h| h.spec().task == task)
    }

    pub async fn download(&self, name: &str) -> Result<()> {
        self.handle(name)?.ensure_downloaded().await
    }

    /// `gpu_ids == None` reuses the devices remembered for this resource.
    pub async fn load(&self, name: &str, gpu_ids: Option<Vec<u32>>) -> Result<()> {
        let handle = self.handle(name)?;
        let devices = handle.choose_devices(gpu_ids);

        for other in self.handles.iter().filter(|h| h.name() != name) {
            let status = other.status();
            if !status.is_loaded() {
                continue;
            }
            let shared = overlapping(&status, &devices);
            if !shared.is_empty() {
                warn!(
                    "{} requested GPU(s) {:?} already used by {}",
                    name,
                    shared,
                    other.name()
                );
            }
        }

        handle.ensure_loaded(devices).await
    }

    pub async fn unload(&self, name: &str) -> Result<()> {
        self.handle(name)?.release().await
    }

    pub fn status(&self, name: &str) -> Result<RuntimeStatus> {
        Ok(self.handle(name)?.status())
    }

    /// Everything a dashboard poll needs. Reads status copies and the last
    /// published telemetry only, so it never waits on an operation.
    pub fn snapshot(&self) -> DashboardSnapshot {
        let telemetry: Arc<TelemetrySnapshot> = self
            .telemetry
            .as_ref()
            .map(TelemetryReader::latest)
            .unwrap_or_default();
        let dependencies = self
            .telemetry
            .as_ref()
            .map(|t| t.dependencies().as_ref().clone())
            .unwrap_or_default();

        let mut resources = BTreeMap::new();
        let mut any_busy = false;
        for handle in &self.handles {
            let runtime = handle.status();
            any_busy |= runtime.state.is_busy();
            let spec = handle.spec();
            resources.insert(
                spec.name.clone(),
                ResourceSnapshot {
                    name: spec.name.clone(),
                    display_name: spec.display_name().to_string(),
                    identifier: spec.repo.clone(),
                    task: spec.task.clone(),
                    format: spec.format.clone(),
                    description: spec.description.clone(),
                    loaded: runtime.is_loaded(),
                    runtime,
                },
            );
        }

        DashboardSnapshot {
            resources,
            gpus: telemetry.devices.clone(),
            system: telemetry.host.clone(),
            telemetry_error: telemetry.error.clone(),
            dependencies,
            any_busy,
            generated_at: Utc::now(),
        }
    }

    pub fn credential_present(&self) -> bool {
        self.credentials.is_set()
    }

    /// Replace or clear the hub token. The next download picks it up.
    pub fn set_credential(&self, token: Option<String>) -> Result<()> {
        self.credentials.set(token)
    }

    /// Release every loaded resource. Failures are logged and skipped.
    pub async fn shutdown(&self) {
        for handle in &self.handles {
            if let Err(e) = handle.release().await {
                warn!("releasing {} during shutdown: {}", handle.name(), e);
            }
        }
    }
}
