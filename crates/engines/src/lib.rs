//! # steward-engines
//!
//! The interface the lifecycle layer drives for each resource, and the two
//! engines shipped with it: a process engine that downloads artifacts from
//! the hub and runs an external inference server bound to the assigned
//! GPUs, and a stub engine for dry runs.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use steward_core::{ProgressReporter, ResourceSpec, Result, ServerInfo};
use steward_depot::HubClient;

pub mod process;
pub mod stub;

pub use process::ProcessEngine;
pub use stub::StubEngine;

#[async_trait]
pub trait Engine: Send {
    /// Make sure the artifacts are present in the context's artifact dir.
    async fn ensure_artifacts(
        &mut self,
        progress: ProgressReporter,
        credential: Option<String>,
    ) -> Result<()>;

    /// Bring the engine up on the given devices. An empty slice lets the
    /// engine pick.
    async fn initialize(&mut self, device_ids: &[u32]) -> Result<ServerInfo>;

    async fn shutdown(&mut self) -> Result<()>;
}

/// What a factory gets to build an engine for one resource.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub spec: ResourceSpec,
    pub artifact_dir: PathBuf,
}

pub type EngineFactory = Arc<dyn Fn(&EngineContext) -> Box<dyn Engine> + Send + Sync>;

pub fn stub_factory() -> EngineFactory {
    Arc::new(|ctx: &EngineContext| Box::new(StubEngine::new(ctx.clone())) as Box<dyn Engine>)
}

pub fn process_factory(hub: Arc<HubClient>) -> EngineFactory {
    Arc::new(move |ctx: &EngineContext| {
        Box::new(ProcessEngine::new(ctx.clone(), hub.clone())) as Box<dyn Engine>
    })
}
