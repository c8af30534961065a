use async_std::sync::Mutex as AsyncMutex;
use async_std::task::{self, JoinHandle};
use futures::future::{FutureExt, Shared};
use log::{error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use steward_core::{
    ReleaseWarning, ResourceSpec, Result, RuntimeState, RuntimeStatus, StewardError,
};
use steward_depot::{has_artifacts, CredentialStore};
use steward_engines::{Engine, EngineContext, EngineFactory};

use crate::status::{progress_into, ProgressSpan, StatusCell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Operation {
    Download,
    Load,
    Release,
}

type InFlight = Shared<JoinHandle<Result<()>>>;

struct Inner {
    spec: ResourceSpec,
    artifact_dir: PathBuf,
    factory: EngineFactory,
    credentials: Arc<CredentialStore>,
    status: Arc<StatusCell>,
    /// Lifecycle lock. Operations of any kind queue here in FIFO order.
    engine: AsyncMutex<Option<Box<dyn Engine>>>,
    pending: Mutex<HashMap<Operation, InFlight>>,
    preferred: Mutex<Vec<u32>>,
}

/// One managed resource: its status record, its engine and the lifecycle
/// operations that move it between states. Cheap to clone.
#[derive(Clone)]
pub struct ResourceHandle {
    inner: Arc<Inner>,
}

impl ResourceHandle {
    pub fn new(
        spec: ResourceSpec,
        artifact_dir: PathBuf,
        factory: EngineFactory,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        let status = RuntimeStatus::new(has_artifacts(&artifact_dir));
        Self {
            inner: Arc::new(Inner {
                spec,
                artifact_dir,
                factory,
                credentials,
                status: Arc::new(StatusCell::new(status)),
                engine: AsyncMutex::new(None),
                pending: Mutex::new(HashMap::new()),
                preferred: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.inner.spec
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.inner.artifact_dir
    }

    /// Copy of the current status. Never waits on a running operation.
    pub fn status(&self) -> RuntimeStatus {
        self.inner.status.snapshot()
    }

    /// Resolve the device list for a load: explicit ids replace the
    /// remembered preference, `None` reuses it.
    pub fn choose_devices(&self, requested: Option<Vec<u32>>) -> Vec<u32> {
        let mut preferred = self.lock_preferred();
        let chosen = merge_preference(&preferred, requested);
        *preferred = chosen.clone();
        chosen
    }

    fn lock_preferred(&self) -> std::sync::MutexGuard<'_, Vec<u32>> {
        self.inner
            .preferred
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn ensure_downloaded(&self) -> Result<()> {
        self.coalesce(Operation::Download, |handle| async move {
            handle.run_download().await
        })
        .await
    }

    pub async fn ensure_loaded(&self, device_ids: Vec<u32>) -> Result<()> {
        self.coalesce(Operation::Load, move |handle| async move {
            handle.run_load(device_ids).await
        })
        .await
    }

    pub async fn release(&self) -> Result<()> {
        self.coalesce(Operation::Release, |handle| async move {
            handle.run_release().await
        })
        .await
    }

    /// Join the in-flight operation of the same kind, or start one on a
    /// detached task so it finishes even if every caller goes away.
    async fn coalesce<F, Fut>(&self, op: Operation, start: F) -> Result<()>
    where
        F: FnOnce(ResourceHandle) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let in_flight = {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match pending.get(&op) {
                Some(existing) => existing.clone(),
                None => {
                    let work = start(self.clone());
                    let owner = self.clone();
                    let joined = task::spawn(async move {
                        let result = work.await;
                        owner
                            .inner
                            .pending
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .remove(&op);
                        result
                    })
                    .shared();
                    pending.insert(op, joined.clone());
                    joined
                }
            }
        };
        in_flight.await
    }

    fn engine<'a>(&self, slot: &'a mut Option<Box<dyn Engine>>) -> &'a mut Box<dyn Engine> {
        slot.get_or_insert_with(|| {
            (self.inner.factory)(&EngineContext {
                spec: self.inner.spec.clone(),
                artifact_dir: self.inner.artifact_dir.clone(),
            })
        })
    }

    async fn run_download(&self) -> Result<()> {
        let mut slot = self.inner.engine.lock().await;
        let status = &self.inner.status;

        if has_artifacts(&self.inner.artifact_dir) {
            status.update(|s| {
                s.downloaded = true;
                if !s.is_loaded() {
                    if s.state != RuntimeState::ReadyCached {
                        s.state = RuntimeState::Idle;
                    }
                    s.progress = 100.0;
                    s.status_message = "Artifacts already cached".to_string();
                    s.last_error = None;
                }
            });
            return Ok(());
        }

        let result = self.download_phase(&mut slot, ProgressSpan::FULL).await;
        match result {
            Ok(()) => {
                status.update(|s| {
                    s.state = RuntimeState::Idle;
                    s.progress = 100.0;
                    s.downloaded = true;
                    s.status_message = "Download complete".to_string();
                });
                info!("{} downloaded", self.name());
                Ok(())
            }
            Err(e) => Err(self.record_failure(e)),
        }
    }

    async fn download_phase(
        &self,
        slot: &mut Option<Box<dyn Engine>>,
        span: ProgressSpan,
    ) -> Result<()> {
        let status = &self.inner.status;
        status.begin(
            RuntimeState::Downloading,
            format!("Downloading {}", self.inner.spec.repo),
            span.start,
        );
        info!("{} -> {}", self.name(), RuntimeState::Downloading);

        let reporter = progress_into(status.clone(), span);
        let credential = self.inner.credentials.get();
        self.engine(slot)
            .ensure_artifacts(reporter, credential)
            .await
            .map_err(StewardError::into_download)?;

        if !has_artifacts(&self.inner.artifact_dir) {
            return Err(StewardError::Download(format!(
                "no artifacts were written to {}",
                self.inner.artifact_dir.display()
            )));
        }
        status.advance(span.end, None);
        Ok(())
    }

    async fn run_load(&self, device_ids: Vec<u32>) -> Result<()> {
        let mut slot = self.inner.engine.lock().await;
        let status = &self.inner.status;

        if status.snapshot().is_loaded() {
            return Ok(());
        }

        let mut init_start = 0.0;
        if !has_artifacts(&self.inner.artifact_dir) {
            if let Err(e) = self
                .download_phase(&mut slot, ProgressSpan::LOAD_DOWNLOAD)
                .await
            {
                return Err(self.record_failure(e));
            }
            status.update(|s| s.downloaded = true);
            init_start = ProgressSpan::LOAD_INIT_START;
        }

        let message = if device_ids.is_empty() {
            "Loading".to_string()
        } else {
            format!("Loading on GPU(s) {:?}", device_ids)
        };
        status.begin(RuntimeState::Loading, message, init_start);
        info!("{} -> {}", self.name(), RuntimeState::Loading);

        let result = self
            .engine(&mut slot)
            .initialize(&device_ids)
            .await
            .map_err(StewardError::into_load);

        match result {
            Ok(server_info) => {
                let applied = server_info
                    .get("device_ids")
                    .cloned()
                    .unwrap_or_else(|| json!(device_ids));
                status.update(|s| {
                    s.state = RuntimeState::ReadyLoaded;
                    s.progress = 100.0;
                    s.downloaded = true;
                    s.status_message = "Loaded".to_string();
                    s.details.insert("device_ids".into(), applied);
                    s.server_info = Some(server_info);
                });
                info!("{} -> {}", self.name(), RuntimeState::ReadyLoaded);
                Ok(())
            }
            Err(e) => Err(self.record_failure(e)),
        }
    }

    async fn run_release(&self) -> Result<()> {
        let mut slot = self.inner.engine.lock().await;
        let status = &self.inner.status;

        if !status.snapshot().is_loaded() {
            return Ok(());
        }
        status.begin(RuntimeState::Unloading, "Unloading", 0.0);
        info!("{} -> {}", self.name(), RuntimeState::Unloading);

        if let Some(mut engine) = slot.take() {
            if let Err(e) = engine.shutdown().await {
                let warning = ReleaseWarning {
                    resource: self.name().to_string(),
                    detail: e.to_string(),
                };
                warn!("{}", warning);
            }
        }

        status.update(|s| {
            s.state = RuntimeState::Idle;
            s.progress = if s.downloaded { 100.0 } else { 0.0 };
            s.status_message = "Unloaded".to_string();
            s.server_info = None;
            s.details.remove("device_ids");
        });
        info!("{} -> {}", self.name(), RuntimeState::Idle);
        Ok(())
    }

    fn record_failure(&self, err: StewardError) -> StewardError {
        error!("{}: {}", self.name(), err);
        self.inner.status.fail(&err);
        err
    }
}

/// Explicit ids (de-duplicated, order kept) win over the remembered list.
pub fn merge_preference(remembered: &[u32], requested: Option<Vec<u32>>) -> Vec<u32> {
    match requested {
        None => remembered.to_vec(),
        Some(ids) => {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if !out.contains(&id) {
                    out.push(id);
                }
            }
            out
        }
    }
}

/// Ids present in `status.details.device_ids` that also appear in `wanted`.
pub(crate) fn overlapping(status: &RuntimeStatus, wanted: &[u32]) -> Vec<u32> {
    status
        .device_ids()
        .into_iter()
        .filter(|id| wanted.contains(id))
        .collect()
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("name", &self.name())
            .field("state", &self.status().state)
            .finish()
    }
}
