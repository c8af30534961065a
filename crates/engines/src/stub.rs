use crate::{Engine, EngineContext};
use async_std::task;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use steward_core::{ProgressReporter, Result, ServerInfo, StewardError};

const MARKER_FILE: &str = "stub-weights.bin";

/// Dry-run engine. Simulates a short download by writing a marker file and
/// pretends to serve on a fake address.
pub struct StubEngine {
    ctx: EngineContext,
    step: Duration,
    loaded: bool,
}

impl StubEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            step: Duration::from_millis(25),
            loaded: false,
        }
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }
}

#[async_trait]
impl Engine for StubEngine {
    async fn ensure_artifacts(
        &mut self,
        progress: ProgressReporter,
        _credential: Option<String>,
    ) -> Result<()> {
        let total = 4u64;
        progress.started(MARKER_FILE);
        for done in 1..=total {
            task::sleep(self.step).await;
            progress.progress(done, total);
        }
        async_std::fs::create_dir_all(&self.ctx.artifact_dir).await?;
        async_std::fs::write(self.ctx.artifact_dir.join(MARKER_FILE), b"stub").await?;
        progress.complete(MARKER_FILE);
        Ok(())
    }

    async fn initialize(&mut self, device_ids: &[u32]) -> Result<ServerInfo> {
        if !self.ctx.artifact_dir.join(MARKER_FILE).exists() {
            return Err(StewardError::Load(format!(
                "no artifacts in {}",
                self.ctx.artifact_dir.display()
            )));
        }
        task::sleep(self.step).await;
        self.loaded = true;

        let mut info = ServerInfo::new();
        info.insert("engine".into(), Value::String("stub".into()));
        info.insert(
            "base_url".into(),
            Value::String(format!("stub://{}", self.ctx.spec.name)),
        );
        info.insert("device_ids".into(), json!(device_ids));
        Ok(info)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.loaded = false;
        Ok(())
    }
}
