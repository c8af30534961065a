use crate::{Engine, EngineContext};
use async_process::{Child, Command};
use async_std::task;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use steward_core::{LaunchSpec, ProgressReporter, Result, ServerInfo, StewardError};
use steward_depot::HubClient;

/// Downloads artifacts from the hub and runs the resource's inference
/// server as a child process restricted to the assigned GPUs.
pub struct ProcessEngine {
    ctx: EngineContext,
    hub: Arc<HubClient>,
    http: surf::Client,
    poll_interval: Duration,
    visible_override: Option<Vec<u32>>,
    child: Option<Child>,
}

impl ProcessEngine {
    pub fn new(ctx: EngineContext, hub: Arc<HubClient>) -> Self {
        Self {
            ctx,
            hub,
            http: surf::Client::new(),
            poll_interval: Duration::from_secs(2),
            visible_override: None,
            child: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Skip driver discovery and treat these ids as the visible devices.
    pub fn with_visible_devices(mut self, ids: Vec<u32>) -> Self {
        self.visible_override = Some(ids);
        self
    }

    async fn visible_devices(&self) -> Result<Vec<u32>> {
        match &self.visible_override {
            Some(ids) => Ok(ids.clone()),
            None => steward_telemetry::gpu::visible_device_ids()
                .await
                .map_err(|e| StewardError::AcceleratorUnavailable(e.to_string())),
        }
    }

    async fn wait_healthy(&mut self, launch: &LaunchSpec) -> Result<()> {
        let url = format!("{}{}", launch.base_url(), launch.health_path);
        let deadline = Instant::now() + Duration::from_secs(launch.startup_timeout_secs);

        loop {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_status() {
                    return Err(StewardError::Load(format!(
                        "{} exited with {} before becoming healthy",
                        launch.program, status
                    )));
                }
            }

            match self.http.get(&url).await {
                Ok(res) if res.status().is_success() => return Ok(()),
                Ok(res) => debug!("{} answered {}", url, res.status()),
                Err(e) => debug!("{} not reachable yet: {}", url, e),
            }

            if Instant::now() >= deadline {
                return Err(StewardError::Load(format!(
                    "{} did not become healthy within {}s",
                    launch.program, launch.startup_timeout_secs
                )));
            }
            task::sleep(self.poll_interval).await;
        }
    }

    async fn stop_child(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pid = child.id();
        if let Err(e) = child.kill() {
            if e.kind() != ErrorKind::InvalidInput {
                return Err(StewardError::Load(format!("failed to stop pid {}: {}", pid, e)));
            }
        }
        match child.status().await {
            Ok(status) => debug!("server pid {} exited with {}", pid, status),
            Err(e) => warn!("could not reap server pid {}: {}", pid, e),
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    async fn ensure_artifacts(
        &mut self,
        progress: ProgressReporter,
        credential: Option<String>,
    ) -> Result<()> {
        self.hub
            .download_repo(
                &self.ctx.spec,
                &self.ctx.artifact_dir,
                credential.as_deref(),
                &progress,
            )
            .await
    }

    async fn initialize(&mut self, device_ids: &[u32]) -> Result<ServerInfo> {
        let launch = self.ctx.spec.launch.clone().ok_or_else(|| {
            StewardError::Load(format!(
                "resource '{}' has no launch configuration",
                self.ctx.spec.name
            ))
        })?;
        let visible = self.visible_devices().await?;
        let devices = select_devices(device_ids, &visible)?;
        let cuda_devices = join_ids(&devices);

        // A leftover server from a failed attempt would hold the port.
        self.stop_child().await?;

        let child = Command::new(&launch.program)
            .args(expand_args(&launch, &self.ctx, devices.len()))
            .env("CUDA_VISIBLE_DEVICES", &cuda_devices)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    StewardError::Load(format!("{} is not installed", launch.program))
                }
                _ => StewardError::Load(format!("failed to start {}: {}", launch.program, e)),
            })?;
        let pid = child.id();
        info!(
            "Started {} (pid {}) for {} on GPUs [{}]",
            launch.program, pid, self.ctx.spec.name, cuda_devices
        );
        self.child = Some(child);

        if let Err(e) = self.wait_healthy(&launch).await {
            if let Err(stop) = self.stop_child().await {
                warn!("{}", stop);
            }
            return Err(e);
        }

        let base_url = launch.base_url();
        let endpoints: Vec<Value> = launch
            .endpoints
            .iter()
            .map(|ep| json!({ "label": ep.label, "url": format!("{}{}", base_url, ep.path) }))
            .collect();

        let mut info = ServerInfo::new();
        info.insert(
            "health_url".into(),
            Value::String(format!("{}{}", base_url, launch.health_path)),
        );
        info.insert("base_url".into(), Value::String(base_url));
        info.insert("endpoints".into(), Value::Array(endpoints));
        info.insert("pid".into(), json!(pid));
        info.insert("device_ids".into(), json!(devices));
        Ok(info)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stop_child().await
    }
}

/// Validate a device request against what the driver reports. An empty
/// request takes every visible device.
pub fn select_devices(requested: &[u32], visible: &[u32]) -> Result<Vec<u32>> {
    if visible.is_empty() {
        return Err(StewardError::AcceleratorUnavailable(
            "no GPUs are visible".to_string(),
        ));
    }
    if requested.is_empty() {
        return Ok(visible.to_vec());
    }
    let missing: Vec<u32> = requested
        .iter()
        .copied()
        .filter(|id| !visible.contains(id))
        .collect();
    if !missing.is_empty() {
        return Err(StewardError::AcceleratorUnavailable(format!(
            "GPU(s) [{}] not visible; available: [{}]",
            join_ids(&missing),
            join_ids(visible)
        )));
    }
    Ok(requested.to_vec())
}

/// Substitute `{artifact_dir}`, `{host}`, `{port}`, `{repo}` and
/// `{device_count}` in the launch arguments.
pub fn expand_args(launch: &LaunchSpec, ctx: &EngineContext, device_count: usize) -> Vec<String> {
    let artifact_dir = ctx.artifact_dir.to_string_lossy();
    launch
        .args
        .iter()
        .map(|arg| {
            arg.replace("{artifact_dir}", &artifact_dir)
                .replace("{host}", &launch.host)
                .replace("{port}", &launch.port.to_string())
                .replace("{repo}", &ctx.spec.repo)
                .replace("{device_count}", &device_count.to_string())
        })
        .collect()
}

fn join_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
