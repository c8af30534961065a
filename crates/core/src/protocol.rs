use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Public endpoint metadata returned by an engine once it is loaded.
pub type ServerInfo = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Idle,
    Downloading,
    ReadyCached,
    Loading,
    ReadyLoaded,
    Unloading,
    Error,
}

impl RuntimeState {
    /// True while a lifecycle operation is actively moving bytes or
    /// initializing; pollers shorten their interval in these states.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            RuntimeState::Downloading | RuntimeState::Loading | RuntimeState::Unloading
        )
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeState::Idle => "IDLE",
            RuntimeState::Downloading => "DOWNLOADING",
            RuntimeState::ReadyCached => "READY_CACHED",
            RuntimeState::Loading => "LOADING",
            RuntimeState::ReadyLoaded => "READY_LOADED",
            RuntimeState::Unloading => "UNLOADING",
            RuntimeState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Point-in-time status of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub state: RuntimeState,
    pub progress: f32,
    pub status_message: String,
    pub downloaded: bool,
    pub last_error: Option<String>,
    pub details: Map<String, Value>,
    pub server_info: Option<ServerInfo>,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeStatus {
    pub fn new(downloaded: bool) -> Self {
        let (state, message) = if downloaded {
            (RuntimeState::ReadyCached, "Artifacts cached")
        } else {
            (RuntimeState::Idle, "Idle")
        };
        Self {
            state,
            progress: if downloaded { 100.0 } else { 0.0 },
            status_message: message.to_string(),
            downloaded,
            last_error: None,
            details: Map::new(),
            server_info: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state == RuntimeState::ReadyLoaded
    }

    /// Device ids applied by the last successful load, if any.
    pub fn device_ids(&self) -> Vec<u32> {
        self.details
            .get("device_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_u64)
                    .filter_map(|id| u32::try_from(id).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Events an engine emits while syncing artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssetEvent {
    /// Starting to fetch the named artifact
    Started(String),
    /// Bytes received so far and the expected total (0 when unknown)
    Progress(u64, u64),
    /// Named artifact is on disk
    Complete(String),
}

/// Callback handed to `Engine::ensure_artifacts`. Cheap to clone.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(AssetEvent) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(AssetEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&self, event: AssetEvent) {
        (self.sink)(event)
    }

    pub fn started(&self, artifact: &str) {
        self.emit(AssetEvent::Started(artifact.to_string()));
    }

    pub fn progress(&self, done: u64, total: u64) {
        self.emit(AssetEvent::Progress(done, total));
    }

    pub fn complete(&self, artifact: &str) {
        self.emit(AssetEvent::Complete(artifact.to_string()));
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressReporter")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: u32,
    pub name: String,
    /// MiB
    pub memory_total: u64,
    /// MiB
    pub memory_used: u64,
    pub utilization_pct: f32,
    pub temperature_c: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
}

/// What the telemetry collector publishes on each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub devices: Vec<DeviceSnapshot>,
    pub host: HostMetrics,
    pub error: Option<String>,
    pub sampled_at: DateTime<Utc>,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            host: HostMetrics::default(),
            error: None,
            sampled_at: Utc::now(),
        }
    }
}

/// One row of the dependency inspector report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub component: String,
    pub version: Option<String>,
    pub accelerator_enabled: bool,
    pub details: Map<String, Value>,
    pub error: Option<String>,
}

impl DependencyStatus {
    pub fn missing(component: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            version: None,
            accelerator_enabled: false,
            details: Map::new(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub name: String,
    pub display_name: String,
    pub identifier: String,
    pub task: String,
    pub format: String,
    pub description: String,
    pub loaded: bool,
    pub runtime: RuntimeStatus,
}

/// Everything the dashboard needs from one poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub resources: BTreeMap<String, ResourceSnapshot>,
    pub gpus: Vec<DeviceSnapshot>,
    pub system: HostMetrics,
    pub telemetry_error: Option<String>,
    pub dependencies: Vec<DependencyStatus>,
    pub any_busy: bool,
    pub generated_at: DateTime<Utc>,
}
