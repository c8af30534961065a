//! # steward-core
//!
//! Shared vocabulary for the gpu-steward workspace: resource manifests,
//! runtime status records, telemetry snapshots and the error taxonomy used
//! by every lifecycle operation.

pub mod error;
pub mod manifest;
pub mod protocol;

pub use error::{ReleaseWarning, Result, StewardError};
pub use manifest::{Endpoint, LaunchSpec, ResourceSpec};
pub use protocol::{
    AssetEvent, DashboardSnapshot, DependencyStatus, DeviceSnapshot, HostMetrics,
    ProgressReporter, ResourceSnapshot, RuntimeState, RuntimeStatus, ServerInfo,
    TelemetrySnapshot,
};
