use anyhow::Result;
use async_trait::async_trait;
use steward_core::{DeviceSnapshot, HostMetrics};

use crate::gpu;
use crate::host::HostProbe;

/// Source of raw readings for the collector.
#[async_trait]
pub trait Sampler: Send + Sync {
    async fn devices(&self) -> Result<Vec<DeviceSnapshot>>;
    async fn host(&self) -> HostMetrics;
}

/// Reads accelerators through `nvidia-smi` and the host through procfs.
#[derive(Default)]
pub struct SystemSampler {
    host: HostProbe,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Sampler for SystemSampler {
    async fn devices(&self) -> Result<Vec<DeviceSnapshot>> {
        gpu::query_devices().await
    }

    async fn host(&self) -> HostMetrics {
        self.host.sample()
    }
}
