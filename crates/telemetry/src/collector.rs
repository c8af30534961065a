use arc_swap::ArcSwap;
use async_std::future::timeout;
use async_std::task::{self, JoinHandle};
use chrono::Utc;
use futures::channel::oneshot;
use std::sync::Arc;
use std::time::{Duration, Instant};
use steward_core::{DependencyStatus, TelemetrySnapshot};

use crate::inspector::DependencyInspector;
use crate::sampler::Sampler;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub interval: Duration,
    /// How often the dependency inspector is re-run.
    pub dependency_interval: Duration,
    /// Longest one reading may take before it counts as a failed sample.
    pub sample_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            dependency_interval: Duration::from_secs(60),
            sample_timeout: Duration::from_secs(15),
        }
    }
}

/// Lock-free view of the latest published readings.
#[derive(Clone, Default)]
pub struct TelemetryReader {
    snapshot: Arc<ArcSwap<TelemetrySnapshot>>,
    dependencies: Arc<ArcSwap<Vec<DependencyStatus>>>,
}

impl TelemetryReader {
    pub fn latest(&self) -> Arc<TelemetrySnapshot> {
        self.snapshot.load_full()
    }

    pub fn dependencies(&self) -> Arc<Vec<DependencyStatus>> {
        self.dependencies.load_full()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Transition {
    Failed(String),
    Recovered,
}

/// Remembers whether sampling is currently failing so that a persistent
/// failure is logged once rather than on every tick.
#[derive(Default)]
struct HealthTracker {
    failing: bool,
}

impl HealthTracker {
    fn observe(&mut self, error: Option<&str>) -> Option<Transition> {
        match (self.failing, error) {
            (false, Some(e)) => {
                self.failing = true;
                Some(Transition::Failed(e.to_string()))
            }
            (true, None) => {
                self.failing = false;
                Some(Transition::Recovered)
            }
            _ => None,
        }
    }
}

/// Periodic sampler running on its own task. Readers never wait on it.
pub struct TelemetryCollector {
    reader: TelemetryReader,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TelemetryCollector {
    pub fn start(
        sampler: Arc<dyn Sampler>,
        inspector: Option<DependencyInspector>,
        config: CollectorConfig,
    ) -> Self {
        let reader = TelemetryReader::default();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let published = reader.clone();

        let handle = task::spawn(async move {
            let mut health = HealthTracker::default();
            let mut deps_checked: Option<Instant> = None;

            loop {
                let snapshot = sample_once(sampler.as_ref(), config.sample_timeout).await;
                match health.observe(snapshot.error.as_deref()) {
                    Some(Transition::Failed(e)) => log::warn!("telemetry sampling failed: {}", e),
                    Some(Transition::Recovered) => log::info!("telemetry sampling recovered"),
                    None => {}
                }
                published.snapshot.store(Arc::new(snapshot));

                if let Some(inspector) = &inspector {
                    let due = deps_checked
                        .map(|at| at.elapsed() >= config.dependency_interval)
                        .unwrap_or(true);
                    if due {
                        published
                            .dependencies
                            .store(Arc::new(inspector.inspect().await));
                        deps_checked = Some(Instant::now());
                    }
                }

                // Stop signal or a dropped collector both end the loop.
                if timeout(config.interval, &mut stop_rx)
                    .await
                    .is_ok()
                {
                    break;
                }
            }
            log::debug!("telemetry collector stopped");
        });

        Self {
            reader,
            stop_tx: Some(stop_tx),
            task: Some(handle),
        }
    }

    pub fn reader(&self) -> TelemetryReader {
        self.reader.clone()
    }

    /// Stop sampling and wait for the task to exit. Safe to call twice.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task.take() {
            handle.await;
        }
    }
}

async fn sample_once(sampler: &dyn Sampler, limit: Duration) -> TelemetrySnapshot {
    let host = timeout(limit, sampler.host()).await.unwrap_or_default();
    let (devices, error) = match timeout(limit, sampler.devices()).await {
        Ok(Ok(devices)) => (devices, None),
        Ok(Err(e)) => (Vec::new(), Some(e.to_string())),
        Err(_) => (
            Vec::new(),
            Some(format!("GPU sampling did not finish within {:?}", limit)),
        ),
    };
    TelemetrySnapshot {
        devices,
        host,
        error,
        sampled_at: Utc::now(),
    }
}
