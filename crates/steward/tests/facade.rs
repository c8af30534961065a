use anyhow::Result;
use async_std::task;
use async_trait::async_trait;
use gpu_steward::{EngineKind, RuntimeState, Sampler, Steward, StewardConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use steward_core::{DeviceSnapshot, HostMetrics};

struct OneGpu;

#[async_trait]
impl Sampler for OneGpu {
    async fn devices(&self) -> Result<Vec<DeviceSnapshot>> {
        Ok(vec![DeviceSnapshot {
            id: 0,
            name: "Test GPU".into(),
            memory_total: 24576,
            memory_used: 0,
            utilization_pct: 0.0,
            temperature_c: None,
        }])
    }

    async fn host(&self) -> HostMetrics {
        HostMetrics::default()
    }
}

fn config(dir: &std::path::Path) -> StewardConfig {
    let mut config = StewardConfig::with_dir(dir);
    config.engine = EngineKind::Stub;
    config.telemetry_interval = Duration::from_millis(20);
    config
}

#[async_std::test]
async fn stub_steward_runs_the_full_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let steward = Steward::start_with(config(tmp.path()), Arc::new(OneGpu), None)
        .await
        .unwrap();
    let registry = steward.registry();

    assert_eq!(registry.names(), vec!["llm", "asr", "diarizer"]);
    registry.load("asr", Some(vec![0])).await.unwrap();

    let status = registry.status("asr").unwrap();
    assert_eq!(status.state, RuntimeState::ReadyLoaded);
    assert_eq!(status.device_ids(), vec![0]);
    assert!(tmp
        .path()
        .join("cache/models--nvidia--canary-1b-v2")
        .exists());

    task::sleep(Duration::from_millis(60)).await;
    let snapshot = steward.snapshot();
    assert_eq!(snapshot.gpus.len(), 1);
    assert!(snapshot.resources["asr"].loaded);
    assert_eq!(snapshot.resources["llm"].task, "chat-completion");

    steward.shutdown().await;
    assert_eq!(registry.status("asr").unwrap().state, RuntimeState::Idle);
    assert!(registry.status("asr").unwrap().downloaded);
}

#[async_std::test]
async fn initial_token_only_seeds_an_empty_store() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.initial_token = Some("hf_first".into());
    let steward = Steward::start_with(cfg.clone(), Arc::new(OneGpu), None)
        .await
        .unwrap();
    assert!(steward.registry().credential_present());
    steward.registry().set_credential(Some("hf_rotated".into())).unwrap();
    steward.shutdown().await;

    cfg.initial_token = Some("hf_stale".into());
    let _steward = Steward::start_with(cfg, Arc::new(OneGpu), None)
        .await
        .unwrap();
    let stored = std::fs::read_to_string(tmp.path().join("cache/.hf_token")).unwrap();
    assert_eq!(stored.trim(), "hf_rotated");
}

#[async_std::test]
async fn eager_mode_loads_everything_at_startup() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.lazy_load = false;
    let steward = Steward::start_with(cfg, Arc::new(OneGpu), None)
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = steward.snapshot();
        if snapshot.resources.values().all(|r| r.loaded) {
            break;
        }
        assert!(Instant::now() < deadline, "resources never loaded");
        task::sleep(Duration::from_millis(20)).await;
    }
    steward.shutdown().await;
}

#[async_std::test]
async fn catalog_overrides_are_registered() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("resources.toml"),
        r#"
        [[resources]]
        name = "embedder"
        repo = "BAAI/bge-m3"
        task = "embedding"
        "#,
    )
    .unwrap();

    let steward = Steward::start_with(config(tmp.path()), Arc::new(OneGpu), None)
        .await
        .unwrap();
    assert_eq!(
        steward.registry().resolve_task("embedding").unwrap().name(),
        "embedder"
    );
    steward.shutdown().await;
}

#[derive(Default)]
struct CountingSampler(AtomicUsize);

#[async_trait]
impl Sampler for CountingSampler {
    async fn devices(&self) -> Result<Vec<DeviceSnapshot>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn host(&self) -> HostMetrics {
        HostMetrics::default()
    }
}

#[async_std::test]
async fn failed_start_never_samples() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("resources.toml"),
        r#"
        [[resources]]
        name = ""
        repo = "acme/nameless"
        task = "embedding"
        "#,
    )
    .unwrap();

    let sampler = Arc::new(CountingSampler::default());
    let result = Steward::start_with(config(tmp.path()), sampler.clone(), None).await;
    assert!(result.is_err());

    task::sleep(Duration::from_millis(60)).await;
    assert_eq!(sampler.0.load(Ordering::SeqCst), 0);
}
