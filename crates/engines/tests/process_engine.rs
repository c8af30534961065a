#![cfg(unix)]

use async_std::task;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use steward_core::{Endpoint, LaunchSpec, ResourceSpec};
use steward_depot::HubClient;
use steward_engines::{Engine, EngineContext, ProcessEngine};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn spawn_health_server() -> u16 {
    let port = free_port();
    let mut app = tide::new();
    app.at("/health").get(|_| async { Ok("ok") });
    task::spawn(app.listen(format!("127.0.0.1:{}", port)));
    for _ in 0..50 {
        if async_std::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            break;
        }
        task::sleep(Duration::from_millis(20)).await;
    }
    port
}

fn engine(program: &str, args: &[&str], port: u16, visible: Vec<u32>) -> ProcessEngine {
    let mut spec = ResourceSpec::new("tiny", "acme/tiny", "unit-test");
    spec.launch = Some(LaunchSpec {
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        host: "127.0.0.1".into(),
        port,
        health_path: "/health".into(),
        endpoints: vec![Endpoint {
            label: "Chat".into(),
            path: "/v1/chat/completions".into(),
        }],
        startup_timeout_secs: 5,
    });
    let ctx = EngineContext {
        spec,
        artifact_dir: std::env::temp_dir().join("models--acme--tiny"),
    };
    ProcessEngine::new(ctx, Arc::new(HubClient::with_endpoint("http://127.0.0.1:1")))
        .with_poll_interval(Duration::from_millis(50))
        .with_visible_devices(visible)
}

#[async_std::test]
async fn starts_the_server_on_the_requested_devices() {
    let port = spawn_health_server().await;
    let mut engine = engine("sleep", &["30"], port, vec![0, 1]);

    let info = engine.initialize(&[1]).await.unwrap();
    assert_eq!(info["device_ids"], json!([1]));
    assert_eq!(info["base_url"], json!(format!("http://127.0.0.1:{}", port)));
    assert_eq!(
        info["endpoints"][0]["url"],
        json!(format!("http://127.0.0.1:{}/v1/chat/completions", port))
    );
    assert!(info["pid"].as_u64().unwrap() > 0);

    engine.shutdown().await.unwrap();
    engine.shutdown().await.unwrap();
}

#[async_std::test]
async fn requesting_an_invisible_device_fails_before_spawning() {
    let mut engine = engine("definitely-not-a-server", &[], free_port(), vec![0]);
    let err = engine.initialize(&[3]).await.unwrap_err();
    assert_eq!(err.kind(), "accelerator_unavailable");
}

#[async_std::test]
async fn missing_program_is_a_load_error() {
    let mut engine = engine("definitely-not-a-server", &[], free_port(), vec![0]);
    let err = engine.initialize(&[]).await.unwrap_err();
    assert_eq!(err.kind(), "load");
    assert!(err.message().contains("not installed"), "{}", err);
}

#[async_std::test]
async fn early_exit_is_reported() {
    let mut engine = engine("false", &[], free_port(), vec![0]);
    let err = engine.initialize(&[0]).await.unwrap_err();
    assert_eq!(err.kind(), "load");
    assert!(err.message().contains("before becoming healthy"), "{}", err);
}
