use async_std::task;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use steward_core::{AssetEvent, ProgressReporter, ResourceSpec};
use steward_depot::{has_artifacts, HubClient};
use tide::{Request, Response, StatusCode};

const TOKEN: &str = "hf_test_token";
const WEIGHTS_LEN: usize = 10 * 1024 * 1024;

#[derive(Clone)]
struct Hub {
    listing_calls: Arc<AtomicUsize>,
    weight_failures_left: Arc<AtomicUsize>,
}

fn authorized(req: &Request<Hub>) -> bool {
    req.header("Authorization")
        .map(|v| v.last().as_str() == format!("Bearer {}", TOKEN))
        .unwrap_or(false)
}

async fn spawn_hub(weight_failures: usize) -> (String, Hub) {
    let state = Hub {
        listing_calls: Arc::new(AtomicUsize::new(0)),
        weight_failures_left: Arc::new(AtomicUsize::new(weight_failures)),
    };
    let mut app = tide::with_state(state.clone());

    app.at("/api/models/acme/tiny")
        .get(|req: Request<Hub>| async move {
            req.state().listing_calls.fetch_add(1, Ordering::SeqCst);
            if !authorized(&req) {
                return Ok(Response::new(StatusCode::Unauthorized));
            }
            let listing = json!({
                "siblings": [
                    { "rfilename": "config.json", "size": 2 },
                    { "rfilename": "weights/model.bin", "size": WEIGHTS_LEN },
                ]
            });
            Ok(Response::builder(StatusCode::Ok)
                .body(listing)
                .build())
        });

    app.at("/acme/tiny/resolve/main/config.json")
        .get(|req: Request<Hub>| async move {
            if !authorized(&req) {
                return Ok(Response::new(StatusCode::Unauthorized));
            }
            Ok(Response::builder(StatusCode::Ok).body("{}").build())
        });

    app.at("/acme/tiny/resolve/main/weights/model.bin")
        .get(|req: Request<Hub>| async move {
            if !authorized(&req) {
                return Ok(Response::new(StatusCode::Unauthorized));
            }
            let left = &req.state().weight_failures_left;
            if left.load(Ordering::SeqCst) > 0 {
                left.fetch_sub(1, Ordering::SeqCst);
                return Ok(Response::new(StatusCode::ServiceUnavailable));
            }
            Ok(Response::builder(StatusCode::Ok)
                .body(vec![7u8; WEIGHTS_LEN])
                .build())
        });

    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let addr = format!("127.0.0.1:{}", port);
    let listen_addr = addr.clone();
    task::spawn(async move {
        let _ = app.listen(listen_addr).await;
    });

    for _ in 0..50 {
        if async_std::net::TcpStream::connect(&addr).await.is_ok() {
            break;
        }
        task::sleep(Duration::from_millis(20)).await;
    }
    (format!("http://{}", addr), state)
}

fn recorder() -> (ProgressReporter, Arc<Mutex<Vec<AssetEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let reporter = ProgressReporter::new(move |event| sink.lock().unwrap().push(event));
    (reporter, events)
}

fn spec() -> ResourceSpec {
    ResourceSpec::new("tiny", "acme/tiny", "unit-test")
}

#[async_std::test]
async fn downloads_every_file_with_monotone_progress() {
    let (endpoint, _hub) = spawn_hub(0).await;
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join(spec().cache_key());
    let (reporter, events) = recorder();

    HubClient::with_endpoint(endpoint)
        .download_repo(&spec(), &dest, Some(TOKEN), &reporter)
        .await
        .unwrap();

    assert_eq!(std::fs::read(dest.join("config.json")).unwrap(), b"{}");
    assert_eq!(
        std::fs::metadata(dest.join("weights/model.bin")).unwrap().len(),
        WEIGHTS_LEN as u64
    );
    assert!(!dest.join("weights/model.bin.part").exists());
    assert!(has_artifacts(&dest));

    let total = WEIGHTS_LEN as u64 + 2;
    let progress: Vec<(u64, u64)> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            AssetEvent::Progress(done, total) => Some((*done, *total)),
            _ => None,
        })
        .collect();
    assert!(progress.len() >= 3, "expected intermediate reports: {:?}", progress);
    assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(*progress.last().unwrap(), (total, total));
}

#[async_std::test]
async fn rejected_credentials_fail_without_retrying() {
    let (endpoint, hub) = spawn_hub(0).await;
    let tmp = tempfile::tempdir().unwrap();

    let err = HubClient::with_endpoint(endpoint)
        .with_retry_policy(4, Duration::from_millis(5))
        .download_repo(&spec(), tmp.path(), None, &ProgressReporter::noop())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "download");
    assert!(err.message().contains("rejected"), "{}", err);
    assert_eq!(hub.listing_calls.load(Ordering::SeqCst), 1);
}

#[async_std::test]
async fn transient_server_errors_are_retried() {
    let (endpoint, hub) = spawn_hub(2).await;
    let tmp = tempfile::tempdir().unwrap();

    HubClient::with_endpoint(endpoint)
        .with_retry_policy(3, Duration::from_millis(5))
        .download_repo(&spec(), tmp.path(), Some(TOKEN), &ProgressReporter::noop())
        .await
        .unwrap();

    assert_eq!(hub.weight_failures_left.load(Ordering::SeqCst), 0);
    assert!(tmp.path().join("weights/model.bin").exists());
}

#[async_std::test]
async fn allow_list_limits_the_download() {
    let (endpoint, _hub) = spawn_hub(0).await;
    let tmp = tempfile::tempdir().unwrap();
    let mut spec = spec();
    spec.files = vec!["config.json".to_string()];

    HubClient::with_endpoint(endpoint)
        .download_repo(&spec, tmp.path(), Some(TOKEN), &ProgressReporter::noop())
        .await
        .unwrap();

    assert!(tmp.path().join("config.json").exists());
    assert!(!tmp.path().join("weights").exists());
}
