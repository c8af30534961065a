use gpu_steward::{ResourceRegistry, StewardError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tide::{Request, Response, StatusCode};

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ResourceRegistry>,
}

#[derive(Deserialize, Default)]
pub struct LoadRequest {
    #[serde(default)]
    pub gpu_device_ids: Option<Vec<u32>>,
}

#[derive(Deserialize)]
pub struct CredentialRequest {
    pub token: Option<String>,
}

#[derive(Serialize)]
pub struct CredentialResponse {
    pub has_token: bool,
}

pub fn app(registry: Arc<ResourceRegistry>) -> tide::Server<ApiState> {
    let mut app = tide::with_state(ApiState { registry });
    app.at("/health").get(health);
    app.at("/api/admin/status").get(status);
    app.at("/api/admin/models/:name/download").post(download);
    app.at("/api/admin/models/:name/load").post(load);
    app.at("/api/admin/models/:name/unload").post(unload);
    app.at("/api/admin/credential")
        .get(get_credential)
        .post(set_credential);
    app
}

pub fn status_code(err: &StewardError) -> StatusCode {
    match err {
        StewardError::UnknownResource(_) => StatusCode::NotFound,
        StewardError::DuplicateResource(_) => StatusCode::Conflict,
        StewardError::Download(_) => StatusCode::BadGateway,
        StewardError::AcceleratorUnavailable(_) => StatusCode::ServiceUnavailable,
        StewardError::Load(_) | StewardError::Storage(_) | StewardError::Config(_) => {
            StatusCode::InternalServerError
        }
    }
}

fn error_response(err: &StewardError) -> Response {
    Response::builder(status_code(err))
        .body(json!({ "detail": err.to_string() }))
        .build()
}

fn json_response(body: serde_json::Value) -> tide::Result {
    Ok(Response::builder(StatusCode::Ok).body(body).build())
}

/// Result of a lifecycle call: the resource's status on success, the
/// mapped error otherwise.
fn lifecycle_response(
    registry: &ResourceRegistry,
    name: &str,
    result: Result<(), StewardError>,
) -> tide::Result {
    match result.and_then(|_| registry.status(name)) {
        Ok(runtime) => json_response(json!({ "name": name, "runtime": runtime })),
        Err(e) => Ok(error_response(&e)),
    }
}

pub async fn health(_req: Request<ApiState>) -> tide::Result {
    json_response(json!({ "status": "ok" }))
}

pub async fn status(req: Request<ApiState>) -> tide::Result {
    let snapshot = req.state().registry.snapshot();
    json_response(serde_json::to_value(&snapshot)?)
}

pub async fn download(req: Request<ApiState>) -> tide::Result {
    let name = req.param("name")?.to_string();
    let registry = &req.state().registry;
    let result = registry.download(&name).await;
    lifecycle_response(registry, &name, result)
}

pub async fn load(mut req: Request<ApiState>) -> tide::Result {
    let body = req.body_string().await?;
    let request: LoadRequest = if body.trim().is_empty() {
        LoadRequest::default()
    } else {
        match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(Response::builder(StatusCode::BadRequest)
                    .body(json!({ "detail": format!("invalid load request: {}", e) }))
                    .build())
            }
        }
    };

    let name = req.param("name")?.to_string();
    let registry = &req.state().registry;
    let result = registry.load(&name, request.gpu_device_ids).await;
    lifecycle_response(registry, &name, result)
}

pub async fn unload(req: Request<ApiState>) -> tide::Result {
    let name = req.param("name")?.to_string();
    let registry = &req.state().registry;
    let result = registry.unload(&name).await;
    lifecycle_response(registry, &name, result)
}

pub async fn get_credential(req: Request<ApiState>) -> tide::Result {
    json_response(serde_json::to_value(CredentialResponse {
        has_token: req.state().registry.credential_present(),
    })?)
}

pub async fn set_credential(mut req: Request<ApiState>) -> tide::Result {
    let body: CredentialRequest = req.body_json().await?;
    let registry = &req.state().registry;
    if let Err(e) = registry.set_credential(body.token) {
        return Ok(error_response(&e));
    }
    json_response(serde_json::to_value(CredentialResponse {
        has_token: registry.credential_present(),
    })?)
}
