use async_std::fs::{self as afs, OpenOptions};
use async_std::task;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use log::{debug, info, warn};
use serde::Deserialize;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use steward_core::{ProgressReporter, ResourceSpec, Result, StewardError};

use crate::cache::PARTIAL_SUFFIX;

const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
const USER_AGENT: &str = concat!("gpu-steward/", env!("CARGO_PKG_VERSION"));
const READ_CHUNK: usize = 256 * 1024;
/// Progress is reported at most once per this many bytes.
const PROGRESS_STEP: u64 = 4 * 1024 * 1024;

/// One file of a hub repository.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteFile {
    #[serde(rename = "rfilename")]
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<RemoteFile>,
}

enum Failure {
    Fatal(StewardError),
    Transient(String),
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Failure::Fatal(StewardError::Download(format!("local storage: {}", err)))
    }
}

/// Downloads repositories from a Hugging Face compatible hub.
pub struct HubClient {
    endpoint: String,
    client: surf::Client,
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for HubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HubClient {
    /// Uses `HF_ENDPOINT` when set, the public hub otherwise.
    pub fn new() -> Self {
        let endpoint = std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.into());
        Self::with_endpoint(endpoint)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: surf::Client::new().with(RedirectMiddleware::new(5)),
            max_attempts: 5,
            base_delay: Duration::from_millis(1500),
        }
    }

    pub fn with_retry_policy(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_delay = base_delay;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn list_files(&self, repo: &str, token: Option<&str>) -> Result<Vec<RemoteFile>> {
        let url = format!("{}/api/models/{}?blobs=true", self.endpoint, repo);
        self.with_retry(repo, || self.try_list(&url, repo, token))
            .await
    }

    /// Fetch every file of `spec.repo` (or only `spec.files`) into `dest_dir`.
    ///
    /// Files that are already complete are skipped, partial files are
    /// resumed. Progress is reported in bytes across the whole repository.
    pub async fn download_repo(
        &self,
        spec: &ResourceSpec,
        dest_dir: &Path,
        token: Option<&str>,
        progress: &ProgressReporter,
    ) -> Result<()> {
        afs::create_dir_all(dest_dir)
            .await
            .map_err(|e| StewardError::Download(format!("local storage: {}", e)))?;

        let listing = self.list_files(&spec.repo, token).await?;
        let files = select_files(&spec.repo, listing, &spec.files)?;
        let total: u64 = files.iter().filter_map(|f| f.size).sum();
        info!(
            "Fetching {} file(s) of {} ({} bytes) into {}",
            files.len(),
            spec.repo,
            total,
            dest_dir.display()
        );

        let mut done = 0u64;
        for file in &files {
            let dest = safe_join(dest_dir, &file.name)?;
            if let (Some(size), Ok(meta)) = (file.size, afs::metadata(&dest).await) {
                if meta.len() == size {
                    debug!("{} already cached", file.name);
                    done += size;
                    progress.progress(done, total);
                    continue;
                }
            }
            if let Some(parent) = dest.parent() {
                afs::create_dir_all(parent)
                    .await
                    .map_err(|e| StewardError::Download(format!("local storage: {}", e)))?;
            }

            progress.started(&file.name);
            let url = format!("{}/{}/resolve/main/{}", self.endpoint, spec.repo, file.name);
            let written = self
                .with_retry(&file.name, || {
                    self.try_download(&url, &dest, token, done, total, progress)
                })
                .await?;
            done += file.size.unwrap_or(written);
            progress.progress(done, total);
            progress.complete(&file.name);
        }
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(Failure::Fatal(err)) => return Err(err),
                Err(Failure::Transient(msg)) if attempt >= self.max_attempts => {
                    return Err(StewardError::Download(format!(
                        "{} failed after {} attempts: {}",
                        what, attempt, msg
                    )));
                }
                Err(Failure::Transient(msg)) => {
                    let delay = self.base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        "Transient error fetching {} (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, self.max_attempts, msg, delay
                    );
                    task::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn try_list(
        &self,
        url: &str,
        repo: &str,
        token: Option<&str>,
    ) -> std::result::Result<Vec<RemoteFile>, Failure> {
        let mut response = self.send(url, token, None).await?;
        check_status(response.status(), repo)?;
        let info: RepoInfo = response
            .body_json()
            .await
            .map_err(|e| Failure::Transient(format!("malformed listing: {}", e)))?;
        Ok(info.siblings)
    }

    async fn try_download(
        &self,
        url: &str,
        dest: &Path,
        token: Option<&str>,
        base: u64,
        total: u64,
        progress: &ProgressReporter,
    ) -> std::result::Result<u64, Failure> {
        let part = partial_path(dest);
        let resume_from = afs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);
        let range = (resume_from > 0).then_some(resume_from);

        let mut response = self.send(url, token, range).await?;
        let status = response.status();
        if status == surf::StatusCode::RequestedRangeNotSatisfiable {
            let _ = afs::remove_file(&part).await;
            return Err(Failure::Transient("stale partial file discarded".into()));
        }
        check_status(status, url)?;

        let resuming = range.is_some() && status == surf::StatusCode::PartialContent;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resuming)
            .truncate(!resuming)
            .open(&part)
            .await?;

        let mut written = if resuming { resume_from } else { 0 };
        let mut last_report = written;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = response
                .read(&mut buf)
                .await
                .map_err(|e| Failure::Transient(format!("stream interrupted: {}", e)))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            written += n as u64;
            if written - last_report >= PROGRESS_STEP {
                progress.progress(base + written, total);
                last_report = written;
            }
        }
        file.flush().await?;
        drop(file);

        afs::rename(&part, dest).await?;
        debug!("Wrote {} bytes to {}", written, dest.display());
        Ok(written)
    }

    async fn send(
        &self,
        url: &str,
        token: Option<&str>,
        range_from: Option<u64>,
    ) -> std::result::Result<surf::Response, Failure> {
        let parsed = surf::Url::parse(url).map_err(|e| {
            Failure::Fatal(StewardError::Download(format!("invalid url {}: {}", url, e)))
        })?;
        let mut request = surf::RequestBuilder::new(surf::http::Method::Get, parsed)
            .header("User-Agent", USER_AGENT);
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(from) = range_from {
            request = request.header("Range", format!("bytes={}-", from));
        }
        self.client
            .send(request)
            .await
            .map_err(|e| Failure::Transient(format!("request failed: {}", e)))
    }
}

fn check_status(status: surf::StatusCode, what: &str) -> std::result::Result<(), Failure> {
    let code = status as u16;
    match code {
        200..=299 => Ok(()),
        401 | 403 => Err(Failure::Fatal(StewardError::Download(format!(
            "access to {} was rejected (HTTP {}); check the access token",
            what, code
        )))),
        404 => Err(Failure::Fatal(StewardError::Download(format!(
            "{} was not found (HTTP 404)",
            what
        )))),
        429 | 500..=599 => Err(Failure::Transient(format!("HTTP {} for {}", code, what))),
        _ => Err(Failure::Fatal(StewardError::Download(format!(
            "unexpected HTTP {} for {}",
            code, what
        )))),
    }
}

fn select_files(
    repo: &str,
    listing: Vec<RemoteFile>,
    wanted: &[String],
) -> Result<Vec<RemoteFile>> {
    let files = if wanted.is_empty() {
        listing
    } else {
        wanted
            .iter()
            .map(|name| {
                listing
                    .iter()
                    .find(|f| &f.name == name)
                    .cloned()
                    .ok_or_else(|| {
                        StewardError::Download(format!("{} has no file named {}", repo, name))
                    })
            })
            .collect::<Result<Vec<_>>>()?
    };
    if files.is_empty() {
        return Err(StewardError::Download(format!("{} lists no files", repo)));
    }
    Ok(files)
}

fn safe_join(dir: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || name.is_empty() {
        return Err(StewardError::Download(format!(
            "refusing to write artifact outside the cache: {}",
            name
        )));
    }
    Ok(dir.join(relative))
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Follows redirects, keeping credentials only while the host stays the
/// same. Hub file URLs usually bounce to a CDN with a signed URL.
struct RedirectMiddleware {
    max_attempts: u8,
}

impl RedirectMiddleware {
    pub fn new(max_attempts: u8) -> Self {
        Self { max_attempts }
    }
}

#[surf::utils::async_trait]
impl surf::middleware::Middleware for RedirectMiddleware {
    async fn handle(
        &self,
        req: surf::Request,
        client: surf::Client,
        next: surf::middleware::Next<'_>,
    ) -> surf::Result<surf::Response> {
        let mut attempts = 0;
        let mut current_req = req;

        loop {
            if attempts > self.max_attempts {
                return Err(surf::Error::from_str(
                    surf::StatusCode::LoopDetected,
                    "Too many redirects",
                ));
            }

            let response = next.run(current_req.clone(), client.clone()).await?;
            if !response.status().is_redirection() {
                return Ok(response);
            }
            let location = match response.header("Location") {
                Some(location) => location.last().as_str().to_string(),
                None => return Ok(response),
            };

            let new_url = match surf::Url::parse(&location) {
                Ok(url) => url,
                Err(_) => current_req.url().join(&location).map_err(|_| {
                    surf::Error::from_str(surf::StatusCode::BadGateway, "Invalid redirect location")
                })?,
            };

            let same_host = new_url.host_str() == current_req.url().host_str();
            let mut next_req = surf::Request::new(current_req.method(), new_url);
            for name in ["User-Agent", "Range"] {
                if let Some(value) = current_req.header(name) {
                    next_req.insert_header(name, value.last().as_str());
                }
            }
            if same_host {
                if let Some(auth) = current_req.header("Authorization") {
                    next_req.insert_header("Authorization", auth.last().as_str());
                }
            }

            current_req = next_req;
            attempts += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_rejects_escapes() {
        let dir = Path::new("/cache/models--a--b");
        assert!(safe_join(dir, "../etc/passwd").is_err());
        assert!(safe_join(dir, "/abs").is_err());
        assert_eq!(
            safe_join(dir, "sub/model.bin").unwrap(),
            dir.join("sub/model.bin")
        );
    }

    #[test]
    fn select_files_honours_the_allow_list() {
        let listing = vec![
            RemoteFile {
                name: "a.nemo".into(),
                size: Some(3),
            },
            RemoteFile {
                name: "README.md".into(),
                size: Some(1),
            },
        ];
        let picked = select_files("x/y", listing.clone(), &["a.nemo".into()]).unwrap();
        assert_eq!(picked, vec![listing[0].clone()]);

        let err = select_files("x/y", listing, &["missing.bin".into()]).unwrap_err();
        assert_eq!(err.kind(), "download");
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/c/model.bin")),
            PathBuf::from("/c/model.bin.part")
        );
    }
}
