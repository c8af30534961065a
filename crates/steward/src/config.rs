use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "steward.toml";

/// Which engine the registered resources are driven by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Download from the hub and run the resource's server process.
    Process,
    /// Dry run without network or GPUs.
    Stub,
}

impl std::str::FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(EngineKind::Process),
            "stub" => Ok(EngineKind::Stub),
            other => bail!("unknown engine '{}' (expected 'process' or 'stub')", other),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    cache_dir: Option<PathBuf>,
    addr: Option<String>,
    log_level: Option<String>,
    lazy_load: Option<bool>,
    telemetry_interval_secs: Option<u64>,
    dependency_interval_secs: Option<u64>,
    expected_cuda: Option<String>,
    engine: Option<EngineKind>,
}

#[derive(Debug, Clone)]
pub struct StewardConfig {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub addr: String,
    pub log_level: String,
    /// When false every resource is loaded at startup.
    pub lazy_load: bool,
    pub telemetry_interval: Duration,
    pub dependency_interval: Duration,
    pub expected_cuda: Option<String>,
    /// Seeds the credential store when it is empty.
    pub initial_token: Option<String>,
    pub engine: EngineKind,
}

impl StewardConfig {
    /// Defaults rooted at `config_dir`, ignoring environment and files.
    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        Self {
            cache_dir: config_dir.join("cache"),
            config_dir,
            addr: "127.0.0.1:8080".to_string(),
            log_level: "info".to_string(),
            lazy_load: true,
            telemetry_interval: Duration::from_secs(5),
            dependency_interval: Duration::from_secs(60),
            expected_cuda: None,
            initial_token: None,
            engine: EngineKind::Process,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Environment first, then `<config_dir>/steward.toml`, then defaults.
    pub fn resolve(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let config_dir = match var("STEWARD_HOME") {
            Some(home) => PathBuf::from(home),
            None => dirs::config_dir()
                .context("Could not find config directory")?
                .join("gpu-steward"),
        };

        let mut config = Self::with_dir(&config_dir);
        config.apply_file(&config_dir.join(CONFIG_FILE))?;

        if let Some(cache) = var("STEWARD_CACHE") {
            config.cache_dir = PathBuf::from(cache);
        }
        if let Some(addr) = var("STEWARD_ADDR") {
            config.addr = addr;
        }
        if let Some(level) = var("STEWARD_LOG") {
            config.log_level = level;
        }
        if let Some(lazy) = var("STEWARD_LAZY_LOAD") {
            config.lazy_load = parse_bool(&lazy)
                .with_context(|| format!("STEWARD_LAZY_LOAD={}", lazy))?;
        }
        if let Some(secs) = var("STEWARD_TELEMETRY_INTERVAL_SECS") {
            config.telemetry_interval = parse_secs(&secs)
                .with_context(|| format!("STEWARD_TELEMETRY_INTERVAL_SECS={}", secs))?;
        }
        if let Some(cuda) = var("STEWARD_EXPECTED_CUDA") {
            config.expected_cuda = Some(cuda);
        }
        if let Some(engine) = var("STEWARD_ENGINE") {
            config.engine = engine.parse()?;
        }
        config.initial_token = var("HUGGINGFACE_TOKEN").map(|t| t.trim().to_string());

        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: ConfigFile =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;

        if let Some(cache) = file.cache_dir {
            self.cache_dir = if cache.is_relative() {
                self.config_dir.join(cache)
            } else {
                cache
            };
        }
        if let Some(addr) = file.addr {
            self.addr = addr;
        }
        if let Some(level) = file.log_level {
            self.log_level = level;
        }
        if let Some(lazy) = file.lazy_load {
            self.lazy_load = lazy;
        }
        if let Some(secs) = file.telemetry_interval_secs {
            self.telemetry_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = file.dependency_interval_secs {
            self.dependency_interval = Duration::from_secs(secs.max(1));
        }
        if file.expected_cuda.is_some() {
            self.expected_cuda = file.expected_cuda;
        }
        if let Some(engine) = file.engine {
            self.engine = engine;
        }
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("'{}' is not a boolean", other),
    }
}

fn parse_secs(raw: &str) -> Result<Duration> {
    let secs: u64 = raw.trim().parse()?;
    if secs == 0 {
        bail!("interval must be at least one second");
    }
    Ok(Duration::from_secs(secs))
}
