use serde::{Deserialize, Serialize};

/// Static description of one managed resource, as read from `resources.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    /// Artifact source identifier, e.g. `nvidia/canary-1b-v2`.
    pub repo: String,
    #[serde(default)]
    pub display_name: String,
    pub task: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub description: String,
    /// Restrict the download to these files. Empty means the whole repo.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub launch: Option<LaunchSpec>,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, repo: impl Into<String>, task: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            repo: repo.into(),
            task: task.into(),
            format: String::new(),
            description: String::new(),
            files: Vec::new(),
            launch: None,
        }
    }

    /// Directory name used for this resource inside the artifact cache,
    /// following the hub cache convention (`models--org--name`).
    pub fn cache_key(&self) -> String {
        format!("models--{}", self.repo.replace('/', "--"))
    }

    pub fn display_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

/// How the process engine starts the external server for a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

impl LaunchSpec {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub label: String,
    pub path: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_startup_timeout() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_flattens_the_repo_id() {
        let spec = ResourceSpec::new("asr", "nvidia/canary-1b-v2", "speech-to-text");
        assert_eq!(spec.cache_key(), "models--nvidia--canary-1b-v2");
    }

    #[test]
    fn launch_defaults_fill_in() {
        let spec: LaunchSpec = toml::from_str(
            r#"
            program = "vllm"
            port = 8000
            "#,
        )
        .unwrap();
        assert_eq!(spec.host, "127.0.0.1");
        assert_eq!(spec.health_path, "/health");
        assert_eq!(spec.startup_timeout_secs, 600);
        assert_eq!(spec.base_url(), "http://127.0.0.1:8000");
    }
}
