use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use steward_core::ResourceSpec;

const DEFAULT_RESOURCES: &str = include_str!("resources.toml");
const OVERRIDE_FILE: &str = "resources.toml";

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    resources: Vec<ResourceSpec>,
}

/// Ordered set of resource manifests.
#[derive(Debug, Clone)]
pub struct ResourceCatalog {
    resources: Vec<ResourceSpec>,
}

impl ResourceCatalog {
    /// Built-in defaults merged with `<config_dir>/resources.toml`.
    pub fn load(config_dir: impl AsRef<Path>) -> Result<Self> {
        let mut catalog = Self::builtin()?;

        let override_path = config_dir.as_ref().join(OVERRIDE_FILE);
        if override_path.exists() {
            let content = fs::read_to_string(&override_path)
                .with_context(|| format!("reading {}", override_path.display()))?;
            let parsed: CatalogFile = toml::from_str(&content)
                .with_context(|| format!("parsing {}", override_path.display()))?;
            catalog.merge(parsed.resources)?;
        }

        Ok(catalog)
    }

    pub fn builtin() -> Result<Self> {
        Self::from_toml(DEFAULT_RESOURCES).context("built-in resources.toml is invalid")
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let parsed: CatalogFile = toml::from_str(content)?;
        let mut catalog = Self {
            resources: Vec::new(),
        };
        catalog.merge(parsed.resources)?;
        Ok(catalog)
    }

    fn merge(&mut self, entries: Vec<ResourceSpec>) -> Result<()> {
        for entry in entries {
            if entry.name.trim().is_empty() {
                bail!("resource entry for repo '{}' has no name", entry.repo);
            }
            match self.resources.iter().position(|r| r.name == entry.name) {
                Some(pos) => self.resources[pos] = entry,
                None => self.resources.push(entry),
            }
        }
        Ok(())
    }

    pub fn resources(&self) -> &[ResourceSpec] {
        &self.resources
    }

    pub fn resolve(&self, name: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.name == name)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_has_the_three_resources() {
        let catalog = ResourceCatalog::builtin().unwrap();
        let names: Vec<_> = catalog.resources().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["llm", "asr", "diarizer"]);

        let asr = catalog.resolve("asr").unwrap();
        assert_eq!(asr.task, "speech-to-text");
        assert_eq!(asr.files, vec!["canary-1b-v2.nemo".to_string()]);
        let launch = asr.launch.as_ref().unwrap();
        assert_eq!(launch.port, 6000);
        assert_eq!(launch.endpoints[0].path, "/v1/audio/transcriptions");
    }

    #[test]
    fn override_file_replaces_and_appends() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(OVERRIDE_FILE),
            r#"
            [[resources]]
            name = "llm"
            repo = "Qwen/Qwen2.5-7B-Instruct"
            task = "chat-completion"

            [[resources]]
            name = "embedder"
            repo = "BAAI/bge-m3"
            task = "embedding"
            "#,
        )
        .unwrap();

        let catalog = ResourceCatalog::load(tmp.path()).unwrap();
        assert_eq!(catalog.resources().len(), 4);
        assert_eq!(catalog.resolve("llm").unwrap().repo, "Qwen/Qwen2.5-7B-Instruct");
        assert!(catalog.resolve("llm").unwrap().launch.is_none());
        assert_eq!(catalog.resources()[3].name, "embedder");
    }

    #[test]
    fn malformed_override_file_is_an_error_and_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(OVERRIDE_FILE);
        fs::write(&path, "[[resources]\nname = ").unwrap();

        let err = ResourceCatalog::load(tmp.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("parsing"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "[[resources]\nname = ");
    }
}
