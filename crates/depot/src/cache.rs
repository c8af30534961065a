use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use steward_core::ResourceSpec;
use walkdir::WalkDir;

/// Suffix of files that are still being written.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Root of the on-disk artifact cache.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_dir(&self, spec: &ResourceSpec) -> PathBuf {
        self.root.join(spec.cache_key())
    }
}

/// True when `dir` holds at least one complete, non-empty file.
pub fn has_artifacts(dir: &Path) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| {
            entry.file_type().is_file()
                && !is_partial(entry.path())
                && entry.metadata().map(|m| m.len() > 0).unwrap_or(false)
        })
}

fn is_partial(path: &Path) -> bool {
    path.to_string_lossy().ends_with(PARTIAL_SUFFIX)
}
