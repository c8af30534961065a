use std::fmt;
use thiserror::Error;

/// Errors surfaced by the lifecycle API.
///
/// Every variant carries a plain message so the value can be cloned and
/// handed to every caller that awaited the same in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StewardError {
    #[error("unknown resource '{0}'")]
    UnknownResource(String),

    #[error("resource '{0}' is already registered")]
    DuplicateResource(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("load failed: {0}")]
    Load(String),

    #[error("no compatible accelerator: {0}")]
    AcceleratorUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StewardError {
    /// The bare message without the category prefix. This is what ends up
    /// in `RuntimeStatus::last_error`.
    pub fn message(&self) -> &str {
        match self {
            StewardError::UnknownResource(m)
            | StewardError::DuplicateResource(m)
            | StewardError::Download(m)
            | StewardError::Load(m)
            | StewardError::AcceleratorUnavailable(m)
            | StewardError::Storage(m)
            | StewardError::Config(m) => m,
        }
    }

    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            StewardError::UnknownResource(_) => "unknown_resource",
            StewardError::DuplicateResource(_) => "duplicate_resource",
            StewardError::Download(_) => "download",
            StewardError::Load(_) => "load",
            StewardError::AcceleratorUnavailable(_) => "accelerator_unavailable",
            StewardError::Storage(_) => "storage",
            StewardError::Config(_) => "config",
        }
    }

    /// Re-tag a failure that happened during artifact sync. Errors that are
    /// already `Download` pass through untouched.
    pub fn into_download(self) -> Self {
        match self {
            StewardError::Download(_) => self,
            other => StewardError::Download(other.message().to_string()),
        }
    }

    /// Re-tag a failure that happened during engine initialization.
    /// Accelerator errors keep their own category.
    pub fn into_load(self) -> Self {
        match self {
            StewardError::Load(_) | StewardError::AcceleratorUnavailable(_) => self,
            other => StewardError::Load(other.message().to_string()),
        }
    }
}

impl From<std::io::Error> for StewardError {
    fn from(err: std::io::Error) -> Self {
        StewardError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StewardError>;

/// Non-fatal problem met while releasing a resource. Logged, never returned.
#[derive(Debug, Clone)]
pub struct ReleaseWarning {
    pub resource: String,
    pub detail: String,
}

impl fmt::Display for ReleaseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "release of '{}' was not clean: {}", self.resource, self.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_strips_the_category() {
        let err = StewardError::Load("boom".into());
        assert_eq!(err.message(), "boom");
        assert_eq!(err.to_string(), "load failed: boom");
    }

    #[test]
    fn retagging_keeps_accelerator_errors() {
        let err = StewardError::AcceleratorUnavailable("no gpu".into()).into_load();
        assert_eq!(err.kind(), "accelerator_unavailable");

        let err = StewardError::Storage("disk full".into()).into_download();
        assert_eq!(err, StewardError::Download("disk full".into()));
    }
}
